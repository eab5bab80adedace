use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::dto::progress::{SaveProgressRequest, Snapshot};

use super::{Credentials, GatewayError, GatewayResult, PersistenceGateway};

/// Gateway speaking the progress wire contract over HTTP.
///
/// - `GET  {base}/progress/{user}/{activity}` → 200 snapshot | 404 first run
/// - `POST {base}/progress/{user}` with `{activityType, state, sessionElapsedTime}` → 200 snapshot
/// - `GET  {base}/progress/{user}/{activity}/history` → 200 snapshots
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Arc<Url>,
}

impl HttpGateway {
    /// Gateway rooted at `base_url`; every request is bounded by `request_timeout`.
    pub fn new(base_url: &str, request_timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| GatewayError::ClientBuilder { source })?;

        let base_url = Url::parse(base_url).map_err(|_| GatewayError::InvalidUrl {
            url: base_url.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl {
                url: base_url.to_string(),
            });
        }

        Ok(Self {
            client,
            base_url: Arc::new(base_url),
        })
    }

    /// Append percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = (*self.base_url).clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidUrl {
                url: self.base_url.to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, credentials: &Credentials) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&credentials.token)
    }

    async fn send(builder: reqwest::RequestBuilder, path: &str) -> GatewayResult<Response> {
        builder
            .send()
            .await
            .map_err(|source| GatewayError::Network {
                path: path.to_string(),
                source,
            })
    }

    async fn decode<T: DeserializeOwned>(response: Response, path: &str) -> GatewayResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|source| GatewayError::Decode {
                path: path.to_string(),
                source,
            })
    }
}

/// Map a non-success status onto the gateway taxonomy.
async fn status_error(response: Response, path: &str) -> GatewayError {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::AuthMissing,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "malformed snapshot payload".into());
            GatewayError::Validation(message)
        }
        status => GatewayError::Server {
            path: path.to_string(),
            status,
        },
    }
}

impl PersistenceGateway for HttpGateway {
    fn load(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Option<Snapshot>>> {
        let gateway = self.clone();
        let credentials = credentials.clone();
        let activity_type = activity_type.to_string();
        Box::pin(async move {
            let url = gateway.endpoint(&[
                "progress",
                &credentials.identity.user_id,
                &activity_type,
            ])?;
            let path = url.path().to_string();
            let response =
                Self::send(gateway.request(Method::GET, url, &credentials), &path).await?;

            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => Self::decode(response, &path).await.map(Some),
                _ => Err(status_error(response, &path).await),
            }
        })
    }

    fn save(
        &self,
        credentials: &Credentials,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, GatewayResult<Snapshot>> {
        let gateway = self.clone();
        let credentials = credentials.clone();
        Box::pin(async move {
            let url = gateway.endpoint(&["progress", &credentials.identity.user_id])?;
            let path = url.path().to_string();
            let response = Self::send(
                gateway
                    .request(Method::POST, url, &credentials)
                    .json(&request),
                &path,
            )
            .await?;

            if response.status().is_success() {
                Self::decode(response, &path).await
            } else {
                Err(status_error(response, &path).await)
            }
        })
    }

    fn history(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Vec<Snapshot>>> {
        let gateway = self.clone();
        let credentials = credentials.clone();
        let activity_type = activity_type.to_string();
        Box::pin(async move {
            let url = gateway.endpoint(&[
                "progress",
                &credentials.identity.user_id,
                &activity_type,
                "history",
            ])?;
            let path = url.path().to_string();
            let response =
                Self::send(gateway.request(Method::GET, url, &credentials), &path).await?;

            match response.status() {
                StatusCode::NOT_FOUND => Ok(Vec::new()),
                status if status.is_success() => Self::decode(response, &path).await,
                _ => Err(status_error(response, &path).await),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Identity;

    #[test]
    fn endpoint_encodes_identity_segments() {
        let gateway =
            HttpGateway::new("http://localhost:8080/api/", Duration::from_secs(1)).unwrap();
        let url = gateway
            .endpoint(&["progress", "ada/lovelace@example.com", "quiz"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/progress/ada%2Flovelace@example.com/quiz"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(matches!(
            HttpGateway::new("mailto:ada@example.com", Duration::from_secs(1)),
            Err(GatewayError::InvalidUrl { .. })
        ));
        assert!(matches!(
            HttpGateway::new("not a url", Duration::from_secs(1)),
            Err(GatewayError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn bearer_token_is_attached() {
        let gateway = HttpGateway::new("http://localhost:8080", Duration::from_secs(1)).unwrap();
        let credentials = Credentials {
            identity: Identity::new("ada"),
            token: "secret".into(),
        };
        let url = gateway.endpoint(&["progress", "ada"]).unwrap();
        let request = gateway
            .request(Method::POST, url, &credentials)
            .build()
            .unwrap();
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer secret"
        );
        assert_eq!(request.url().path(), "/progress/ada");
    }
}

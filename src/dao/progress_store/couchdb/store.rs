use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode, Url};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    dao::{
        models::{ProgressEntity, ProgressKey, upsert_entity},
        progress_store::ProgressStore,
        storage::{StorageError, StorageResult},
    },
    dto::progress::{SaveProgressRequest, Snapshot},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{CouchProgressDocument, progress_doc_id},
};

/// Attempts made when another writer bumps the document revision under us.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Progress store persisting one CouchDB document per (user, activity).
#[derive(Clone)]
pub struct CouchProgressStore {
    client: Client,
    database_url: Arc<Url>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchProgressStore {
    /// Establish a connection to CouchDB and ensure the progress database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let raw = format!(
            "{}/{}/",
            config.base_url.trim_end_matches('/'),
            config.database
        );
        let database_url =
            Url::parse(&raw).map_err(|_| CouchDaoError::InvalidBaseUrl { url: raw.clone() })?;
        if database_url.cannot_be_a_base() {
            return Err(CouchDaoError::InvalidBaseUrl { url: raw });
        }

        let auth = config
            .credentials
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            database_url: Arc::new(database_url),
            auth,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn document_url(&self, doc_id: &str) -> Url {
        let mut url = (*self.database_url).clone();
        // `connect` rejected cannot-be-a-base URLs, so segments are always available.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(doc_id);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let url = (*self.database_url).clone();
        let path = url.path().to_string();

        let response = self
            .request(Method::GET, url.clone())
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .request(Method::PUT, url)
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::RequestSend {
                        path: path.clone(),
                        source,
                    })?;
                // 412 means another instance created it in the meantime.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::RequestStatus {
                        path,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::RequestStatus {
                path,
                status: other,
            }),
        }
    }

    async fn get_document(&self, doc_id: &str) -> CouchResult<Option<CouchProgressDocument>> {
        let response = self
            .request(Method::GET, self.document_url(doc_id))
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<CouchProgressDocument>()
                .await
                .map(Some)
                .map_err(|source| CouchDaoError::DecodeResponse {
                    path: doc_id.to_string(),
                    source,
                }),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document(&self, document: &CouchProgressDocument) -> CouchResult<()> {
        let response = self
            .request(Method::PUT, self.document_url(&document.id))
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: document.id.clone(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(CouchDaoError::RevisionConflict {
                path: document.id.clone(),
            }),
            other => Err(CouchDaoError::RequestStatus {
                path: document.id.clone(),
                status: other,
            }),
        }
    }

    /// Read-modify-write of one record, retried when CouchDB reports a revision conflict.
    async fn upsert_with_retry(
        &self,
        key: ProgressKey,
        request: SaveProgressRequest,
    ) -> StorageResult<Snapshot> {
        let doc_id = progress_doc_id(&key);

        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let existing = self.get_document(&doc_id).await?;
            let rev = existing.as_ref().and_then(|doc| doc.rev.clone());
            let entity = upsert_entity(
                existing.map(ProgressEntity::from),
                &key,
                request.clone(),
                OffsetDateTime::now_utc(),
            );
            let snapshot = entity.current.clone();
            let document = CouchProgressDocument::from((key.clone(), entity, rev));

            match self.put_document(&document).await {
                Ok(()) => return Ok(snapshot),
                Err(CouchDaoError::RevisionConflict { .. }) => {
                    debug!(doc_id = %doc_id, attempt, "progress document revision conflict; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StorageError::Contended {
            key: doc_id,
            attempts: MAX_CONFLICT_RETRIES,
        })
    }
}

impl ProgressStore for CouchProgressStore {
    fn find(&self, key: ProgressKey) -> BoxFuture<'static, StorageResult<Option<ProgressEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc_id = progress_doc_id(&key);
            let maybe_doc = store.get_document(&doc_id).await?;
            Ok(maybe_doc.map(ProgressEntity::from))
        })
    }

    fn upsert(
        &self,
        key: ProgressKey,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, StorageResult<Snapshot>> {
        let store = self.clone();
        Box::pin(async move { store.upsert_with_retry(key, request).await })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let url = (*store.database_url).clone();
            let path = url.path().to_string();
            let response = store
                .request(Method::GET, url)
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: path.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}

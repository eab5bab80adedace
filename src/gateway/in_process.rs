use std::sync::Arc;

use futures::future::BoxFuture;
use validator::Validate;

use crate::{
    dao::{
        models::ProgressKey,
        progress_store::{MemoryProgressStore, ProgressStore},
    },
    dto::progress::{SaveProgressRequest, Snapshot},
};

use super::{Credentials, GatewayError, GatewayResult, PersistenceGateway};

/// Gateway calling a progress store directly, without HTTP. Used for offline play, demos and
/// tests; it applies the same payload validation and upsert rule as the server.
#[derive(Clone)]
pub struct InProcessGateway {
    store: Arc<dyn ProgressStore>,
}

impl InProcessGateway {
    /// Gateway over `store`.
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Gateway over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryProgressStore::new()))
    }

    /// Store behind this gateway.
    pub fn store(&self) -> Arc<dyn ProgressStore> {
        self.store.clone()
    }
}

impl PersistenceGateway for InProcessGateway {
    fn load(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Option<Snapshot>>> {
        let find = self.store.find(ProgressKey::new(
            credentials.identity.user_id.clone(),
            activity_type,
        ));
        Box::pin(async move { Ok(find.await?.map(|entity| entity.current)) })
    }

    fn save(
        &self,
        credentials: &Credentials,
        request: SaveProgressRequest,
    ) -> BoxFuture<'static, GatewayResult<Snapshot>> {
        if let Err(errors) = request.validate() {
            return Box::pin(std::future::ready(Err(GatewayError::Validation(
                errors.to_string(),
            ))));
        }

        let key = ProgressKey::new(
            credentials.identity.user_id.clone(),
            request.activity_type.clone(),
        );
        let upsert = self.store.upsert(key, request);
        Box::pin(async move { Ok(upsert.await?) })
    }

    fn history(
        &self,
        credentials: &Credentials,
        activity_type: &str,
    ) -> BoxFuture<'static, GatewayResult<Vec<Snapshot>>> {
        let find = self.store.find(ProgressKey::new(
            credentials.identity.user_id.clone(),
            activity_type,
        ));
        Box::pin(async move {
            Ok(find
                .await?
                .map(|entity| entity.history)
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::gateway::Identity;

    fn credentials(user: &str) -> Credentials {
        Credentials {
            identity: Identity::new(user),
            token: "token".into(),
        }
    }

    #[tokio::test]
    async fn quiz_scenario_accumulates_total() {
        let gateway = InProcessGateway::in_memory();
        let ada = credentials("ada");

        assert_eq!(gateway.load(&ada, "quiz").await.unwrap(), None);

        let first = gateway
            .save(&ada, SaveProgressRequest::new("quiz", json!({"score": 10}), 120))
            .await
            .unwrap();
        assert_eq!(first.total_elapsed_time, 120);

        let second = gateway
            .save(&ada, SaveProgressRequest::new("quiz", json!({"score": 25}), 60))
            .await
            .unwrap();
        assert_eq!(second.total_elapsed_time, 180);
        assert!(second.total_elapsed_time >= first.total_elapsed_time);
        assert!(second.saved_at > first.saved_at);

        let loaded = gateway.load(&ada, "quiz").await.unwrap().unwrap();
        assert_eq!(loaded, second);

        let history = gateway.history(&ada, "quiz").await.unwrap();
        assert_eq!(history, vec![second, first]);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let gateway = InProcessGateway::in_memory();
        let err = gateway
            .save(
                &credentials("ada"),
                SaveProgressRequest::new("quiz", json!([1, 2, 3]), 5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(
            gateway
                .load(&credentials("ada"), "quiz")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn history_of_unknown_activity_is_empty() {
        let gateway = InProcessGateway::in_memory();
        assert!(
            gateway
                .history(&credentials("ada"), "farm")
                .await
                .unwrap()
                .is_empty()
        );
    }
}

use serde::{Deserialize, Serialize};

use crate::dao::models::{ProgressEntity, ProgressKey};

pub const PROGRESS_PREFIX: &str = "progress::";

/// CouchDB document wrapping one progress record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchProgressDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub progress: ProgressEntity,
}

impl From<(ProgressKey, ProgressEntity, Option<String>)> for CouchProgressDocument {
    fn from((key, progress, rev): (ProgressKey, ProgressEntity, Option<String>)) -> Self {
        Self {
            id: progress_doc_id(&key),
            rev,
            progress,
        }
    }
}

impl From<CouchProgressDocument> for ProgressEntity {
    fn from(doc: CouchProgressDocument) -> Self {
        doc.progress
    }
}

/// Document id for a progress record. Identities may contain `:`; the activity type never
/// does, so the last separator splits the pair unambiguously.
pub fn progress_doc_id(key: &ProgressKey) -> String {
    format!("{}{}::{}", PROGRESS_PREFIX, key.user_id, key.activity_type)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;
    use crate::dto::progress::SaveProgressRequest;

    #[test]
    fn document_flattens_entity_and_omits_missing_rev() {
        let key = ProgressKey::new("ada@example.com", "quiz");
        let entity = ProgressEntity::first_save(
            "ada@example.com",
            SaveProgressRequest::new("quiz", json!({"score": 1}), 5),
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        );
        let doc = CouchProgressDocument::from((key, entity.clone(), None));
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["_id"], "progress::ada@example.com::quiz");
        assert!(value.get("_rev").is_none());
        assert_eq!(value["user_id"], "ada@example.com");

        let decoded: CouchProgressDocument = serde_json::from_value(value).unwrap();
        assert_eq!(ProgressEntity::from(decoded), entity);
    }
}

//! Resumable search checkpoints
//!
//! Callers see a checkpoint only as an opaque string: URL-safe base64 of a
//! small JSON document. An empty string means the search is complete.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::backend::ContinuationToken;
use crate::error::{AuditError, AuditResult};
use crate::types::{ItemKey, Order};

/// Exact resume position of a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Partition (`CreatedAtDate`) to resume in
    pub date: String,

    /// Continuation that re-fetches the page holding the resume point;
    /// `None` starts at the beginning of the partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<ContinuationToken>,

    /// Last item already delivered from that page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_key: Option<ItemKey>,

    pub order: Order,
}

impl Checkpoint {
    /// Resume at the start of a partition
    pub fn at_partition(date: impl Into<String>, order: Order) -> Self {
        Self {
            date: date.into(),
            iterator: None,
            event_key: None,
            order,
        }
    }

    pub fn encode(&self) -> AuditResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a caller-supplied token; the empty token decodes to `None`.
    pub fn decode(token: &str) -> AuditResult<Option<Self>> {
        if token.is_empty() {
            return Ok(None);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|e| AuditError::CheckpointInvalid(format!("not base64: {}", e)))?;
        let checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| AuditError::CheckpointInvalid(format!("bad document: {}", e)))?;
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_means_start() {
        assert_eq!(Checkpoint::decode("").unwrap(), None);
    }

    #[test]
    fn test_token_is_opaque_and_stable() {
        let checkpoint = Checkpoint {
            date: "2021-04-10".to_string(),
            iterator: Some(ContinuationToken::new("page-2")),
            event_key: Some(ItemKey::new("sid", 3)),
            order: Order::Descending,
        };

        let token = checkpoint.encode().unwrap();
        assert!(!token.contains('{'));
        assert!(!token.contains('='));
        assert_eq!(Checkpoint::decode(&token).unwrap(), Some(checkpoint));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = Checkpoint::decode("%%%").unwrap_err();
        assert!(err.is_checkpoint_invalid());

        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        let err = Checkpoint::decode(&not_json).unwrap_err();
        assert!(err.is_checkpoint_invalid());
    }
}

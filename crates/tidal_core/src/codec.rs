//! Row encoding and key layout for persisted state.
//!
//! Rows are CBOR. Keys are UTF-8 paths:
//!
//! ```text
//! e/<entity_type>/<entity_id>   cached entity
//! m/<entity_type>/refreshed     last full refresh of a type
//! q/<op_id>                     queued operation
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::OpId;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Key prefix shared by all queued operations.
pub const OP_PREFIX: &[u8] = b"q/";

/// Returns the key of a cached entity.
#[must_use]
pub fn entity_key(entity_type: &str, entity_id: &str) -> Vec<u8> {
    format!("e/{entity_type}/{entity_id}").into_bytes()
}

/// Returns the key prefix of every entity of one type.
#[must_use]
pub fn entity_prefix(entity_type: &str) -> Vec<u8> {
    format!("e/{entity_type}/").into_bytes()
}

/// Returns the key of a type's refresh stamp.
#[must_use]
pub fn refreshed_key(entity_type: &str) -> Vec<u8> {
    format!("m/{entity_type}/refreshed").into_bytes()
}

/// Returns the key of a queued operation.
#[must_use]
pub fn op_key(op_id: &OpId) -> Vec<u8> {
    format!("q/{op_id}").into_bytes()
}

pub(crate) fn encode_row<S: Serialize>(value: &S) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_row<D: DeserializeOwned>(bytes: &[u8]) -> CoreResult<D> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::CachedEntity;
    use crate::types::Timestamp;

    #[test]
    fn key_layout() {
        assert_eq!(entity_key("product", "p1"), b"e/product/p1".to_vec());
        assert!(entity_key("product", "p1").starts_with(&entity_prefix("product")));
        assert!(!entity_key("productx", "p1").starts_with(&entity_prefix("product")));
        assert_eq!(refreshed_key("order"), b"m/order/refreshed".to_vec());
        assert!(op_key(&OpId::new()).starts_with(OP_PREFIX));
    }

    #[test]
    fn entity_row_decodes() {
        let entity = CachedEntity::synced(
            "p1",
            serde_json::json!({"price": 100}),
            "etag-1",
            Timestamp::from_millis(42),
        );
        let bytes = encode_row(&entity).unwrap();
        let decoded: CachedEntity<serde_json::Value> = decode_row(&bytes).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let result: CoreResult<CachedEntity<String>> = decode_row(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::Codec { .. })));
    }
}

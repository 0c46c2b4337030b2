//! Collision-resistant identifiers for layers and containers.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A new v1 layer id: 64 lowercase hex characters.
///
/// Mixes a random UUID with the current time and process id, so ids stay unique
/// across processes importing into the same repository.
pub fn layer_v1() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    hasher.update(std::process::id().to_le_bytes());
    hex::encode(hasher.finalize())
}

pub fn container_id() -> String {
    Uuid::new_v4().to_string()
}

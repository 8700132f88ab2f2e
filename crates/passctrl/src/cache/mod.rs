pub mod memory;

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::Outcome;

/// Stable content hash used for cache-key components.
pub fn sha256_hex(data: &str) -> String {
	let digest = ring::digest::digest(&ring::digest::SHA256, data.as_bytes());
	hex::encode(digest.as_ref())
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
	#[error("cache backend: {0}")]
	Backend(String),
	#[error("cache entry: {0}")]
	Encoding(#[from] serde_json::Error),
}

/// What the decision cache stores per key. For endpoint-level entries the
/// decision field is the outcome itself; per-rule entries pack a richer
/// serialized record into the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDecision {
	pub decision: String,
	pub status: u16,
	pub message: String,
	pub stored_at: SystemTime,
	pub expires_at: SystemTime,
}

impl StoredDecision {
	pub fn expired(&self, now: SystemTime) -> bool {
		now >= self.expires_at
	}
}

/// The process-wide decision cache. The only collaborator shared across
/// concurrent requests; implementations provide atomic get/put.
#[async_trait::async_trait]
pub trait DecisionCache: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<StoredDecision>, CacheError>;
	async fn put(&self, key: String, entry: StoredDecision) -> Result<(), CacheError>;
}

/// The per-rule payload, carried as an opaque blob in the decision field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCacheEntry {
	pub outcome: Outcome,
	pub reason: String,
	pub exported: BTreeMap<String, serde_json::Value>,
	pub headers: BTreeMap<String, String>,
	pub stored_at: SystemTime,
	pub expires_at: SystemTime,
}

impl RuleCacheEntry {
	pub fn pack(&self) -> Result<StoredDecision, CacheError> {
		Ok(StoredDecision {
			decision: serde_json::to_string(self)?,
			status: 0,
			message: String::new(),
			stored_at: self.stored_at,
			expires_at: self.expires_at,
		})
	}

	pub fn unpack(stored: &StoredDecision) -> Result<Self, CacheError> {
		Ok(serde_json::from_str(&stored.decision)?)
	}
}

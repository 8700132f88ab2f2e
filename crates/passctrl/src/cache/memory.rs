use std::collections::HashMap;
use std::time::SystemTime;

use tokio::sync::Mutex;

use super::{CacheError, DecisionCache, StoredDecision};

const SWEEP_THRESHOLD: usize = 4096;

/// Default in-process decision cache. Expired entries are dropped on read
/// and swept when the map grows past a threshold.
#[derive(Default)]
pub struct MemoryDecisionCache {
	entries: Mutex<HashMap<String, StoredDecision>>,
}

impl MemoryDecisionCache {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl DecisionCache for MemoryDecisionCache {
	async fn get(&self, key: &str) -> Result<Option<StoredDecision>, CacheError> {
		let now = SystemTime::now();
		let mut entries = self.entries.lock().await;
		match entries.get(key) {
			Some(e) if e.expired(now) => {
				entries.remove(key);
				Ok(None)
			},
			Some(e) => Ok(Some(e.clone())),
			None => Ok(None),
		}
	}

	async fn put(&self, key: String, entry: StoredDecision) -> Result<(), CacheError> {
		let mut entries = self.entries.lock().await;
		if entries.len() >= SWEEP_THRESHOLD {
			let now = SystemTime::now();
			entries.retain(|_, e| !e.expired(now));
		}
		entries.insert(key, entry);
		Ok(())
	}
}

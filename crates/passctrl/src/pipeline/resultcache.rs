use std::cmp;
use std::sync::Arc;
use std::time::SystemTime;

use super::state::State;
use super::{Agent, AgentReport};
use crate::cache::{DecisionCache, StoredDecision};
use crate::types::{CompiledConfig, Outcome};
use crate::warn;

/// Opportunistic endpoint-level store: when the endpoint opts in and the
/// deciding rule did not object, the composed decision is cached under
/// the base key. Errors never cache.
pub struct ResultCachingAgent {
	config: Arc<CompiledConfig>,
	cache: Arc<dyn DecisionCache>,
}

impl ResultCachingAgent {
	pub fn new(config: Arc<CompiledConfig>, cache: Arc<dyn DecisionCache>) -> Self {
		ResultCachingAgent { config, cache }
	}
}

#[async_trait::async_trait]
impl Agent for ResultCachingAgent {
	fn name(&self) -> &'static str {
		"resultcache"
	}

	async fn evaluate(&self, state: &mut State) -> AgentReport {
		let Some(endpoint_cache) = &state.endpoint.cache else {
			return AgentReport::new(self.name(), "skipped", "endpoint caching not enabled");
		};
		if !matches!(state.rule.outcome, Outcome::Pass | Outcome::Fail) {
			return AgentReport::new(self.name(), "skipped", "error outcomes bypass caching");
		}
		let Some(decisive) = state.rule.history.last() else {
			// Either a restored endpoint-level decision or no rule ran;
			// nothing new to store.
			return AgentReport::new(self.name(), "skipped", "no decisive rule");
		};
		let requested = state
			.endpoint
			.rules
			.iter()
			.find(|r| r.name == decisive.name)
			.map(|r| r.responses.get(state.rule.outcome).endpoint_cache)
			.unwrap_or(false);
		if !requested {
			return AgentReport::new(self.name(), "skipped", "rule declined endpoint caching");
		}

		let ttl = cmp::min(self.config.server.max_ttl, endpoint_cache.ttl);
		if ttl.is_zero() {
			return AgentReport::new(self.name(), "skipped", "zero ttl");
		}
		let now = SystemTime::now();
		let entry = StoredDecision {
			decision: state.rule.outcome.as_str().to_string(),
			status: state.response.status,
			message: state.response.message.clone(),
			stored_at: now,
			expires_at: now + ttl,
		};
		match self.cache.put(state.cache_key(), entry).await {
			Ok(()) => AgentReport::new(self.name(), "stored", "endpoint decision cached"),
			Err(e) => {
				warn!(error = %e, "endpoint cache store failed");
				AgentReport::new(self.name(), "skipped", "cache store failed")
			},
		}
	}
}

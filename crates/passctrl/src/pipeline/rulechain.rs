use std::sync::Arc;

use super::state::{ExecutionPlan, State};
use super::{Agent, AgentReport};
use crate::cache::DecisionCache;
use crate::types::Outcome;
use crate::warn;

/// Plans rule execution: short-circuits failed admissions, restores a
/// decisive endpoint-level cache entry, or emits the execution plan.
pub struct RuleChainAgent {
	cache: Arc<dyn DecisionCache>,
}

impl RuleChainAgent {
	pub fn new(cache: Arc<dyn DecisionCache>) -> Self {
		RuleChainAgent { cache }
	}
}

#[async_trait::async_trait]
impl Agent for RuleChainAgent {
	fn name(&self) -> &'static str {
		"rulechain"
	}

	async fn evaluate(&self, state: &mut State) -> AgentReport {
		if !state.admission.authenticated {
			state.rule.outcome = Outcome::Fail;
			state.rule.reason = state.admission.reason.clone();
			state.plan = Some(ExecutionPlan {
				rules: Vec::new(),
				should_execute: false,
			});
			return AgentReport::new(self.name(), "short_circuited", "admission failed");
		}

		if state.endpoint.cache.is_some() {
			let key = state.cache_key();
			match self.cache.get(&key).await {
				Ok(Some(entry)) => {
					if let Ok(outcome) = entry.decision.parse::<Outcome>()
						&& outcome.is_decisive()
					{
						state.cache.key = key;
						state.cache.hit = true;
						state.cache.decision = entry.decision.clone();
						state.cache.stored_at = Some(entry.stored_at);
						state.cache.expires_at = Some(entry.expires_at);
						state.rule.outcome = outcome;
						state.rule.reason = "endpoint decision restored from cache".to_string();
						state.rule.from_cache = true;
						state.response.message = entry.message;
						if entry.status != 0 {
							state.response.status = entry.status;
						}
						state.plan = Some(ExecutionPlan {
							rules: Vec::new(),
							should_execute: false,
						});
						return AgentReport::new(self.name(), "cached", "endpoint decision cached");
					}
				},
				Ok(None) => {},
				Err(e) => {
					warn!(error = %e, "endpoint cache lookup failed, continuing");
				},
			}
		}

		state.plan = Some(ExecutionPlan {
			rules: state.endpoint.rules.clone(),
			should_execute: true,
		});
		AgentReport::new(self.name(), "ready", "execution plan emitted")
	}
}

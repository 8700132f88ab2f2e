pub mod auth;
pub mod backend;
pub mod cachekey;

use std::cmp;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use super::state::{HistoryEntry, State};
use super::{Agent, AgentReport};
use crate::cache::{DecisionCache, RuleCacheEntry};
use crate::client::Client;
use crate::types::{CompiledConfig, Outcome, RuleDefinition};
use crate::warn;

/// Evaluates the planned rules in order, stopping at the first
/// non-pass. Owns backend invocation, per-rule caching, and variable and
/// condition evaluation.
pub struct RuleExecutionAgent {
	config: Arc<CompiledConfig>,
	cache: Arc<dyn DecisionCache>,
	client: Client,
}

impl RuleExecutionAgent {
	pub fn new(config: Arc<CompiledConfig>, cache: Arc<dyn DecisionCache>, client: Client) -> Self {
		RuleExecutionAgent {
			config,
			cache,
			client,
		}
	}
}

#[async_trait::async_trait]
impl Agent for RuleExecutionAgent {
	fn name(&self) -> &'static str {
		"ruleexec"
	}

	async fn evaluate(&self, state: &mut State) -> AgentReport {
		let rules = state
			.plan
			.as_ref()
			.map(|p| p.rules.clone())
			.unwrap_or_default();
		if rules.is_empty() {
			state.rule.outcome = Outcome::Pass;
			state.rule.reason = "no rules defined".to_string();
			state.rule.executed = true;
			return AgentReport::new(self.name(), "pass", "no rules defined");
		}

		for rule in &rules {
			let started = Instant::now();
			reset_rule_state(state);
			self.run_rule(rule, state).await;

			let mut union = state.rule.variables.local.clone();
			union.extend(state.rule.variables.exported.clone());
			state.rule.variables.rule = union;
			state.rule.from_cache = state.cache.hit;
			state.rule.history.push(HistoryEntry {
				name: rule.name.clone(),
				outcome: state.rule.outcome,
				reason: state.rule.reason.clone(),
				duration: started.elapsed(),
				variables: state.rule.variables.rule.clone(),
				from_cache: state.cache.hit,
			});
			if state.rule.outcome != Outcome::Pass {
				break;
			}
		}
		state.rule.executed = true;
		AgentReport::new(
			self.name(),
			state.rule.outcome.as_str(),
			state.rule.reason.clone(),
		)
	}
}

impl RuleExecutionAgent {
	async fn run_rule(&self, rule: &Arc<RuleDefinition>, state: &mut State) {
		let templates = self.config.templates.clone();

		// Authentication matching.
		let Some(selected) = auth::select_group(rule, &state.admission.credentials) else {
			state.rule.outcome = Outcome::Fail;
			state.rule.reason = "rule authentication did not match any credential".to_string();
			self.finish_rule(rule, state).await;
			return;
		};
		state.rule.auth.matcher = selected.matcher.clone();
		state.rule.auth.input = selected.input.clone();
		state.rule.auth.forward = auth::forward_descriptors(&selected);

		// Backend request rendering.
		let rendered = match &rule.backend {
			Some(spec) => {
				match backend::render_request(rule, spec, &selected, state, &templates) {
					Ok(r) => Some(r),
					Err(e) => {
						state.rule.outcome = Outcome::Error;
						state.rule.reason = e.to_string();
						self.finish_rule(rule, state).await;
						return;
					},
				}
			},
			None => None,
		};

		// Per-rule cache lookup.
		let cache_cfg = rule
			.backend
			.as_ref()
			.map(|b| b.cache.clone())
			.unwrap_or_default();
		let key = cachekey::rule_cache_key(
			&state.cache_key(),
			&rule.name,
			rendered.as_ref(),
			&cache_cfg,
			&self.config.server.correlation_header,
			&state.variables.rules,
		);
		state.cache.key = key.clone();
		match self.cache.get(&key).await {
			Ok(Some(stored)) => match RuleCacheEntry::unpack(&stored) {
				Ok(entry) => {
					restore_from_cache(rule, entry, state);
					return;
				},
				Err(e) => warn!(error = %e, rule = %rule.name, "discarding undecodable cache entry"),
			},
			Ok(None) => {},
			Err(e) => warn!(error = %e, rule = %rule.name, "rule cache lookup failed, continuing"),
		}

		// Backend invocation.
		if let (Some(spec), Some(rendered)) = (&rule.backend, &rendered) {
			if let Err(e) = backend::invoke(&self.client, spec, rendered, state).await {
				state.backend.error = Some(e.to_string());
				state.rule.outcome = Outcome::Error;
				state.rule.reason = e.to_string();
				self.finish_rule(rule, state).await;
				return;
			}
		} else {
			state.backend.accepted = true;
		}

		// Variables, in sorted-name order; earlier results are visible to
		// later expressions.
		for (name, prog) in &rule.variables {
			let ctx = state.eval_context();
			match prog.eval(&templates, &ctx) {
				Ok(v) => {
					state.rule.variables.local.insert(name.clone(), v);
				},
				Err(e) => {
					state.rule.outcome = Outcome::Error;
					state.rule.reason = format!("variable {name} evaluation failed: {e}");
					self.finish_rule(rule, state).await;
					return;
				},
			}
		}

		// Conditions: error, then fail, then pass.
		let (outcome, reason) = self.decide(rule, state);
		state.rule.outcome = outcome;
		state.rule.reason = reason;

		self.finish_rule(rule, state).await;
	}

	fn decide(&self, rule: &RuleDefinition, state: &State) -> (Outcome, String) {
		let templates = &self.config.templates;
		let ctx = state.eval_context();
		for p in &rule.conditions.error {
			match p.eval_bool(templates, &ctx) {
				Ok(true) => return (Outcome::Error, "error condition matched".to_string()),
				Ok(false) => {},
				Err(e) => {
					return (
						Outcome::Error,
						format!("condition evaluation failed: {e}"),
					);
				},
			}
		}
		for p in &rule.conditions.fail {
			match p.eval_bool(templates, &ctx) {
				Ok(true) => return (Outcome::Fail, "fail condition matched".to_string()),
				Ok(false) => {},
				Err(e) => {
					return (
						Outcome::Error,
						format!("condition evaluation failed: {e}"),
					);
				},
			}
		}
		if !rule.conditions.pass.is_empty() {
			for p in &rule.conditions.pass {
				match p.eval_bool(templates, &ctx) {
					Ok(true) => {},
					Ok(false) => return (Outcome::Fail, "pass condition not met".to_string()),
					Err(e) => {
						return (
							Outcome::Error,
							format!("condition evaluation failed: {e}"),
						);
					},
				}
			}
			(Outcome::Pass, "all pass conditions matched".to_string())
		} else if state.backend.accepted {
			let reason = if rule.backend.is_some() {
				"backend accepted".to_string()
			} else {
				"no backend configured".to_string()
			};
			(Outcome::Pass, reason)
		} else {
			(
				Outcome::Fail,
				format!("backend returned unaccepted status {}", state.backend.status),
			)
		}
	}

	/// Per-outcome response resolution: exported variables, response
	/// headers, and the cache store. Export and store failures are logged,
	/// never surfaced; the decision must survive them.
	async fn finish_rule(&self, rule: &Arc<RuleDefinition>, state: &mut State) {
		let templates = &self.config.templates;
		let outcome = state.rule.outcome;
		let resp = rule.responses.get(outcome);
		let ctx = state.eval_context();

		let mut exported = std::collections::BTreeMap::new();
		for (name, prog) in &resp.export {
			match prog.eval(templates, &ctx) {
				Ok(v) => {
					exported.insert(name.clone(), v);
				},
				Err(e) => {
					warn!(error = %e, rule = %rule.name, variable = %name, "export evaluation failed")
				},
			}
		}
		state.rule.variables.exported = exported.clone();
		state
			.variables
			.rules
			.insert(rule.name.clone(), exported.clone());
		state.response.variables.extend(exported.clone());

		// Header templates see the exports that were just stored.
		let ctx = state.eval_context();
		let mut rendered_headers = std::collections::BTreeMap::new();
		for (name, t) in &resp.headers.custom {
			match t.render(templates, &ctx) {
				Ok(v) => {
					rendered_headers.insert(name.to_ascii_lowercase(), v);
				},
				Err(e) => {
					warn!(error = %e, rule = %rule.name, header = %name, "response header render failed")
				},
			}
		}
		state
			.response
			.headers
			.extend(rendered_headers.clone().into_iter());

		// Store pass and fail, never error.
		if !matches!(outcome, Outcome::Pass | Outcome::Fail) {
			return;
		}
		if state.cache.key.is_empty() || state.cache.hit {
			return;
		}
		let mut ttl = cmp::min(self.config.server.max_ttl, resp.ttl);
		if let Some(endpoint_cache) = &state.endpoint.cache {
			ttl = cmp::min(ttl, endpoint_cache.ttl);
		}
		if rule
			.backend
			.as_ref()
			.map(|b| b.cache.follow_cache_control)
			.unwrap_or(false)
			&& let Some(cc) = state.backend.headers.get("cache-control")
			&& let Some(max_age) = cachekey::cache_control_max_age(cc)
		{
			ttl = cmp::min(ttl, Duration::from_secs(max_age));
		}
		if ttl.is_zero() {
			return;
		}
		let now = SystemTime::now();
		let entry = RuleCacheEntry {
			outcome,
			reason: state.rule.reason.clone(),
			exported,
			headers: rendered_headers,
			stored_at: now,
			expires_at: now + ttl,
		};
		match entry.pack() {
			Ok(packed) => match self.cache.put(state.cache.key.clone(), packed).await {
				Ok(()) => {
					state.cache.stored_this_run = true;
					state.cache.decision = outcome.as_str().to_string();
					state.cache.stored_at = Some(now);
					state.cache.expires_at = Some(now + ttl);
				},
				Err(e) => warn!(error = %e, rule = %rule.name, "rule cache store failed"),
			},
			Err(e) => warn!(error = %e, rule = %rule.name, "rule cache entry encoding failed"),
		}
	}
}

fn reset_rule_state(state: &mut State) {
	state.backend = Default::default();
	state.cache = Default::default();
	state.rule.auth = Default::default();
	state.rule.variables.rule.clear();
	state.rule.variables.local.clear();
	state.rule.variables.exported.clear();
	state.rule.outcome = Outcome::Unset;
	state.rule.reason.clear();
	state.rule.from_cache = false;
}

fn restore_from_cache(rule: &Arc<RuleDefinition>, entry: RuleCacheEntry, state: &mut State) {
	state.rule.outcome = entry.outcome;
	state.rule.reason = entry.reason.clone();
	state.rule.variables.exported = entry.exported.clone();
	state
		.variables
		.rules
		.insert(rule.name.clone(), entry.exported.clone());
	state.response.variables.extend(entry.exported.clone());
	state
		.response
		.headers
		.extend(entry.headers.clone().into_iter());
	state.cache.hit = true;
	state.cache.decision = entry.outcome.as_str().to_string();
	state.cache.stored_at = Some(entry.stored_at);
	state.cache.expires_at = Some(entry.expires_at);
	state.rule.from_cache = true;
}

use std::collections::BTreeMap;
use std::sync::Arc;

use super::state::State;
use super::{Agent, AgentReport};
use crate::types::{CompiledConfig, Outcome, RuleDefinition};
use crate::warn;

pub const OUTCOME_HEADER: &str = "x-passctrl-outcome";

// Hop-by-hop and entity framing headers never propagate from backends;
// the gateway writes its own body.
const NON_PROPAGATED: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
	"content-length",
	"content-type",
];

/// Maps the final outcome to a status code, merges response headers, and
/// renders the body.
pub struct ResponsePolicyAgent {
	config: Arc<CompiledConfig>,
}

impl ResponsePolicyAgent {
	pub fn new(config: Arc<CompiledConfig>) -> Self {
		ResponsePolicyAgent { config }
	}

	fn decisive_rule(&self, state: &State) -> Option<Arc<RuleDefinition>> {
		let name = &state.rule.history.last()?.name;
		state
			.endpoint
			.rules
			.iter()
			.find(|r| &r.name == name)
			.cloned()
	}
}

#[async_trait::async_trait]
impl Agent for ResponsePolicyAgent {
	fn name(&self) -> &'static str {
		"response"
	}

	async fn evaluate(&self, state: &mut State) -> AgentReport {
		let outcome = state.rule.outcome;

		// A status set earlier (the admission challenge, or a restored
		// endpoint-level decision) takes precedence over the outcome map.
		let status = if state.response.status != 0 {
			state.response.status
		} else {
			match outcome {
				Outcome::Pass => 200,
				Outcome::Fail => 403,
				Outcome::Error | Outcome::Unset => 502,
			}
		};
		// Stored before templates render so `response.status` is visible to
		// them.
		state.response.status = status;

		let mut merged: BTreeMap<String, String> = BTreeMap::new();
		for (name, value) in &state.backend.headers {
			if NON_PROPAGATED.contains(&name.as_str()) {
				continue;
			}
			merged.entry(name.clone()).or_insert_with(|| value.clone());
		}
		merged.extend(state.response.headers.clone());

		let ctx = state.eval_context();
		let templates = &self.config.templates;
		let decisive = self.decisive_rule(state);
		let mut message = state.response.message.clone();

		if let Some(rule) = &decisive {
			let policy = &rule.responses.get(outcome).headers;
			if !policy.allow.is_empty() && !policy.allows_all() {
				merged.retain(|name, _| policy.allow.iter().any(|a| a.eq_ignore_ascii_case(name)));
			}
			for name in &policy.strip {
				merged.remove(&name.to_ascii_lowercase());
			}
			for (name, t) in &policy.custom {
				match t.render(templates, &ctx) {
					Ok(v) => {
						merged.insert(name.to_ascii_lowercase(), v);
					},
					Err(e) => warn!(error = %e, header = %name, "response header render failed"),
				}
			}
			if message.is_empty()
				&& let Some(t) = &rule.responses.get(outcome).message
			{
				match t.render(templates, &ctx) {
					Ok(m) => message = m,
					Err(e) => warn!(error = %e, rule = %rule.name, "response message render failed"),
				}
			}
		}

		// Endpoint-level response shaping wins over everything upstream.
		let mut body = None;
		if let Some(endpoint_response) = state.endpoint.response.get(outcome) {
			for (name, t) in &endpoint_response.headers {
				match t.render(templates, &ctx) {
					Ok(v) => {
						merged.insert(name.to_ascii_lowercase(), v);
					},
					Err(e) => warn!(error = %e, header = %name, "endpoint header render failed"),
				}
			}
			if let Some(t) = &endpoint_response.body {
				match t.render(templates, &ctx) {
					Ok(b) => body = Some(b),
					Err(e) => warn!(error = %e, "endpoint body render failed"),
				}
			}
		}
		let body = body.unwrap_or_else(|| message.clone());

		merged.insert(OUTCOME_HEADER.to_string(), outcome.as_str().to_string());
		merged.insert(
			self.config.server.correlation_header.to_ascii_lowercase(),
			state.correlation_id.clone(),
		);
		if !body.is_empty() && !merged.contains_key("content-type") {
			merged.insert(
				"content-type".to_string(),
				"text/plain; charset=utf-8".to_string(),
			);
		}

		state.response.message = body;
		state.response.headers = merged;
		AgentReport::new(self.name(), outcome.as_str(), format!("status {status}"))
	}
}

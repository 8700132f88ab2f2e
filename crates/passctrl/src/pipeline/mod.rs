pub mod admission;
pub mod response;
pub mod resultcache;
pub mod rulechain;
pub mod ruleexec;
pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub use state::{ExecutionPlan, State};

use crate::cache::DecisionCache;
use crate::client::Client;
use crate::types::{CompiledConfig, Endpoint};
use crate::{debug, info};

/// Lightweight snapshot an agent returns for logging; all real effects
/// land on the shared state.
#[derive(Debug, Clone)]
pub struct AgentReport {
	pub agent: &'static str,
	pub decision: String,
	pub reason: String,
	pub duration: Duration,
}

impl AgentReport {
	pub fn new(agent: &'static str, decision: impl Into<String>, reason: impl Into<String>) -> Self {
		AgentReport {
			agent,
			decision: decision.into(),
			reason: reason.into(),
			duration: Duration::ZERO,
		}
	}
}

#[async_trait::async_trait]
pub trait Agent: Send + Sync {
	fn name(&self) -> &'static str;
	async fn evaluate(&self, state: &mut State) -> AgentReport;
}

/// Runs the agent sequence for one request against one configuration
/// snapshot. In-flight requests keep the snapshot they started with.
pub struct Pipeline {
	config: Arc<CompiledConfig>,
	server: ServerAgent,
	admission: admission::AdmissionAgent,
	rulechain: rulechain::RuleChainAgent,
	ruleexec: ruleexec::RuleExecutionAgent,
	response: response::ResponsePolicyAgent,
	resultcache: resultcache::ResultCachingAgent,
}

impl Pipeline {
	pub fn new(config: Arc<CompiledConfig>, cache: Arc<dyn DecisionCache>, client: Client) -> Self {
		Pipeline {
			server: ServerAgent,
			admission: admission::AdmissionAgent::new(config.clone()),
			rulechain: rulechain::RuleChainAgent::new(cache.clone()),
			ruleexec: ruleexec::RuleExecutionAgent::new(config.clone(), cache.clone(), client),
			response: response::ResponsePolicyAgent::new(config.clone()),
			resultcache: resultcache::ResultCachingAgent::new(config.clone(), cache),
			config,
		}
	}

	pub fn config(&self) -> &Arc<CompiledConfig> {
		&self.config
	}

	pub async fn evaluate(
		&self,
		endpoint: Arc<Endpoint>,
		request: state::RequestSnapshot,
		correlation_id: String,
	) -> State {
		let mut state = State::new(
			endpoint,
			request,
			correlation_id,
			self.config.env.clone(),
			self.config.secrets_plain(),
		);
		let started = Instant::now();

		self.run_agent(&self.server, &mut state).await;
		self.run_agent(&self.admission, &mut state).await;
		self.run_agent(&self.rulechain, &mut state).await;
		let should_execute = state
			.plan
			.as_ref()
			.map(|p| p.should_execute)
			.unwrap_or(false);
		if should_execute {
			self.run_agent(&self.ruleexec, &mut state).await;
		}
		self.run_agent(&self.response, &mut state).await;
		self.run_agent(&self.resultcache, &mut state).await;

		info!(
			endpoint = %state.endpoint.name,
			correlation_id = %state.correlation_id,
			outcome = %state.rule.outcome,
			reason = %state.rule.reason,
			status = state.response.status,
			from_cache = state.rule.from_cache,
			duration_ms = started.elapsed().as_millis() as u64,
			"request evaluated"
		);
		state
	}

	async fn run_agent(&self, agent: &dyn Agent, state: &mut State) {
		let started = Instant::now();
		let mut report = agent.evaluate(state).await;
		report.duration = started.elapsed();
		debug!(
			agent = report.agent,
			decision = %report.decision,
			reason = %report.reason,
			correlation_id = %state.correlation_id,
			duration_ms = report.duration.as_millis() as u64,
			"agent evaluated"
		);
	}
}

/// First agent: stamp the observation time and mark the pipeline ready.
pub struct ServerAgent;

#[async_trait::async_trait]
impl Agent for ServerAgent {
	fn name(&self) -> &'static str {
		"server"
	}

	async fn evaluate(&self, state: &mut State) -> AgentReport {
		state.started_at = SystemTime::now();
		state.ready = true;
		AgentReport::new(self.name(), "ready", "")
	}
}

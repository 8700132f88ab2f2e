use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::json;

use crate::cache::sha256_hex;
use crate::eval::EvalContext;
use crate::types::{Endpoint, Outcome, RuleDefinition};

/// Per-request shared workspace. Created once per request, mutated in
/// order by the agents, read by the response writer, then discarded.
pub struct State {
	pub endpoint: Arc<Endpoint>,
	pub correlation_id: String,
	pub started_at: SystemTime,
	pub ready: bool,
	/// Derived from the first allowed credential source; write-once.
	credential_tag: String,
	pub request: RequestSnapshot,
	pub admission: AdmissionState,
	pub forward: ForwardState,
	pub rule: RuleState,
	pub response: ResponseState,
	pub cache: CacheState,
	pub backend: BackendState,
	pub variables: Variables,
	pub plan: Option<ExecutionPlan>,
}

/// Ordered, resolved rule definitions handed from planning to execution.
pub struct ExecutionPlan {
	pub rules: Vec<Arc<RuleDefinition>>,
	pub should_execute: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
	pub method: String,
	pub path: String,
	pub host: String,
	/// Lower-cased names, first value wins.
	pub headers: BTreeMap<String, String>,
	pub query: BTreeMap<String, String>,
	/// Peer address of the connection, as reported by the server.
	pub remote_addr: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionState {
	pub authenticated: bool,
	pub reason: String,
	pub captured_at: Option<SystemTime>,
	pub client_ip: String,
	pub trusted_proxy: bool,
	pub proxy_stripped: bool,
	pub forwarded_original: String,
	pub forwarded_sanitized: String,
	pub xff_original: String,
	pub xff_sanitized: String,
	pub proxy_note: String,
	pub decision: String,
	#[serde(skip)]
	pub snapshot: serde_json::Value,
	pub allow: Vec<String>,
	pub credentials: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
	Bearer { token: String },
	Basic { user: String, password: String },
	Header { name: String, value: String },
	Query { name: String, value: String },
	None,
}

impl Credential {
	pub fn kind(&self) -> &'static str {
		match self {
			Credential::Bearer { .. } => "bearer",
			Credential::Basic { .. } => "basic",
			Credential::Header { .. } => "header",
			Credential::Query { .. } => "query",
			Credential::None => "none",
		}
	}

	pub fn name(&self) -> Option<&str> {
		match self {
			Credential::Header { name, .. } | Credential::Query { name, .. } => Some(name),
			_ => None,
		}
	}
}

// Credential material stays out of serialized snapshots; only the shape
// of what was presented is observable.
impl Serialize for Credential {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		use serde::ser::SerializeMap;
		let mut map = serializer.serialize_map(Some(2))?;
		map.serialize_entry("type", self.kind())?;
		if let Some(name) = self.name() {
			map.serialize_entry("name", name)?;
		}
		map.end()
	}
}

/// Headers and query values authorized for backend propagation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardState {
	pub headers: BTreeMap<String, String>,
	pub query: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleState {
	pub outcome: Outcome,
	pub reason: String,
	pub executed: bool,
	pub from_cache: bool,
	pub history: Vec<HistoryEntry>,
	pub auth: RuleAuthState,
	pub variables: VariableScopes,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
	pub name: String,
	pub outcome: Outcome,
	pub reason: String,
	pub duration: Duration,
	pub variables: BTreeMap<String, serde_json::Value>,
	pub from_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAuthState {
	/// Kinds of the matchers in the selected group, for observability.
	pub matcher: String,
	/// Nested map: bearer, basic, header[name], query[name].
	pub input: serde_json::Value,
	/// What the selected group would propagate. Only declared forwards are
	/// actually applied to backend requests.
	pub forward: Vec<ForwardDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardDescriptor {
	pub kind: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableScopes {
	/// Union snapshot captured per rule for history.
	pub rule: BTreeMap<String, serde_json::Value>,
	/// Results of the rule's variable programs.
	pub local: BTreeMap<String, serde_json::Value>,
	/// Values exported by the rule's per-outcome response.
	pub exported: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseState {
	pub status: u16,
	pub message: String,
	pub headers: BTreeMap<String, String>,
	/// Exported variables flattened across rules, later rules win.
	pub variables: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheState {
	pub key: String,
	pub hit: bool,
	pub decision: String,
	pub stored_at: Option<SystemTime>,
	pub expires_at: Option<SystemTime>,
	pub stored_this_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendState {
	pub requested: bool,
	pub status: u16,
	pub headers: BTreeMap<String, String>,
	pub body: serde_json::Value,
	pub raw_body: String,
	pub error: Option<String>,
	pub accepted: bool,
	pub pages: Vec<PageSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
	pub url: String,
	pub status: u16,
	pub headers: BTreeMap<String, String>,
	pub body: serde_json::Value,
	pub raw_body: String,
}

#[derive(Debug, Clone, Default)]
pub struct Variables {
	pub global: BTreeMap<String, serde_json::Value>,
	/// Exported variables by rule name.
	pub rules: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
	pub env: BTreeMap<String, String>,
	pub secrets: BTreeMap<String, String>,
}

impl State {
	pub fn new(
		endpoint: Arc<Endpoint>,
		request: RequestSnapshot,
		correlation_id: String,
		env: BTreeMap<String, String>,
		secrets: BTreeMap<String, String>,
	) -> Self {
		State {
			endpoint,
			correlation_id,
			started_at: SystemTime::now(),
			ready: false,
			credential_tag: String::new(),
			request,
			admission: AdmissionState::default(),
			forward: ForwardState::default(),
			rule: RuleState::default(),
			response: ResponseState::default(),
			cache: CacheState::default(),
			backend: BackendState::default(),
			variables: Variables {
				env,
				secrets,
				..Default::default()
			},
			plan: None,
		}
	}

	/// `credential-tag | endpoint-name | path`.
	pub fn cache_key(&self) -> String {
		format!(
			"{}|{}|{}",
			self.credential_tag, self.endpoint.name, self.request.path
		)
	}

	/// Write-once; later calls are ignored.
	pub fn set_credential_tag(&mut self, tag: String) {
		if self.credential_tag.is_empty() {
			self.credential_tag = tag;
		}
	}

	pub fn credential_tag(&self) -> &str {
		&self.credential_tag
	}

	/// The state view handed to expressions and templates.
	pub fn eval_context(&self) -> EvalContext {
		EvalContext {
			request: to_json(&self.request),
			admission: if self.admission.snapshot.is_null() {
				to_json(&self.admission)
			} else {
				self.admission.snapshot.clone()
			},
			auth: self.rule.auth.input.clone(),
			backend: to_json(&self.backend),
			vars: to_json(&self.rule.variables.local),
			rules: to_json(&self.variables.rules),
			response: json!({
				"outcome": self.rule.outcome.as_str(),
				"reason": self.rule.reason,
				"status": self.response.status,
				"variables": self.response.variables,
			}),
			env: to_json(&self.variables.env),
			secrets: to_json(&self.variables.secrets),
		}
	}

	/// Map carrying all admission fields, emitted on every non-authenticated
	/// outcome and exposed to expressions.
	pub fn capture_admission_snapshot(&mut self) {
		self.admission.snapshot = to_json(&self.admission);
	}
}

/// Derive the cache-key credential tag. Source kinds are part of the tag
/// so equal literal values from different sources never collide;
/// credential material itself is hashed.
pub fn credential_tag(credential: &Credential) -> String {
	match credential {
		Credential::Bearer { token } => format!("authorization:bearer:{}", sha256_hex(token)),
		Credential::Basic { user, password } => {
			format!(
				"authorization:basic:{}",
				sha256_hex(&format!("{user}:{password}"))
			)
		},
		Credential::Header { name, value } => format!("header:{name}:{}", sha256_hex(value)),
		Credential::Query { name, value } => format!("query:{name}:{}", sha256_hex(value)),
		Credential::None => "none".to_string(),
	}
}

fn to_json<T: Serialize>(t: &T) -> serde_json::Value {
	serde_json::to_value(t).unwrap_or(serde_json::Value::Null)
}

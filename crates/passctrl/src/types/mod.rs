use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::eval::{Program, TemplateString};
use crate::template::Templates;

/// Final disposition of a request or a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
	Pass,
	Fail,
	Error,
	#[serde(rename = "")]
	#[default]
	Unset,
}

impl Outcome {
	pub fn as_str(&self) -> &'static str {
		match self {
			Outcome::Pass => "pass",
			Outcome::Fail => "fail",
			Outcome::Error => "error",
			Outcome::Unset => "",
		}
	}

	pub fn is_decisive(&self) -> bool {
		matches!(self, Outcome::Pass | Outcome::Fail | Outcome::Error)
	}
}

impl std::fmt::Display for Outcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for Outcome {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pass" => Ok(Outcome::Pass),
			"fail" => Ok(Outcome::Fail),
			"error" => Ok(Outcome::Error),
			"" => Ok(Outcome::Unset),
			_ => Err(()),
		}
	}
}

/// A full compiled configuration: what the serving tasks read through the
/// snapshot store. Immutable once built.
pub struct CompiledConfig {
	pub server: ServerConfig,
	pub trusted_proxies: Vec<IpNet>,
	pub endpoints: Vec<Arc<Endpoint>>,
	pub rules: BTreeMap<String, Arc<RuleDefinition>>,
	pub templates: Arc<Templates>,
	pub env: BTreeMap<String, String>,
	pub secrets: BTreeMap<String, SecretString>,
}

impl CompiledConfig {
	pub fn endpoint_for_path(&self, path: &str) -> Option<(&Arc<Endpoint>, String)> {
		self.endpoints.iter().find_map(|ep| {
			let rest = path.strip_prefix(&ep.path)?;
			if rest.is_empty() || rest.starts_with('/') {
				Some((ep, rest.to_string()))
			} else {
				None
			}
		})
	}

	pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
		self.endpoints.iter().find(|ep| ep.name == name)
	}

	pub fn secrets_plain(&self) -> BTreeMap<String, String> {
		self
			.secrets
			.iter()
			.map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
			.collect()
	}
}

impl std::fmt::Debug for CompiledConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CompiledConfig")
			.field("endpoints", &self.endpoints.len())
			.field("rules", &self.rules.len())
			.finish()
	}
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub bind: SocketAddr,
	pub correlation_header: String,
	pub max_ttl: Duration,
	pub development_mode: bool,
}

/// A named URL-prefix binding: who may ask, which rules decide, and how
/// the answer is shaped.
pub struct Endpoint {
	pub name: String,
	pub path: String,
	pub authentication: AuthenticationPolicy,
	pub response: PerOutcome<Option<EndpointResponse>>,
	pub cache: Option<EndpointCache>,
	pub rules: Vec<Arc<RuleDefinition>>,
	/// Rule names as configured, in order, including unresolvable ones.
	pub rule_sources: Vec<String>,
	pub skipped_definitions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthenticationPolicy {
	pub required: bool,
	pub allow: AllowConfig,
	pub challenge: Option<Challenge>,
}

#[derive(Debug, Clone, Default)]
pub struct AllowConfig {
	pub authorization: Vec<AuthorizationScheme>,
	pub headers: Vec<String>,
	pub query: Vec<String>,
	pub none: bool,
}

impl AllowConfig {
	/// Flat listing for the admission snapshot.
	pub fn enumerate(&self) -> Vec<String> {
		let mut out = Vec::new();
		for s in &self.authorization {
			out.push(format!("authorization:{s}"));
		}
		for h in &self.headers {
			out.push(format!("header:{h}"));
		}
		for q in &self.query {
			out.push(format!("query:{q}"));
		}
		if self.none {
			out.push("none".to_string());
		}
		out
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationScheme {
	Basic,
	Bearer,
}

impl std::fmt::Display for AuthorizationScheme {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			AuthorizationScheme::Basic => f.write_str("basic"),
			AuthorizationScheme::Bearer => f.write_str("bearer"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct Challenge {
	pub scheme: AuthorizationScheme,
	pub realm: String,
	pub charset: Option<String>,
}

impl Challenge {
	/// `Basic realm="…", charset="…"` / `Bearer realm="…"` with quoting.
	pub fn header_value(&self) -> String {
		let realm = quote_escape(&self.realm);
		match self.scheme {
			AuthorizationScheme::Basic => match &self.charset {
				Some(cs) => format!("Basic realm=\"{realm}\", charset=\"{}\"", quote_escape(cs)),
				None => format!("Basic realm=\"{realm}\""),
			},
			AuthorizationScheme::Bearer => format!("Bearer realm=\"{realm}\""),
		}
	}
}

fn quote_escape(s: &str) -> String {
	s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug, Clone)]
pub struct EndpointCache {
	pub ttl: Duration,
}

pub struct EndpointResponse {
	pub body: Option<TemplateString>,
	pub headers: BTreeMap<String, TemplateString>,
}

/// Per-outcome container used for responses; `get` never fails.
#[derive(Debug, Clone, Default)]
pub struct PerOutcome<T> {
	pub pass: T,
	pub fail: T,
	pub error: T,
}

impl<T> PerOutcome<T> {
	pub fn get(&self, outcome: Outcome) -> &T {
		match outcome {
			Outcome::Pass | Outcome::Unset => &self.pass,
			Outcome::Fail => &self.fail,
			Outcome::Error => &self.error,
		}
	}
}

/// A compiled rule: auth directives, optional backend, variables,
/// condition groups, and per-outcome responses.
pub struct RuleDefinition {
	pub name: String,
	pub auth: Vec<MatchGroup>,
	pub backend: Option<BackendSpec>,
	pub variables: BTreeMap<String, Program>,
	pub conditions: Conditions,
	pub responses: PerOutcome<RuleResponse>,
}

impl RuleDefinition {
	/// Header and query names that appear as matchers in any auth
	/// directive of this rule. These never reach the backend unless a
	/// forward re-adds them.
	pub fn credential_names(&self) -> (Vec<String>, Vec<String>) {
		let mut headers = Vec::new();
		let mut query = Vec::new();
		for group in &self.auth {
			for m in &group.matchers {
				match (&m.kind, &m.name) {
					(MatcherKind::Header, Some(n)) => headers.push(n.clone()),
					(MatcherKind::Query, Some(n)) => query.push(n.clone()),
					_ => {},
				}
			}
		}
		headers.sort();
		headers.dedup();
		query.sort();
		query.dedup();
		(headers, query)
	}

	pub fn uses_authorization_matchers(&self) -> bool {
		self.auth.iter().any(|g| {
			g.matchers
				.iter()
				.any(|m| matches!(m.kind, MatcherKind::Bearer | MatcherKind::Basic))
		})
	}
}

#[derive(Default)]
pub struct Conditions {
	pub error: Vec<Program>,
	pub fail: Vec<Program>,
	pub pass: Vec<Program>,
}

pub struct RuleResponse {
	pub message: Option<TemplateString>,
	pub headers: HeaderPolicy,
	pub export: BTreeMap<String, Program>,
	pub ttl: Duration,
	pub endpoint_cache: bool,
}

impl Default for RuleResponse {
	fn default() -> Self {
		RuleResponse {
			message: None,
			headers: HeaderPolicy::default(),
			export: BTreeMap::new(),
			ttl: Duration::ZERO,
			endpoint_cache: true,
		}
	}
}

/// Allow-whitelist (with `*`), strip, then templated custom values.
#[derive(Default)]
pub struct HeaderPolicy {
	pub allow: Vec<String>,
	pub strip: Vec<String>,
	pub custom: BTreeMap<String, TemplateString>,
}

impl HeaderPolicy {
	pub fn allows_all(&self) -> bool {
		self.allow.iter().any(|a| a == "*")
	}
}

/// One auth directive: every matcher must succeed for the group to be
/// selected.
pub struct MatchGroup {
	pub matchers: Vec<Matcher>,
	pub forwards: Option<Vec<ForwardDef>>,
}

pub struct Matcher {
	pub kind: MatcherKind,
	/// Lower-cased header or query name; unset for the other kinds.
	pub name: Option<String>,
	/// OR among these; empty means presence suffices.
	pub values: Vec<ValueMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
	Bearer,
	Basic,
	Header,
	Query,
	None,
}

impl std::fmt::Display for MatcherKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			MatcherKind::Bearer => "bearer",
			MatcherKind::Basic => "basic",
			MatcherKind::Header => "header",
			MatcherKind::Query => "query",
			MatcherKind::None => "none",
		};
		f.write_str(s)
	}
}

pub enum ValueMatcher {
	Exact(String),
	Prefix(String),
	Suffix(String),
	Regex(regex::Regex),
	Present,
}

impl ValueMatcher {
	pub fn matches(&self, value: &str) -> bool {
		match self {
			ValueMatcher::Exact(want) => value == want,
			ValueMatcher::Prefix(p) => value.starts_with(p.as_str()),
			ValueMatcher::Suffix(s) => value.ends_with(s.as_str()),
			ValueMatcher::Regex(re) => re.is_match(value),
			ValueMatcher::Present => !value.is_empty(),
		}
	}
}

/// An explicit credential propagation instruction.
pub enum ForwardDef {
	Bearer {
		token: TemplateString,
	},
	Basic {
		user: TemplateString,
		password: TemplateString,
	},
	Header {
		name: TemplateString,
		value: TemplateString,
	},
	Query {
		name: TemplateString,
		value: TemplateString,
	},
}

pub struct BackendSpec {
	pub url: TemplateString,
	pub method: http::Method,
	pub headers: SelectPolicy,
	pub query: SelectPolicy,
	pub body: Option<BodySource>,
	pub pagination: Option<Pagination>,
	/// Empty means any 2xx is accepted.
	pub accepted: Vec<u16>,
	pub forward_proxy_headers: bool,
	pub timeout: Duration,
	pub cache: BackendCacheConfig,
}

impl BackendSpec {
	pub fn is_accepted(&self, status: u16) -> bool {
		if self.accepted.is_empty() {
			(200..300).contains(&status)
		} else {
			self.accepted.contains(&status)
		}
	}
}

pub enum BodySource {
	Inline(TemplateString),
	/// The rendered path names a template file which is rendered in turn.
	File(TemplateString),
}

#[derive(Debug, Clone)]
pub struct Pagination {
	pub max_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
	#[default]
	Strict,
	Loose,
}

#[derive(Debug, Clone)]
pub struct BackendCacheConfig {
	pub mode: CacheMode,
	pub include_proxy_headers: bool,
	pub follow_cache_control: bool,
}

impl Default for BackendCacheConfig {
	fn default() -> Self {
		BackendCacheConfig {
			mode: CacheMode::Strict,
			include_proxy_headers: false,
			follow_cache_control: false,
		}
	}
}

/// Pass-through selection with wildcard allow, strip, and custom values.
#[derive(Default)]
pub struct SelectPolicy {
	pub allow: Vec<String>,
	pub strip: Vec<String>,
	pub custom: BTreeMap<String, TemplateString>,
}

impl SelectPolicy {
	pub fn allows_all(&self) -> bool {
		self.allow.iter().any(|a| a == "*")
	}

	pub fn allows(&self, name: &str) -> bool {
		self.allows_all() || self.allow.iter().any(|a| a.eq_ignore_ascii_case(name))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn challenge_formats() {
		let c = Challenge {
			scheme: AuthorizationScheme::Basic,
			realm: "internal \"zone\"".to_string(),
			charset: Some("UTF-8".to_string()),
		};
		assert_eq!(
			c.header_value(),
			"Basic realm=\"internal \\\"zone\\\"\", charset=\"UTF-8\""
		);
		let c = Challenge {
			scheme: AuthorizationScheme::Bearer,
			realm: "api".to_string(),
			charset: None,
		};
		assert_eq!(c.header_value(), "Bearer realm=\"api\"");
	}

	#[test]
	fn value_matchers() {
		assert!(ValueMatcher::Exact("abc".into()).matches("abc"));
		assert!(!ValueMatcher::Exact("abc".into()).matches("abcd"));
		assert!(ValueMatcher::Prefix("tok_".into()).matches("tok_1"));
		assert!(ValueMatcher::Suffix("@corp".into()).matches("ada@corp"));
		assert!(ValueMatcher::Regex(regex::Regex::new("^v[0-9]+$").unwrap()).matches("v42"));
		assert!(ValueMatcher::Present.matches("x"));
		assert!(!ValueMatcher::Present.matches(""));
	}

	#[test]
	fn accepted_statuses() {
		let spec = BackendSpec {
			url: crate::eval::TemplateString::Literal("http://example.com".into()),
			method: http::Method::GET,
			headers: SelectPolicy::default(),
			query: SelectPolicy::default(),
			body: None,
			pagination: None,
			accepted: vec![],
			forward_proxy_headers: false,
			timeout: Duration::from_secs(10),
			cache: BackendCacheConfig::default(),
		};
		assert!(spec.is_accepted(200));
		assert!(spec.is_accepted(204));
		assert!(!spec.is_accepted(302));
		let spec = BackendSpec {
			accepted: vec![200, 404],
			..spec
		};
		assert!(spec.is_accepted(404));
		assert!(!spec.is_accepted(204));
	}
}

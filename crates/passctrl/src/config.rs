use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use ipnet::IpNet;
use secrecy::SecretString;
use serde::Deserialize;

use crate::eval::{Program, TemplateString};
use crate::serdes::{self, FileOrInline};
use crate::template::Templates;
use crate::types::*;
use crate::warn;

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_CORRELATION_HEADER: &str = "x-request-id";
const DEFAULT_MAX_TTL: Duration = Duration::from_secs(600);
const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PAGES: usize = 5;

pub fn parse_config(contents: &str) -> anyhow::Result<CompiledConfig> {
	let raw: RawConfig = serdes::yamlviajson::from_str(contents).context("parsing configuration")?;
	compile(raw)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	#[serde(default)]
	pub server: RawServer,
	#[serde(default)]
	pub trusted_proxies: Vec<String>,
	#[serde(default)]
	pub secrets: BTreeMap<String, FileOrInline>,
	#[serde(default)]
	pub endpoints: BTreeMap<String, RawEndpoint>,
	#[serde(default)]
	pub rules: BTreeMap<String, RawRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawServer {
	pub bind: Option<String>,
	pub correlation_header: Option<String>,
	#[serde(default, deserialize_with = "serdes::serde_dur_option::deserialize")]
	pub max_ttl: Option<Duration>,
	#[serde(default)]
	pub development_mode: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawEndpoint {
	pub path: Option<String>,
	#[serde(default)]
	pub authentication: RawAuthentication,
	#[serde(default)]
	pub response: RawPerOutcome<RawEndpointResponse>,
	pub cache: Option<RawEndpointCache>,
	#[serde(default)]
	pub rules: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawAuthentication {
	#[serde(default = "default_true")]
	pub required: bool,
	#[serde(default)]
	pub allow: RawAllow,
	pub challenge: Option<RawChallenge>,
}

impl Default for RawAuthentication {
	fn default() -> Self {
		RawAuthentication {
			required: true,
			allow: RawAllow::default(),
			challenge: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawAllow {
	#[serde(default)]
	pub authorization: Vec<AuthorizationScheme>,
	#[serde(default)]
	pub headers: Vec<String>,
	#[serde(default)]
	pub query: Vec<String>,
	#[serde(default)]
	pub none: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawChallenge {
	pub scheme: AuthorizationScheme,
	pub realm: Option<String>,
	pub charset: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawPerOutcome<T> {
	pub pass: Option<T>,
	pub fail: Option<T>,
	pub error: Option<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawEndpointResponse {
	pub body: Option<String>,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawEndpointCache {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(deserialize_with = "serdes::serde_dur::deserialize")]
	pub ttl: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawRule {
	#[serde(default)]
	pub auth: Vec<RawAuthDirective>,
	pub backend: Option<RawBackend>,
	#[serde(default)]
	pub variables: BTreeMap<String, String>,
	#[serde(default)]
	pub conditions: RawConditions,
	#[serde(default)]
	pub responses: RawPerOutcome<RawRuleResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawAuthDirective {
	#[serde(rename = "match")]
	pub matchers: RawMatch,
	pub forward: Option<Vec<RawForward>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawMatch {
	pub bearer: Option<Vec<RawValueMatcher>>,
	pub basic: Option<Vec<RawValueMatcher>>,
	#[serde(default)]
	pub header: BTreeMap<String, Vec<RawValueMatcher>>,
	#[serde(default)]
	pub query: BTreeMap<String, Vec<RawValueMatcher>>,
	#[serde(default)]
	pub none: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawValueMatcher {
	Exact(String),
	Prefix(String),
	Suffix(String),
	Regex(String),
	Present,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawForward {
	Bearer {
		token: String,
	},
	Basic {
		user: String,
		#[serde(default)]
		password: String,
	},
	Header {
		name: String,
		value: String,
	},
	Query {
		name: String,
		value: String,
	},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawBackend {
	pub url: String,
	pub method: Option<String>,
	#[serde(default)]
	pub headers: RawSelect,
	#[serde(default)]
	pub query: RawSelect,
	pub body: Option<String>,
	pub body_file: Option<String>,
	pub pagination: Option<RawPagination>,
	#[serde(default)]
	pub accepted: Vec<u16>,
	#[serde(default)]
	pub forward_proxy_headers: bool,
	#[serde(default, deserialize_with = "serdes::serde_dur_option::deserialize")]
	pub timeout: Option<Duration>,
	#[serde(default)]
	pub cache: RawBackendCache,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSelect {
	#[serde(default)]
	pub allow: Vec<String>,
	#[serde(default)]
	pub strip: Vec<String>,
	#[serde(default)]
	pub custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawPagination {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default = "default_max_pages")]
	pub max_pages: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawBackendCache {
	#[serde(default)]
	pub mode: CacheMode,
	#[serde(default)]
	pub include_proxy_headers: bool,
	#[serde(default)]
	pub follow_cache_control: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConditions {
	#[serde(default)]
	pub error: Vec<String>,
	#[serde(default)]
	pub fail: Vec<String>,
	#[serde(default)]
	pub pass: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawRuleResponse {
	pub message: Option<String>,
	#[serde(default)]
	pub headers: RawSelect,
	#[serde(default)]
	pub export: BTreeMap<String, String>,
	#[serde(default, deserialize_with = "serdes::serde_dur_option::deserialize")]
	pub ttl: Option<Duration>,
	pub endpoint_cache: Option<bool>,
}

fn default_true() -> bool {
	true
}

fn default_max_pages() -> usize {
	DEFAULT_MAX_PAGES
}

fn compile(raw: RawConfig) -> anyhow::Result<CompiledConfig> {
	let mut templates = Templates::new();

	let bind = raw
		.server
		.bind
		.as_deref()
		.unwrap_or(DEFAULT_BIND)
		.parse::<SocketAddr>()
		.context("server.bind")?;
	let server = ServerConfig {
		bind,
		correlation_header: raw
			.server
			.correlation_header
			.as_deref()
			.unwrap_or(DEFAULT_CORRELATION_HEADER)
			.to_ascii_lowercase(),
		max_ttl: raw.server.max_ttl.unwrap_or(DEFAULT_MAX_TTL),
		development_mode: raw.server.development_mode,
	};

	let trusted_proxies = raw
		.trusted_proxies
		.iter()
		.map(|s| parse_prefix(s))
		.collect::<anyhow::Result<Vec<_>>>()?;

	let mut rules = BTreeMap::new();
	for (name, rule) in raw.rules {
		let compiled = compile_rule(&name, rule, &mut templates)
			.with_context(|| format!("compiling rule {name:?}"))?;
		rules.insert(name, Arc::new(compiled));
	}

	let mut endpoints = Vec::new();
	for (name, endpoint) in raw.endpoints {
		let compiled = compile_endpoint(&name, endpoint, &rules, &mut templates)
			.with_context(|| format!("compiling endpoint {name:?}"))?;
		endpoints.push(Arc::new(compiled));
	}
	// Longest prefix first so nested paths resolve to the most specific
	// endpoint.
	endpoints.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.name.cmp(&b.name)));

	let mut secrets = BTreeMap::new();
	for (name, source) in &raw.secrets {
		let value = source
			.load()
			.with_context(|| format!("loading secret {name:?}"))?;
		secrets.insert(name.clone(), SecretString::from(value.trim().to_string()));
	}

	Ok(CompiledConfig {
		server,
		trusted_proxies,
		endpoints,
		rules,
		templates: Arc::new(templates),
		env: std::env::vars().collect(),
		secrets,
	})
}

fn parse_prefix(s: &str) -> anyhow::Result<IpNet> {
	if let Ok(net) = s.parse::<IpNet>() {
		return Ok(net);
	}
	let ip = s
		.parse::<IpAddr>()
		.with_context(|| format!("trusted proxy {s:?}"))?;
	Ok(IpNet::from(ip))
}

fn compile_endpoint(
	name: &str,
	raw: RawEndpoint,
	rules: &BTreeMap<String, Arc<RuleDefinition>>,
	templates: &mut Templates,
) -> anyhow::Result<Endpoint> {
	let path = raw.path.unwrap_or_else(|| format!("/{name}"));
	if !path.starts_with('/') {
		bail!("path {path:?} must start with a slash");
	}
	let path = path.trim_end_matches('/').to_string();

	let allow = AllowConfig {
		authorization: raw.authentication.allow.authorization.clone(),
		headers: lowered(&raw.authentication.allow.headers),
		query: lowered(&raw.authentication.allow.query),
		none: raw.authentication.allow.none,
	};
	let challenge = match raw.authentication.challenge {
		Some(c) => Some(Challenge {
			scheme: c.scheme,
			realm: c.realm.unwrap_or_else(|| name.to_string()),
			charset: c.charset,
		}),
		// A challenge falls out of the first allowed Authorization scheme.
		None => allow.authorization.first().map(|scheme| Challenge {
			scheme: *scheme,
			realm: name.to_string(),
			charset: None,
		}),
	};

	let mut resolved = Vec::new();
	let mut skipped = Vec::new();
	for rule_name in &raw.rules {
		match rules.get(rule_name) {
			Some(rule) => resolved.push(rule.clone()),
			None => {
				warn!(endpoint = name, rule = %rule_name, "skipping unknown rule reference");
				skipped.push(rule_name.clone());
			},
		}
	}

	let response = PerOutcome {
		pass: compile_endpoint_response(name, "pass", raw.response.pass, templates)?,
		fail: compile_endpoint_response(name, "fail", raw.response.fail, templates)?,
		error: compile_endpoint_response(name, "error", raw.response.error, templates)?,
	};

	Ok(Endpoint {
		name: name.to_string(),
		path,
		authentication: AuthenticationPolicy {
			required: raw.authentication.required,
			allow,
			challenge,
		},
		response,
		cache: raw.cache.filter(|c| c.enabled).map(|c| EndpointCache { ttl: c.ttl }),
		rules: resolved,
		rule_sources: raw.rules,
		skipped_definitions: skipped,
	})
}

fn compile_endpoint_response(
	endpoint: &str,
	outcome: &str,
	raw: Option<RawEndpointResponse>,
	templates: &mut Templates,
) -> anyhow::Result<Option<EndpointResponse>> {
	let Some(raw) = raw else { return Ok(None) };
	let body = raw
		.body
		.map(|b| {
			TemplateString::compile(
				&b,
				format!("endpoint.{endpoint}.response.{outcome}.body"),
				templates,
			)
		})
		.transpose()?;
	let headers = compile_header_templates(
		raw.headers,
		&format!("endpoint.{endpoint}.response.{outcome}.header"),
		templates,
	)?;
	Ok(Some(EndpointResponse { body, headers }))
}

fn compile_rule(
	name: &str,
	raw: RawRule,
	templates: &mut Templates,
) -> anyhow::Result<RuleDefinition> {
	let mut auth = Vec::new();
	for (i, directive) in raw.auth.into_iter().enumerate() {
		auth.push(
			compile_directive(name, i, directive, templates)
				.with_context(|| format!("auth directive {i}"))?,
		);
	}

	let backend = raw
		.backend
		.map(|b| compile_backend(name, b, templates))
		.transpose()
		.context("backend")?;

	let mut variables = BTreeMap::new();
	for (var, source) in raw.variables {
		let program = Program::compile(&source, format!("rule.{name}.var.{var}"), templates)
			.with_context(|| format!("variable {var:?}"))?;
		variables.insert(var, program);
	}

	let conditions = Conditions {
		error: compile_condition_group(name, "error", raw.conditions.error, templates)?,
		fail: compile_condition_group(name, "fail", raw.conditions.fail, templates)?,
		pass: compile_condition_group(name, "pass", raw.conditions.pass, templates)?,
	};

	let responses = PerOutcome {
		pass: compile_rule_response(name, "pass", raw.responses.pass, templates)?,
		fail: compile_rule_response(name, "fail", raw.responses.fail, templates)?,
		error: compile_rule_response(name, "error", raw.responses.error, templates)?,
	};

	Ok(RuleDefinition {
		name: name.to_string(),
		auth,
		backend,
		variables,
		conditions,
		responses,
	})
}

fn compile_directive(
	rule: &str,
	index: usize,
	raw: RawAuthDirective,
	templates: &mut Templates,
) -> anyhow::Result<MatchGroup> {
	let mut matchers = Vec::new();
	if let Some(values) = raw.matchers.bearer {
		matchers.push(Matcher {
			kind: MatcherKind::Bearer,
			name: None,
			values: compile_value_matchers(values)?,
		});
	}
	if let Some(values) = raw.matchers.basic {
		matchers.push(Matcher {
			kind: MatcherKind::Basic,
			name: None,
			values: compile_value_matchers(values)?,
		});
	}
	for (header, values) in raw.matchers.header {
		matchers.push(Matcher {
			kind: MatcherKind::Header,
			name: Some(header.to_ascii_lowercase()),
			values: compile_value_matchers(values)?,
		});
	}
	for (query, values) in raw.matchers.query {
		matchers.push(Matcher {
			kind: MatcherKind::Query,
			name: Some(query.to_ascii_lowercase()),
			values: compile_value_matchers(values)?,
		});
	}
	if raw.matchers.none {
		matchers.push(Matcher {
			kind: MatcherKind::None,
			name: None,
			values: Vec::new(),
		});
	}
	if matchers.is_empty() {
		bail!("directive matches nothing");
	}

	let forwards = raw
		.forward
		.map(|defs| {
			defs
				.into_iter()
				.enumerate()
				.map(|(fi, def)| {
					compile_forward(def, &format!("rule.{rule}.auth.{index}.forward.{fi}"), templates)
				})
				.collect::<anyhow::Result<Vec<_>>>()
		})
		.transpose()?;

	Ok(MatchGroup { matchers, forwards })
}

fn compile_value_matchers(raw: Vec<RawValueMatcher>) -> anyhow::Result<Vec<ValueMatcher>> {
	raw
		.into_iter()
		.map(|vm| {
			Ok(match vm {
				RawValueMatcher::Exact(v) => ValueMatcher::Exact(v),
				RawValueMatcher::Prefix(v) => ValueMatcher::Prefix(v),
				RawValueMatcher::Suffix(v) => ValueMatcher::Suffix(v),
				RawValueMatcher::Regex(v) => {
					ValueMatcher::Regex(regex::Regex::new(&v).with_context(|| format!("regex {v:?}"))?)
				},
				RawValueMatcher::Present => ValueMatcher::Present,
			})
		})
		.collect()
}

fn compile_forward(
	raw: RawForward,
	key: &str,
	templates: &mut Templates,
) -> anyhow::Result<ForwardDef> {
	let compile =
		|s: &str, part: &str, templates: &mut Templates| -> anyhow::Result<TemplateString> {
			Ok(TemplateString::compile(s, format!("{key}.{part}"), templates)?)
		};
	Ok(match raw {
		RawForward::Bearer { token } => ForwardDef::Bearer {
			token: compile(&token, "token", templates)?,
		},
		RawForward::Basic { user, password } => ForwardDef::Basic {
			user: compile(&user, "user", templates)?,
			password: compile(&password, "password", templates)?,
		},
		RawForward::Header { name, value } => ForwardDef::Header {
			name: compile(&name, "name", templates)?,
			value: compile(&value, "value", templates)?,
		},
		RawForward::Query { name, value } => ForwardDef::Query {
			name: compile(&name, "name", templates)?,
			value: compile(&value, "value", templates)?,
		},
	})
}

fn compile_backend(
	rule: &str,
	raw: RawBackend,
	templates: &mut Templates,
) -> anyhow::Result<BackendSpec> {
	let url = TemplateString::compile(&raw.url, format!("rule.{rule}.backend.url"), templates)?;
	let method = match raw.method.as_deref() {
		None | Some("") => http::Method::GET,
		Some(m) => http::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
			.with_context(|| format!("method {m:?}"))?,
	};
	let body = match (raw.body, raw.body_file) {
		(Some(_), Some(_)) => bail!("body and bodyFile are mutually exclusive"),
		(Some(body), None) => Some(BodySource::Inline(TemplateString::compile(
			&body,
			format!("rule.{rule}.backend.body"),
			templates,
		)?)),
		(None, Some(path)) => Some(BodySource::File(TemplateString::compile(
			&path,
			format!("rule.{rule}.backend.bodyfile"),
			templates,
		)?)),
		(None, None) => None,
	};
	let pagination = raw
		.pagination
		.map(|p| {
			if p.kind != "link-header" {
				bail!("unsupported pagination type {:?}", p.kind);
			}
			Ok(Pagination {
				max_pages: p.max_pages,
			})
		})
		.transpose()?;

	Ok(BackendSpec {
		url,
		method,
		headers: compile_select(raw.headers, &format!("rule.{rule}.backend.header"), templates)?,
		query: compile_select(raw.query, &format!("rule.{rule}.backend.query"), templates)?,
		body,
		pagination,
		accepted: raw.accepted,
		forward_proxy_headers: raw.forward_proxy_headers,
		timeout: raw.timeout.unwrap_or(DEFAULT_BACKEND_TIMEOUT),
		cache: BackendCacheConfig {
			mode: raw.cache.mode,
			include_proxy_headers: raw.cache.include_proxy_headers,
			follow_cache_control: raw.cache.follow_cache_control,
		},
	})
}

fn compile_select(
	raw: RawSelect,
	key: &str,
	templates: &mut Templates,
) -> anyhow::Result<SelectPolicy> {
	Ok(SelectPolicy {
		allow: lowered_keep_wildcard(&raw.allow),
		strip: lowered(&raw.strip),
		custom: compile_header_templates(raw.custom, key, templates)?,
	})
}

fn compile_condition_group(
	rule: &str,
	group: &str,
	raw: Vec<String>,
	templates: &mut Templates,
) -> anyhow::Result<Vec<Program>> {
	raw
		.into_iter()
		.enumerate()
		.map(|(i, source)| {
			Program::compile(&source, format!("rule.{rule}.cond.{group}.{i}"), templates)
				.with_context(|| format!("{group} condition {i}"))
		})
		.collect()
}

fn compile_rule_response(
	rule: &str,
	outcome: &str,
	raw: Option<RawRuleResponse>,
	templates: &mut Templates,
) -> anyhow::Result<RuleResponse> {
	let Some(raw) = raw else {
		return Ok(RuleResponse::default());
	};
	let message = raw
		.message
		.map(|m| {
			TemplateString::compile(
				&m,
				format!("rule.{rule}.response.{outcome}.message"),
				templates,
			)
		})
		.transpose()?;
	let mut export = BTreeMap::new();
	for (name, source) in raw.export {
		let program = Program::compile(
			&source,
			format!("rule.{rule}.response.{outcome}.export.{name}"),
			templates,
		)
		.with_context(|| format!("export {name:?}"))?;
		export.insert(name, program);
	}
	Ok(RuleResponse {
		message,
		headers: HeaderPolicy {
			allow: lowered_keep_wildcard(&raw.headers.allow),
			strip: lowered(&raw.headers.strip),
			custom: compile_header_templates(
				raw.headers.custom,
				&format!("rule.{rule}.response.{outcome}.header"),
				templates,
			)?,
		},
		export,
		ttl: raw.ttl.unwrap_or(Duration::ZERO),
		endpoint_cache: raw.endpoint_cache.unwrap_or(true),
	})
}

fn compile_header_templates(
	raw: BTreeMap<String, String>,
	key: &str,
	templates: &mut Templates,
) -> anyhow::Result<BTreeMap<String, TemplateString>> {
	let mut out = BTreeMap::new();
	for (name, source) in raw {
		let compiled = TemplateString::compile(
			&source,
			format!("{key}.{}", name.to_ascii_lowercase()),
			templates,
		)
		.with_context(|| format!("header {name:?}"))?;
		out.insert(name.to_ascii_lowercase(), compiled);
	}
	Ok(out)
}

fn lowered(names: &[String]) -> Vec<String> {
	names.iter().map(|n| n.to_ascii_lowercase()).collect()
}

fn lowered_keep_wildcard(names: &[String]) -> Vec<String> {
	names
		.iter()
		.map(|n| {
			if n == "*" {
				n.clone()
			} else {
				n.to_ascii_lowercase()
			}
		})
		.collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

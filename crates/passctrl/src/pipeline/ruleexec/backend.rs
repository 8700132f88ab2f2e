use std::collections::{BTreeMap, HashSet};

use url::Url;

use super::auth::{ResolvedForward, SelectedAuth, resolve_forwards};
use crate::client::{BackendRequest, Client};
use crate::eval::EvalContext;
use crate::pipeline::state::{PageSnapshot, State};
use crate::template::Templates;
use crate::types::{BackendSpec, BodySource, RuleDefinition, SelectPolicy};
use crate::warn;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
	#[error("backend render failed: {0}")]
	Render(String),
	#[error("auth forward failed: {0}")]
	Forward(#[from] super::auth::ForwardError),
	#[error("backend request failed: {0}")]
	Transport(String),
	#[error("backend response decode failed: {0}")]
	Decode(String),
}

/// Render the rule's backend request against the current state: URL,
/// method, body, credential-stripped header and query selection, and
/// auth forwards last.
pub fn render_request(
	rule: &RuleDefinition,
	spec: &BackendSpec,
	selected: &SelectedAuth<'_>,
	state: &State,
	templates: &Templates,
) -> Result<BackendRequest, BackendError> {
	let ctx = state.eval_context();

	let url_text = spec
		.url
		.render(templates, &ctx)
		.map_err(|e| BackendError::Render(format!("url: {e}")))?;
	let mut url =
		Url::parse(url_text.trim()).map_err(|e| BackendError::Render(format!("url: {e}")))?;

	let body = match &spec.body {
		None => None,
		Some(BodySource::Inline(t)) => Some(
			t.render(templates, &ctx)
				.map_err(|e| BackendError::Render(format!("body: {e}")))?,
		),
		Some(BodySource::File(path)) => {
			let path = path
				.render(templates, &ctx)
				.map_err(|e| BackendError::Render(format!("body file path: {e}")))?;
			let source = fs_err::read_to_string(path.trim())
				.map_err(|e| BackendError::Render(format!("body file: {e}")))?;
			Some(
				templates
					.render_inline(&source, &ctx)
					.map_err(|e| BackendError::Render(format!("body file: {e}")))?,
			)
		},
	};

	// Fail-closed credential stripping: every header and query name any
	// auth directive of this rule matches on disappears from the request
	// view before selection. Forwards are the only way back in.
	let (cred_headers, cred_query) = rule.credential_names();
	let mut stripped_headers = state.request.headers.clone();
	for name in &cred_headers {
		stripped_headers.remove(name);
	}
	if rule.uses_authorization_matchers() {
		stripped_headers.remove("authorization");
	}
	let mut stripped_query = state.request.query.clone();
	for name in &cred_query {
		stripped_query.remove(name);
	}

	let headers = apply_policy(&spec.headers, &stripped_headers, templates, &ctx)
		.map_err(|e| BackendError::Render(format!("headers: {e}")))?;
	let query = apply_policy(&spec.query, &stripped_query, templates, &ctx)
		.map_err(|e| BackendError::Render(format!("query: {e}")))?;

	let mut req = BackendRequest {
		method: spec.method.clone(),
		url: url.clone(),
		headers,
		body,
	};

	let existing: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
	{
		let mut pairs = url.query_pairs_mut();
		for (k, v) in &query {
			if !existing.contains(k) {
				pairs.append_pair(k, v);
			}
		}
	}
	if url.query() == Some("") {
		url.set_query(None);
	}
	req.url = url;

	if let Some(defs) = &selected.group.forwards {
		for forward in resolve_forwards(defs, templates, &ctx)? {
			apply_forward(&mut req, forward);
		}
	}

	if spec.forward_proxy_headers {
		for (name, value) in &state.forward.headers {
			req.headers.insert(name.clone(), value.clone());
		}
	}

	Ok(req)
}

/// Allow whitelist (wildcard `*` means all), strip by lower-case name,
/// then custom templated values.
fn apply_policy(
	policy: &SelectPolicy,
	source: &BTreeMap<String, String>,
	templates: &Templates,
	ctx: &EvalContext,
) -> Result<BTreeMap<String, String>, crate::eval::EvalError> {
	let mut out = BTreeMap::new();
	for (name, value) in source {
		if policy.allows(name) {
			out.insert(name.clone(), value.clone());
		}
	}
	for name in &policy.strip {
		out.remove(&name.to_ascii_lowercase());
	}
	for (name, value) in &policy.custom {
		out.insert(name.to_ascii_lowercase(), value.render(templates, ctx)?);
	}
	Ok(out)
}

fn apply_forward(req: &mut BackendRequest, forward: ResolvedForward) {
	match forward {
		ResolvedForward::Authorization(value) => {
			req.headers.insert("authorization".to_string(), value);
		},
		ResolvedForward::Header { name, value } => {
			req.headers.insert(name, value);
		},
		ResolvedForward::Query { name, value } => {
			let mut url = req.url.clone();
			{
				let mut pairs = url.query_pairs_mut();
				pairs.append_pair(&name, &value);
			}
			req.url = url;
		},
	}
}

/// Invoke the backend, following `rel="next"` links up to the page bound
/// with loop detection. Populates the page list and the aggregate view
/// (the last page).
pub async fn invoke(
	client: &Client,
	spec: &BackendSpec,
	rendered: &BackendRequest,
	state: &mut State,
) -> Result<(), BackendError> {
	let max_pages = spec
		.pagination
		.as_ref()
		.map(|p| p.max_pages.max(1))
		.unwrap_or(1);
	let original_query: Vec<(String, String)> = rendered
		.url
		.query_pairs()
		.map(|(k, v)| (k.into_owned(), v.into_owned()))
		.collect();

	let mut visited: HashSet<String> = HashSet::new();
	let mut request = rendered.clone();
	state.backend.requested = true;

	loop {
		visited.insert(request.url.as_str().trim().to_string());
		let response = client
			.execute(&request, spec.timeout)
			.await
			.map_err(|e| BackendError::Transport(e.to_string()))?;

		let raw_body = String::from_utf8_lossy(&response.body).into_owned();
		let content_type = response
			.headers
			.get("content-type")
			.map(String::as_str)
			.unwrap_or("");
		let body = if content_type.contains("json") && !response.body.is_empty() {
			serde_json::from_slice(&response.body).map_err(|e| BackendError::Decode(e.to_string()))?
		} else {
			serde_json::Value::Null
		};

		let next = if spec.pagination.is_some() {
			response.headers.get("link").and_then(|v| next_link(v))
		} else {
			None
		};

		state.backend.pages.push(PageSnapshot {
			url: request.url.to_string(),
			status: response.status,
			headers: response.headers.clone(),
			body: body.clone(),
			raw_body: raw_body.clone(),
		});
		state.backend.status = response.status;
		state.backend.headers = response.headers;
		state.backend.body = body;
		state.backend.raw_body = raw_body;

		let Some(next) = next else {
			break;
		};
		if state.backend.pages.len() >= max_pages {
			break;
		}
		let next = next.trim().to_string();
		if visited.contains(&next) {
			break;
		}
		let next_url = match Url::parse(&next) {
			Ok(u) => u,
			Err(e) => {
				warn!(error = %e, url = %next, "ignoring unparseable pagination link");
				break;
			},
		};
		// Later pages keep the originally rendered query parameters unless
		// the link already pins them; the body goes only with page one.
		request = BackendRequest {
			method: rendered.method.clone(),
			url: merge_query(next_url, &original_query),
			headers: rendered.headers.clone(),
			body: None,
		};
	}

	state.backend.accepted = spec.is_accepted(state.backend.status);
	Ok(())
}

fn merge_query(mut url: Url, original: &[(String, String)]) -> Url {
	let existing: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
	{
		let mut pairs = url.query_pairs_mut();
		for (k, v) in original {
			if !existing.contains(k) {
				pairs.append_pair(k, v);
			}
		}
	}
	if url.query() == Some("") {
		url.set_query(None);
	}
	url
}

/// `Link: <url>; rel="next"` parsing; other link parameters are ignored.
fn next_link(value: &str) -> Option<String> {
	for entry in value.split(',') {
		let mut segments = entry.split(';');
		let target = segments.next()?.trim();
		let Some(url) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) else {
			continue;
		};
		for param in segments {
			let Some((k, v)) = param.split_once('=') else {
				continue;
			};
			if k.trim().eq_ignore_ascii_case("rel")
				&& v.trim().trim_matches('"').eq_ignore_ascii_case("next")
			{
				return Some(url.to_string());
			}
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn link_header_next() {
		assert_eq!(
			next_link("<https://api.example.com/items?page=2>; rel=\"next\""),
			Some("https://api.example.com/items?page=2".to_string())
		);
		assert_eq!(
			next_link(
				"<https://api.example.com/items?page=9>; rel=\"last\", <https://api.example.com/items?page=2>; rel=next"
			),
			Some("https://api.example.com/items?page=2".to_string())
		);
		assert_eq!(next_link("<https://api.example.com/x>; rel=\"prev\""), None);
		assert_eq!(next_link("garbage"), None);
	}

	#[test]
	fn merge_query_keeps_link_values() {
		let url = Url::parse("https://api.example.com/items?page=2").unwrap();
		let merged = merge_query(
			url,
			&[
				("page".to_string(), "1".to_string()),
				("limit".to_string(), "50".to_string()),
			],
		);
		let pairs: Vec<(String, String)> = merged
			.query_pairs()
			.map(|(k, v)| (k.into_owned(), v.into_owned()))
			.collect();
		assert_eq!(
			pairs,
			vec![
				("page".to_string(), "2".to_string()),
				("limit".to_string(), "50".to_string()),
			]
		);
	}

	#[test]
	fn policy_allow_strip_custom() {
		let mut policy = SelectPolicy {
			allow: vec!["*".to_string()],
			strip: vec!["X-Internal".to_string()],
			custom: BTreeMap::new(),
		};
		let source = BTreeMap::from([
			("accept".to_string(), "application/json".to_string()),
			("x-internal".to_string(), "1".to_string()),
		]);
		let templates = Templates::new();
		let ctx = EvalContext::default();
		let out = apply_policy(&policy, &source, &templates, &ctx).unwrap();
		assert_eq!(out.get("accept").map(String::as_str), Some("application/json"));
		assert!(!out.contains_key("x-internal"));

		policy.allow = vec!["accept".to_string()];
		let out = apply_policy(&policy, &source, &templates, &ctx).unwrap();
		assert_eq!(out.len(), 1);

		policy.allow = vec![];
		let out = apply_policy(&policy, &source, &templates, &ctx).unwrap();
		assert!(out.is_empty());
	}
}

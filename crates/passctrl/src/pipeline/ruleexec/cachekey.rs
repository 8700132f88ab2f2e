use std::collections::BTreeMap;

use crate::cache::sha256_hex;
use crate::client::BackendRequest;
use crate::types::{BackendCacheConfig, CacheMode};

/// Trace and timing headers that never participate in the backend hash.
const EXCLUDED_HEADERS: &[&str] = &[
	"traceparent",
	"tracestate",
	"x-cloud-trace-context",
	"x-amzn-trace-id",
	"uber-trace-id",
	"x-request-start",
	"x-timer",
];
const EXCLUDED_PREFIXES: &[&str] = &["x-b3-"];

/// Proxy headers excluded unless the rule opts them into the key.
const PROXY_HEADERS: &[&str] = &["forwarded", "x-real-ip"];
const PROXY_PREFIXES: &[&str] = &["x-forwarded-", "cf-"];

/// `base-key | rule-name | backend-hash | upstream-vars-hash?` — the last
/// segment only in strict mode.
pub fn rule_cache_key(
	base_key: &str,
	rule_name: &str,
	rendered: Option<&BackendRequest>,
	cache: &BackendCacheConfig,
	correlation_header: &str,
	upstream: &BTreeMap<String, BTreeMap<String, serde_json::Value>>,
) -> String {
	let backend_hash = rendered
		.map(|r| backend_hash(r, cache, correlation_header))
		.unwrap_or_default();
	match cache.mode {
		CacheMode::Strict => {
			let vars_hash = upstream_vars_hash(upstream);
			format!("{base_key}|{rule_name}|{backend_hash}|{vars_hash}")
		},
		CacheMode::Loose => format!("{base_key}|{rule_name}|{backend_hash}"),
	}
}

fn backend_hash(req: &BackendRequest, cache: &BackendCacheConfig, correlation_header: &str) -> String {
	let url = req.url.as_str();
	if url.is_empty() {
		return String::new();
	}
	let mut canon = format!("{}\n{}\n", req.method, url);
	for (name, value) in &req.headers {
		if excluded_header(name, cache, correlation_header) {
			continue;
		}
		canon.push_str(name);
		canon.push('=');
		canon.push_str(value);
		canon.push('\n');
	}
	sha256_hex(&canon)
}

fn excluded_header(name: &str, cache: &BackendCacheConfig, correlation_header: &str) -> bool {
	if name.eq_ignore_ascii_case(correlation_header) {
		return true;
	}
	if EXCLUDED_HEADERS.contains(&name) || EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p)) {
		return true;
	}
	if !cache.include_proxy_headers
		&& (PROXY_HEADERS.contains(&name) || PROXY_PREFIXES.iter().any(|p| name.starts_with(p)))
	{
		return true;
	}
	false
}

/// Stable hash over all prior rules' exported-variable maps. BTreeMap
/// ordering makes the serialization deterministic.
fn upstream_vars_hash(upstream: &BTreeMap<String, BTreeMap<String, serde_json::Value>>) -> String {
	let serialized = serde_json::to_string(upstream).unwrap_or_default();
	sha256_hex(&serialized)
}

/// `max-age` from a `Cache-Control` response header, if any.
pub fn cache_control_max_age(value: &str) -> Option<u64> {
	value.split(',').find_map(|directive| {
		let (k, v) = directive.split_once('=')?;
		if k.trim().eq_ignore_ascii_case("max-age") {
			v.trim().parse().ok()
		} else {
			None
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Method;
	use serde_json::json;
	use url::Url;

	fn request(headers: &[(&str, &str)]) -> BackendRequest {
		BackendRequest {
			method: Method::GET,
			url: Url::parse("https://api.example.com/check").unwrap(),
			headers: headers
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			body: None,
		}
	}

	fn cfg() -> BackendCacheConfig {
		BackendCacheConfig::default()
	}

	#[test]
	fn trace_headers_do_not_disturb_the_key() {
		let plain = request(&[("accept", "application/json")]);
		let traced = request(&[
			("accept", "application/json"),
			("traceparent", "00-abc-def-01"),
			("x-b3-traceid", "abc"),
			("x-request-id", "r1"),
		]);
		let a = rule_cache_key("base", "r", Some(&plain), &cfg(), "x-request-id", &BTreeMap::new());
		let b = rule_cache_key("base", "r", Some(&traced), &cfg(), "x-request-id", &BTreeMap::new());
		assert_eq!(a, b);
	}

	#[test]
	fn proxy_headers_excluded_unless_opted_in() {
		let plain = request(&[]);
		let proxied = request(&[("x-forwarded-for", "203.0.113.5"), ("cf-ray", "x")]);
		let cfg_out = cfg();
		assert_eq!(
			rule_cache_key("b", "r", Some(&plain), &cfg_out, "x-request-id", &BTreeMap::new()),
			rule_cache_key("b", "r", Some(&proxied), &cfg_out, "x-request-id", &BTreeMap::new()),
		);
		let cfg_in = BackendCacheConfig {
			include_proxy_headers: true,
			..cfg()
		};
		assert_ne!(
			rule_cache_key("b", "r", Some(&plain), &cfg_in, "x-request-id", &BTreeMap::new()),
			rule_cache_key("b", "r", Some(&proxied), &cfg_in, "x-request-id", &BTreeMap::new()),
		);
	}

	#[test]
	fn strict_mode_keys_on_upstream_exports() {
		let req = request(&[]);
		let up1 = BTreeMap::from([(
			"earlier".to_string(),
			BTreeMap::from([("team".to_string(), json!("core"))]),
		)]);
		let up2 = BTreeMap::from([(
			"earlier".to_string(),
			BTreeMap::from([("team".to_string(), json!("infra"))]),
		)]);
		let a = rule_cache_key("b", "r", Some(&req), &cfg(), "x-request-id", &up1);
		let b = rule_cache_key("b", "r", Some(&req), &cfg(), "x-request-id", &up2);
		assert_ne!(a, b);

		let loose = BackendCacheConfig {
			mode: CacheMode::Loose,
			..cfg()
		};
		let a = rule_cache_key("b", "r", Some(&req), &loose, "x-request-id", &up1);
		let b = rule_cache_key("b", "r", Some(&req), &loose, "x-request-id", &up2);
		assert_eq!(a, b);
	}

	#[test]
	fn absent_backend_hashes_empty() {
		let key = rule_cache_key("b", "r", None, &cfg(), "x-request-id", &BTreeMap::new());
		assert!(key.starts_with("b|r||"));
	}

	#[test]
	fn max_age_parsing() {
		assert_eq!(cache_control_max_age("max-age=120"), Some(120));
		assert_eq!(cache_control_max_age("public, max-age=60, immutable"), Some(60));
		assert_eq!(cache_control_max_age("no-store"), None);
	}
}

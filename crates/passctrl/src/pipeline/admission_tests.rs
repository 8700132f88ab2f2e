use std::collections::BTreeMap;
use std::sync::Arc;

use super::*;
use crate::config::parse_config;
use crate::pipeline::Agent;
use crate::pipeline::state::{RequestSnapshot, State};
use crate::types::CompiledConfig;

const BASE_CONFIG: &str = r#"
server:
  developmentMode: false
trustedProxies:
  - 127.0.0.0/8
  - 198.51.100.0/24
endpoints:
  main:
    authentication:
      required: true
      allow:
        authorization: [bearer, basic]
        headers: [x-api-token]
        query: [token]
"#;

fn setup(yaml: &str) -> (AdmissionAgent, Arc<CompiledConfig>) {
	let config = Arc::new(parse_config(yaml).unwrap());
	(AdmissionAgent::new(config.clone()), config)
}

fn state(
	config: &Arc<CompiledConfig>,
	remote: &str,
	headers: &[(&str, &str)],
	query: &[(&str, &str)],
) -> State {
	let endpoint = config.endpoint("main").unwrap().clone();
	let request = RequestSnapshot {
		method: "GET".to_string(),
		path: "/main/auth".to_string(),
		host: "gw.example.com".to_string(),
		headers: headers
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect(),
		query: query
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect(),
		remote_addr: remote.to_string(),
	};
	State::new(
		endpoint,
		request,
		"test-correlation".to_string(),
		BTreeMap::new(),
		BTreeMap::new(),
	)
}

#[tokio::test]
async fn untrusted_remote_with_forwarding_rejected() {
	// Only loopback is trusted; the remote is not.
	let yaml = BASE_CONFIG.replace("  - 198.51.100.0/24\n", "");
	let (agent, config) = setup(&yaml);
	let mut st = state(
		&config,
		"198.51.100.10:443",
		&[
			("authorization", "Bearer t"),
			("x-forwarded-for", "203.0.113.7"),
		],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "fail");
	assert!(!st.admission.authenticated);
	assert_eq!(st.admission.reason, "untrusted proxy rejected");
}

#[tokio::test]
async fn trusted_chain_accepted() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"127.0.0.1:12345",
		&[
			("authorization", "Bearer t"),
			("x-forwarded-for", "203.0.113.5, 198.51.100.10"),
		],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "pass");
	assert_eq!(st.admission.client_ip, "203.0.113.5");
	assert!(st.admission.trusted_proxy);
	assert_eq!(
		st.request.headers.get("x-forwarded-for").map(String::as_str),
		Some("203.0.113.5, 198.51.100.10")
	);
}

#[tokio::test]
async fn untrusted_claimed_hop_rejected() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"127.0.0.1:12345",
		&[
			("authorization", "Bearer t"),
			("x-forwarded-for", "203.0.113.5, 203.0.113.9"),
		],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "fail");
	assert_eq!(
		st.admission.reason,
		"forwarded chain includes untrusted proxy"
	);
}

#[tokio::test]
async fn forwarded_and_xff_must_agree() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"127.0.0.1:12345",
		&[
			("authorization", "Bearer t"),
			("forwarded", "for=203.0.113.5"),
			("x-forwarded-for", "203.0.113.6"),
		],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "fail");
	assert!(st.admission.reason.contains("disagree"));
}

#[tokio::test]
async fn forwarded_ports_do_not_break_agreement() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"127.0.0.1:12345",
		&[
			("authorization", "Bearer t"),
			("forwarded", "for=\"203.0.113.5:9999\";proto=https"),
			("x-forwarded-for", "203.0.113.5"),
		],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "pass");
	assert_eq!(st.admission.client_ip, "203.0.113.5");
	assert_eq!(
		st.request.headers.get("forwarded").map(String::as_str),
		Some("for=\"203.0.113.5\"; proto=https")
	);
}

#[tokio::test]
async fn development_mode_strips_untrusted_forwarding() {
	let yaml = BASE_CONFIG.replace("developmentMode: false", "developmentMode: true");
	let (agent, config) = setup(&yaml);
	// The remote itself is outside the trusted prefixes.
	let mut st = state(
		&config,
		"203.0.113.50:443",
		&[
			("authorization", "Bearer t"),
			("x-forwarded-for", "203.0.113.7"),
			("x-forwarded-proto", "https"),
		],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "pass");
	assert!(st.admission.proxy_stripped);
	assert_eq!(st.admission.client_ip, "203.0.113.50");
	assert!(!st.request.headers.contains_key("x-forwarded-for"));
	assert!(!st.request.headers.contains_key("x-forwarded-proto"));
}

#[tokio::test]
async fn no_forwarding_uses_remote() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"203.0.113.50:9000",
		&[("authorization", "Bearer t")],
		&[],
	);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "pass");
	assert_eq!(st.admission.client_ip, "203.0.113.50");
	assert!(!st.admission.trusted_proxy);
}

#[tokio::test]
async fn basic_credentials_decoded() {
	let (agent, config) = setup(BASE_CONFIG);
	// ada:s3cret
	let mut st = state(
		&config,
		"127.0.0.1:1",
		&[("authorization", "Basic YWRhOnMzY3JldA==")],
		&[],
	);
	agent.evaluate(&mut st).await;
	assert_eq!(
		st.admission.credentials,
		vec![Credential::Basic {
			user: "ada".to_string(),
			password: "s3cret".to_string(),
		}]
	);
	assert!(st.credential_tag().starts_with("authorization:basic:"));
}

#[tokio::test]
async fn header_and_query_credentials() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"127.0.0.1:1",
		&[("x-api-token", "abc")],
		&[("token", "qqq")],
	);
	agent.evaluate(&mut st).await;
	assert_eq!(st.admission.credentials.len(), 2);
	assert_eq!(st.admission.credentials[0].kind(), "header");
	assert_eq!(st.admission.credentials[1].kind(), "query");
	// Header credentials outrank query for the cache-key tag.
	assert!(st.credential_tag().starts_with("header:x-api-token:"));
}

#[tokio::test]
async fn authorization_outranks_header_for_the_tag() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(
		&config,
		"127.0.0.1:1",
		&[("authorization", "Bearer t"), ("x-api-token", "abc")],
		&[],
	);
	agent.evaluate(&mut st).await;
	assert!(st.credential_tag().starts_with("authorization:bearer:"));
}

#[tokio::test]
async fn missing_required_credentials_prepare_challenge() {
	let (agent, config) = setup(BASE_CONFIG);
	let mut st = state(&config, "127.0.0.1:1", &[], &[]);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "fail");
	assert_eq!(st.response.status, 401);
	assert_eq!(
		st.response.headers.get("www-authenticate").map(String::as_str),
		Some("Bearer realm=\"main\"")
	);
}

#[tokio::test]
async fn optional_authentication_not_provided() {
	let yaml = BASE_CONFIG.replace("required: true", "required: false");
	let (agent, config) = setup(&yaml);
	let mut st = state(&config, "127.0.0.1:1", &[], &[]);
	let report = agent.evaluate(&mut st).await;
	assert_eq!(report.decision, "pass");
	assert_eq!(st.admission.reason, "optional authentication not provided");
	assert!(st.credential_tag().starts_with("ip:"));
}

#[tokio::test]
async fn disallowed_scheme_is_ignored() {
	let yaml = BASE_CONFIG.replace("authorization: [bearer, basic]", "authorization: [basic]");
	let (agent, config) = setup(&yaml);
	let mut st = state(&config, "127.0.0.1:1", &[("authorization", "Bearer t")], &[]);
	let report = agent.evaluate(&mut st).await;
	// Bearer not allowed, no other credential: admission fails.
	assert_eq!(report.decision, "fail");
	assert!(st.admission.credentials.is_empty());
}

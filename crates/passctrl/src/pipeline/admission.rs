use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;

use super::state::{Credential, State, credential_tag};
use super::{Agent, AgentReport};
use crate::http::forwarded::{self, ForwardedChain};
use crate::types::CompiledConfig;
use crate::{debug, trace};

const FORWARDED: &str = "forwarded";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const WWW_AUTHENTICATE: &str = "www-authenticate";

/// Decides whether the request may be evaluated at all: validates any
/// claimed proxy chain against the trusted prefixes and extracts the
/// credentials later rules match on.
pub struct AdmissionAgent {
	config: Arc<CompiledConfig>,
}

impl AdmissionAgent {
	pub fn new(config: Arc<CompiledConfig>) -> Self {
		AdmissionAgent { config }
	}
}

#[async_trait::async_trait]
impl Agent for AdmissionAgent {
	fn name(&self) -> &'static str {
		"admission"
	}

	async fn evaluate(&self, state: &mut State) -> AgentReport {
		state.admission.captured_at = Some(SystemTime::now());
		state.admission.allow = state.endpoint.authentication.allow.enumerate();

		if let Err(reason) = self.admit_client(state) {
			state.admission.authenticated = false;
			state.admission.decision = "fail".to_string();
			state.admission.reason = reason.clone();
			state.capture_admission_snapshot();
			return AgentReport::new(self.name(), "fail", reason);
		}

		self.extract_credentials(state);

		let authentication = &state.endpoint.authentication;
		let (decision, reason) = if state.admission.credentials.is_empty() && authentication.required {
			if let Some(challenge) = &authentication.challenge {
				state.response.status = 401;
				state
					.response
					.headers
					.insert(WWW_AUTHENTICATE.to_string(), challenge.header_value());
			}
			("fail", "authentication required".to_string())
		} else if state.admission.credentials.is_empty() && !authentication.required {
			(
				"pass",
				"optional authentication not provided".to_string(),
			)
		} else {
			("pass", "credentials extracted".to_string())
		};

		state.admission.authenticated = decision == "pass";
		state.admission.decision = decision.to_string();
		state.admission.reason = reason.clone();
		state.capture_admission_snapshot();
		AgentReport::new(self.name(), decision, reason)
	}
}

impl AdmissionAgent {
	/// Proxy-chain policy: no claim means the remote stands as client;
	/// a claim must parse, agree across headers, and consist of trusted
	/// hops only.
	fn admit_client(&self, state: &mut State) -> Result<(), String> {
		let forwarded_raw = state.request.headers.get(FORWARDED).cloned();
		let xff_raw = state.request.headers.get(X_FORWARDED_FOR).cloned();
		let remote_ip = forwarded::parse_hop(&state.request.remote_addr).ok();

		if forwarded_raw.is_none() && xff_raw.is_none() {
			state.admission.client_ip = remote_ip
				.map(|ip| ip.to_string())
				.unwrap_or_else(|| state.request.remote_addr.clone());
			return Ok(());
		}

		let Some(remote_ip) = remote_ip else {
			return Err("invalid remote address with forwarding claimed".to_string());
		};

		state.admission.forwarded_original = forwarded_raw.clone().unwrap_or_default();
		state.admission.xff_original = xff_raw.clone().unwrap_or_default();

		let chain = match self.parse_chain(forwarded_raw.as_deref(), xff_raw.as_deref()) {
			Ok(chain) => chain,
			Err(reason) => return Err(reason),
		};

		let untrusted = self.first_untrusted(&chain.hops, remote_ip);
		if let Some((ip, is_remote)) = untrusted {
			if self.config.server.development_mode {
				self.strip_forwarding(state);
				state.admission.proxy_stripped = true;
				state.admission.proxy_note =
					format!("untrusted proxy {ip} stripped in development mode");
				state.admission.client_ip = remote_ip.to_string();
				return Ok(());
			}
			return Err(if is_remote {
				"untrusted proxy rejected".to_string()
			} else {
				"forwarded chain includes untrusted proxy".to_string()
			});
		}

		// Chain accepted: first hop is the client, and the request view is
		// rewritten to the canonical header forms.
		state.admission.client_ip = chain.hops[0].to_string();
		state.admission.trusted_proxy = true;
		let canonical_xff = forwarded::canonical_xff(&chain.hops);
		state.admission.xff_sanitized = canonical_xff.clone();
		state
			.request
			.headers
			.insert(X_FORWARDED_FOR.to_string(), canonical_xff.clone());
		state
			.forward
			.headers
			.insert(X_FORWARDED_FOR.to_string(), canonical_xff);
		if let Some(forwarded) = &chain.forwarded {
			let canonical = forwarded.canonical();
			state.admission.forwarded_sanitized = canonical.clone();
			state
				.request
				.headers
				.insert(FORWARDED.to_string(), canonical.clone());
			state
				.forward
				.headers
				.insert(FORWARDED.to_string(), canonical);
		}
		for name in ["x-forwarded-proto", "x-forwarded-host"] {
			if let Some(v) = state.request.headers.get(name) {
				state.forward.headers.insert(name.to_string(), v.clone());
			}
		}
		Ok(())
	}

	fn parse_chain(
		&self,
		forwarded_raw: Option<&str>,
		xff_raw: Option<&str>,
	) -> Result<ParsedChain, String> {
		let forwarded = forwarded_raw
			.map(forwarded::parse_forwarded)
			.transpose()
			.map_err(|e| format!("malformed Forwarded header: {e}"))?;
		let xff = xff_raw
			.map(forwarded::parse_xff)
			.transpose()
			.map_err(|e| format!("malformed X-Forwarded-For header: {e}"))?;

		let hops = match (&forwarded, &xff) {
			(Some(f), Some(x)) => {
				// Ports were already discarded by parsing; hop equality is
				// IP equality.
				if f.hops != *x {
					return Err("Forwarded and X-Forwarded-For chains disagree".to_string());
				}
				f.hops.clone()
			},
			(Some(f), None) => f.hops.clone(),
			(None, Some(x)) => x.clone(),
			(None, None) => unreachable!("caller checked for a forwarding claim"),
		};
		if hops.is_empty() {
			return Err("malformed X-Forwarded-For header: empty chain".to_string());
		}
		Ok(ParsedChain { hops, forwarded })
	}

	/// Every claimed proxy (all hops after the first) plus the remote must
	/// be trusted. Returns the first violation and whether it was the
	/// remote itself.
	fn first_untrusted(&self, hops: &[IpAddr], remote: IpAddr) -> Option<(IpAddr, bool)> {
		if !forwarded::is_trusted(remote, &self.config.trusted_proxies) {
			return Some((remote, true));
		}
		hops
			.iter()
			.skip(1)
			.find(|ip| !forwarded::is_trusted(**ip, &self.config.trusted_proxies))
			.map(|ip| (*ip, false))
	}

	fn strip_forwarding(&self, state: &mut State) {
		state
			.request
			.headers
			.retain(|name, _| name != FORWARDED && !name.starts_with("x-forwarded-"));
	}

	/// Credentials in cache-key priority order: Authorization first, then
	/// named headers, then named query parameters, then the anonymous
	/// credential when permitted.
	fn extract_credentials(&self, state: &mut State) {
		let allow = &state.endpoint.authentication.allow;
		let mut credentials = Vec::new();

		if let Some(authorization) = state.request.headers.get("authorization") {
			let (scheme, param) = match authorization.split_once(char::is_whitespace) {
				Some((s, p)) => (s.trim(), p.trim()),
				None => (authorization.trim(), ""),
			};
			let allowed = |name: &str| {
				allow
					.authorization
					.iter()
					.any(|s| s.to_string().eq_ignore_ascii_case(name))
			};
			if scheme.eq_ignore_ascii_case("basic") && allowed("basic") {
				match BASE64_STANDARD.decode(param) {
					Ok(decoded) => {
						let decoded = String::from_utf8_lossy(&decoded).into_owned();
						let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
						credentials.push(Credential::Basic {
							user: user.to_string(),
							password: password.to_string(),
						});
					},
					Err(e) => debug!(error = %e, "ignoring undecodable basic credential"),
				}
			} else if scheme.eq_ignore_ascii_case("bearer") && allowed("bearer") {
				credentials.push(Credential::Bearer {
					token: param.to_string(),
				});
			} else {
				trace!(scheme, "authorization scheme not allowed by endpoint");
			}
		}

		for name in &allow.headers {
			if let Some(value) = state.request.headers.get(name)
				&& !value.is_empty()
			{
				credentials.push(Credential::Header {
					name: name.clone(),
					value: value.clone(),
				});
			}
		}
		for name in &allow.query {
			if let Some(value) = state.request.query.get(name)
				&& !value.is_empty()
			{
				credentials.push(Credential::Query {
					name: name.clone(),
					value: value.clone(),
				});
			}
		}
		if allow.none {
			credentials.push(Credential::None);
		}

		let tag = credentials
			.iter()
			.find(|c| !matches!(c, Credential::None))
			.map(credential_tag)
			.unwrap_or_else(|| format!("ip:{}", state.admission.client_ip));
		state.set_credential_tag(tag);
		state.admission.credentials = credentials;
	}
}

struct ParsedChain {
	hops: Vec<IpAddr>,
	forwarded: Option<ForwardedChain>,
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod tests;

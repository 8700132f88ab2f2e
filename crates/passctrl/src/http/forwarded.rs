use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ForwardedError {
	#[error("empty forwarded hop")]
	EmptyHop,
	#[error("invalid forwarded hop {0:?}")]
	InvalidHop(String),
	#[error("obfuscated forwarded hop {0:?}")]
	ObfuscatedHop(String),
	#[error("malformed forwarded element {0:?}")]
	MalformedElement(String),
	#[error("forwarded element is missing the for directive")]
	MissingFor,
}

/// One element of an RFC 7239 `Forwarded` header after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedElement {
	pub hop: IpAddr,
	pub by: Option<IpAddr>,
	pub host: Option<String>,
	pub proto: Option<String>,
}

/// A validated proxy chain: the apparent client first, claimed proxies after.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedChain {
	pub hops: Vec<IpAddr>,
	pub elements: Vec<ForwardedElement>,
}

impl ForwardedChain {
	/// Canonical `for="…"; proto=…` form, recognized directives only.
	pub fn canonical(&self) -> String {
		self
			.elements
			.iter()
			.map(|el| {
				let mut parts = vec![format!("for=\"{}\"", el.hop)];
				if let Some(by) = &el.by {
					parts.push(format!("by=\"{by}\""));
				}
				if let Some(host) = &el.host {
					parts.push(format!("host={host}"));
				}
				if let Some(proto) = &el.proto {
					parts.push(format!("proto={proto}"));
				}
				parts.join("; ")
			})
			.collect::<Vec<_>>()
			.join(", ")
	}
}

/// Parse one hop: a bare IP, `ip:port`, `[v6]`, or `[v6]:port`.
pub fn parse_hop(raw: &str) -> Result<IpAddr, ForwardedError> {
	let s = raw.trim().trim_matches('"').trim();
	if s.is_empty() {
		return Err(ForwardedError::EmptyHop);
	}
	if s.starts_with('_') || s.eq_ignore_ascii_case("unknown") {
		return Err(ForwardedError::ObfuscatedHop(s.to_string()));
	}
	if let Ok(ip) = s.parse::<IpAddr>() {
		return Ok(ip);
	}
	if let Ok(sa) = s.parse::<SocketAddr>() {
		return Ok(sa.ip());
	}
	if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']'))
		&& let Ok(ip) = inner.parse::<IpAddr>()
	{
		return Ok(ip);
	}
	Err(ForwardedError::InvalidHop(s.to_string()))
}

/// Parse an `X-Forwarded-For` value into its hop list.
pub fn parse_xff(value: &str) -> Result<Vec<IpAddr>, ForwardedError> {
	value.split(',').map(parse_hop).collect()
}

/// Canonical joined form for a validated `X-Forwarded-For` chain.
pub fn canonical_xff(hops: &[IpAddr]) -> String {
	hops
		.iter()
		.map(|ip| ip.to_string())
		.collect::<Vec<_>>()
		.join(", ")
}

/// Parse an RFC 7239 `Forwarded` value. Every element must carry a
/// syntactically valid, non-obfuscated `for` directive.
pub fn parse_forwarded(value: &str) -> Result<ForwardedChain, ForwardedError> {
	let mut elements = Vec::new();
	for raw in split_quoted(value, ',') {
		let raw = raw.trim();
		if raw.is_empty() {
			continue;
		}
		let mut hop = None;
		let mut by = None;
		let mut host = None;
		let mut proto = None;
		for pair in split_quoted(raw, ';') {
			let pair = pair.trim();
			if pair.is_empty() {
				continue;
			}
			let Some((k, v)) = pair.split_once('=') else {
				return Err(ForwardedError::MalformedElement(raw.to_string()));
			};
			let v = v.trim().trim_matches('"');
			match k.trim().to_ascii_lowercase().as_str() {
				"for" => hop = Some(parse_hop(v)?),
				// A by directive we cannot parse as an address is dropped
				// rather than failing the chain; only for identifies hops.
				"by" => by = parse_hop(v).ok(),
				"host" => host = Some(v.to_string()),
				"proto" => proto = Some(v.to_ascii_lowercase()),
				_ => {},
			}
		}
		let Some(hop) = hop else {
			return Err(ForwardedError::MissingFor);
		};
		elements.push(ForwardedElement {
			hop,
			by,
			host,
			proto,
		});
	}
	let hops = elements.iter().map(|el| el.hop).collect();
	Ok(ForwardedChain { hops, elements })
}

/// Split on a separator, ignoring separators inside double quotes.
fn split_quoted(value: &str, sep: char) -> Vec<&str> {
	let mut out = Vec::new();
	let mut start = 0;
	let mut quoted = false;
	for (i, c) in value.char_indices() {
		match c {
			'"' => quoted = !quoted,
			c if c == sep && !quoted => {
				out.push(&value[start..i]);
				start = i + 1;
			},
			_ => {},
		}
	}
	out.push(&value[start..]);
	out
}

pub fn is_trusted(ip: IpAddr, trusted: &[IpNet]) -> bool {
	trusted.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_forms() {
		assert_eq!(parse_hop("203.0.113.5").unwrap(), ip("203.0.113.5"));
		assert_eq!(parse_hop("203.0.113.5:8080").unwrap(), ip("203.0.113.5"));
		assert_eq!(parse_hop("\"203.0.113.5:8080\"").unwrap(), ip("203.0.113.5"));
		assert_eq!(parse_hop("2001:db8::1").unwrap(), ip("2001:db8::1"));
		assert_eq!(parse_hop("[2001:db8::1]").unwrap(), ip("2001:db8::1"));
		assert_eq!(parse_hop("[2001:db8::1]:443").unwrap(), ip("2001:db8::1"));
	}

	#[test]
	fn hop_rejections() {
		assert_eq!(parse_hop(" "), Err(ForwardedError::EmptyHop));
		assert_eq!(
			parse_hop("_hidden"),
			Err(ForwardedError::ObfuscatedHop("_hidden".to_string()))
		);
		assert_eq!(
			parse_hop("unknown"),
			Err(ForwardedError::ObfuscatedHop("unknown".to_string()))
		);
		assert!(matches!(
			parse_hop("example.com"),
			Err(ForwardedError::InvalidHop(_))
		));
	}

	#[test]
	fn xff_chain() {
		let hops = parse_xff("203.0.113.5, 198.51.100.10").unwrap();
		assert_eq!(hops, vec![ip("203.0.113.5"), ip("198.51.100.10")]);
		assert_eq!(canonical_xff(&hops), "203.0.113.5, 198.51.100.10");
	}

	#[test]
	fn forwarded_elements() {
		let chain =
			parse_forwarded("for=\"203.0.113.5:1234\";proto=HTTPS, for=198.51.100.10;by=10.0.0.1")
				.unwrap();
		assert_eq!(chain.hops, vec![ip("203.0.113.5"), ip("198.51.100.10")]);
		assert_eq!(
			chain.canonical(),
			"for=\"203.0.113.5\"; proto=https, for=\"198.51.100.10\"; by=\"10.0.0.1\""
		);
	}

	#[test]
	fn forwarded_obfuscated_fails() {
		assert!(parse_forwarded("for=_hidden").is_err());
		assert!(parse_forwarded("for=unknown").is_err());
		assert!(parse_forwarded("proto=https").is_err());
	}

	#[test]
	fn trusted_prefixes() {
		let nets: Vec<IpNet> = vec!["127.0.0.0/8".parse().unwrap(), "10.1.0.0/16".parse().unwrap()];
		assert!(is_trusted(ip("127.0.0.1"), &nets));
		assert!(is_trusted(ip("10.1.2.3"), &nets));
		assert!(!is_trusted(ip("10.2.0.1"), &nets));
		assert!(!is_trusted(ip("203.0.113.5"), &nets));
	}

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}
}

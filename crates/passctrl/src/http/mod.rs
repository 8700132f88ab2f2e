pub mod forwarded;

use std::collections::BTreeMap;

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

/// Collapse a header map into lower-cased names, first value wins.
pub fn normalize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
	let mut out = BTreeMap::new();
	for (name, value) in headers {
		let name = name.as_str().to_ascii_lowercase();
		if out.contains_key(&name) {
			continue;
		}
		if let Ok(v) = value.to_str() {
			out.insert(name, v.to_string());
		}
	}
	out
}

/// Query parameters with lower-cased names, first value wins.
pub fn normalize_query(uri: &Uri) -> BTreeMap<String, String> {
	let mut out = BTreeMap::new();
	let Some(q) = uri.query() else {
		return out;
	};
	for pair in q.split('&') {
		if pair.is_empty() {
			continue;
		}
		let (k, v) = match pair.split_once('=') {
			Some((k, v)) => (k, v),
			None => (pair, ""),
		};
		let k = percent_decode(k).to_ascii_lowercase();
		if out.contains_key(&k) {
			continue;
		}
		out.insert(k, percent_decode(v));
	}
	out
}

fn percent_decode(s: &str) -> String {
	let mut out = Vec::with_capacity(s.len());
	let bytes = s.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'%' => {
				let hi = bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16));
				let lo = bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16));
				match (hi, lo) {
					(Some(hi), Some(lo)) => {
						out.push((hi * 16 + lo) as u8);
						i += 3;
					},
					_ => {
						out.push(b'%');
						i += 1;
					},
				}
			},
			b'+' => {
				out.push(b' ');
				i += 1;
			},
			b => {
				out.push(b);
				i += 1;
			},
		}
	}
	String::from_utf8_lossy(&out).into_owned()
}

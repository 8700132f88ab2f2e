use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use crate::http::{HeaderMap, HeaderName, HeaderValue, Method};
use crate::warn;

/// Hard ceiling on bytes consumed from any backend response body.
pub const MAX_BODY_BYTES: usize = 1 << 20;

/// Backend default deadline when a rule does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	#[error("request build: {0}")]
	Build(String),
	#[error("transport: {0}")]
	Transport(#[from] reqwest::Error),
}

/// A fully rendered backend request, ready to send.
#[derive(Debug, Clone)]
pub struct BackendRequest {
	pub method: Method,
	pub url: Url,
	pub headers: BTreeMap<String, String>,
	pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
	pub status: u16,
	pub headers: BTreeMap<String, String>,
	pub body: bytes::Bytes,
}

/// Shared outbound HTTP client for rule backends. Redirects are never
/// followed; pagination is the only sanctioned multi-request mechanism.
#[derive(Clone)]
pub struct Client {
	inner: reqwest::Client,
}

impl Client {
	pub fn new() -> anyhow::Result<Self> {
		let inner = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::none())
			.build()?;
		Ok(Client { inner })
	}

	pub async fn execute(
		&self,
		req: &BackendRequest,
		timeout: Duration,
	) -> Result<BackendResponse, ClientError> {
		let mut headers = HeaderMap::new();
		for (name, value) in &req.headers {
			let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
				warn!(header = %name, "dropping invalid backend header name");
				continue;
			};
			let Ok(value) = HeaderValue::from_str(value) else {
				warn!(header = %name, "dropping invalid backend header value");
				continue;
			};
			headers.insert(name, value);
		}
		let mut builder = self
			.inner
			.request(req.method.clone(), req.url.clone())
			.headers(headers)
			.timeout(timeout);
		if let Some(body) = &req.body {
			builder = builder.body(body.clone());
		}
		let mut resp = builder.send().await?;
		let status = resp.status().as_u16();
		let headers = crate::http::normalize_headers(resp.headers());
		let mut body = Vec::new();
		while let Some(chunk) = resp.chunk().await? {
			let remaining = MAX_BODY_BYTES - body.len();
			if chunk.len() >= remaining {
				body.extend_from_slice(&chunk[..remaining]);
				break;
			}
			body.extend_from_slice(&chunk);
		}
		Ok(BackendResponse {
			status,
			headers,
			body: bytes::Bytes::from(body),
		})
	}
}

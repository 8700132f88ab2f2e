use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::json;

use crate::cache::DecisionCache;
use crate::client::Client;
use crate::http::{Body, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use crate::pipeline::Pipeline;
use crate::pipeline::state::RequestSnapshot;
use crate::store::Stores;
use crate::types::{CompiledConfig, Endpoint};
use crate::warn;

#[derive(Clone)]
pub struct AppState {
	pub stores: Stores,
	pub cache: Arc<dyn DecisionCache>,
	pub client: Client,
}

/// All routes are resolved against the configuration snapshot, so a
/// hot-reload never requires a router rebuild.
pub fn router(state: AppState) -> Router {
	Router::new().fallback(handle).with_state(state)
}

async fn handle(
	State(app): State<AppState>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	req: Request,
) -> Response {
	let config = app.stores.snapshot();
	let path = req.uri().path().to_string();

	match route(&config, &path) {
		Route::Health => plain(StatusCode::OK, "ok"),
		Route::Explain(endpoint) => explain(&config, endpoint.as_deref()),
		Route::Auth(endpoint) => {
			if req.method() != Method::GET && req.method() != Method::POST {
				return plain(StatusCode::METHOD_NOT_ALLOWED, "");
			}
			evaluate(&app, &config, endpoint, peer, req).await
		},
		Route::SelectorRequired => plain(
			StatusCode::BAD_REQUEST,
			"an endpoint selector is required\n",
		),
		Route::NotFound => plain(StatusCode::NOT_FOUND, ""),
	}
}

enum Route {
	Health,
	Explain(Option<String>),
	Auth(Arc<Endpoint>),
	SelectorRequired,
	NotFound,
}

fn route(config: &CompiledConfig, path: &str) -> Route {
	match path {
		"/health" => return Route::Health,
		"/explain" => return Route::Explain(None),
		"/auth" => {
			return match config.endpoints.len() {
				0 => Route::NotFound,
				1 => Route::Auth(config.endpoints[0].clone()),
				_ => Route::SelectorRequired,
			};
		},
		_ => {},
	}
	let Some((endpoint, rest)) = config.endpoint_for_path(path) else {
		return Route::NotFound;
	};
	match rest.as_str() {
		"/auth" => Route::Auth(endpoint.clone()),
		"/health" | "/healthz" => Route::Health,
		"/explain" => Route::Explain(Some(endpoint.name.clone())),
		_ => Route::NotFound,
	}
}

async fn evaluate(
	app: &AppState,
	config: &Arc<CompiledConfig>,
	endpoint: Arc<Endpoint>,
	peer: SocketAddr,
	req: Request,
) -> Response {
	let correlation_id = req
		.headers()
		.get(&config.server.correlation_header)
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty())
		.map(|v| v.to_string())
		.unwrap_or_else(|| format!("{:032x}", rand::random::<u128>()));

	let snapshot = RequestSnapshot {
		method: req.method().to_string(),
		path: req.uri().path().to_string(),
		host: req
			.headers()
			.get("host")
			.and_then(|v| v.to_str().ok())
			.map(|v| v.to_string())
			.or_else(|| req.uri().host().map(|h| h.to_string()))
			.unwrap_or_default(),
		headers: crate::http::normalize_headers(req.headers()),
		query: crate::http::normalize_query(req.uri()),
		remote_addr: peer.to_string(),
	};

	let pipeline = Pipeline::new(config.clone(), app.cache.clone(), app.client.clone());
	let state = pipeline.evaluate(endpoint, snapshot, correlation_id).await;

	write_response(state.response.status, &state.response.headers, state.response.message)
}

fn write_response(status: u16, headers: &BTreeMap<String, String>, body: String) -> Response {
	let mut builder = ::http::Response::builder()
		.status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
	if let Some(hm) = builder.headers_mut() {
		for (name, value) in headers {
			let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
				warn!(header = %name, "dropping invalid response header name");
				continue;
			};
			let Ok(value) = HeaderValue::from_str(value) else {
				warn!(header = %name, "dropping invalid response header value");
				continue;
			};
			hm.insert(name, value);
		}
	}
	builder
		.body(Body::from(body))
		.unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExplainResponse {
	status: String,
	endpoint: Option<String>,
	using_fallback: bool,
	rule_sources: Vec<String>,
	skipped_definitions: Vec<String>,
	available_endpoints: Vec<String>,
}

fn explain(config: &CompiledConfig, endpoint: Option<&str>) -> Response {
	let available: Vec<String> = config.endpoints.iter().map(|e| e.name.clone()).collect();
	let selected = match endpoint {
		Some(name) => match config.endpoint(name) {
			Some(ep) => Some(ep),
			None => return plain(StatusCode::NOT_FOUND, ""),
		},
		None if config.endpoints.len() == 1 => Some(&config.endpoints[0]),
		None => None,
	};
	let body = ExplainResponse {
		status: "ok".to_string(),
		endpoint: selected.map(|e| e.name.clone()),
		using_fallback: endpoint.is_none() && selected.is_some(),
		rule_sources: selected.map(|e| e.rule_sources.clone()).unwrap_or_default(),
		skipped_definitions: selected
			.map(|e| e.skipped_definitions.clone())
			.unwrap_or_default(),
		available_endpoints: available,
	};
	let body = serde_json::to_string(&body).unwrap_or_else(|_| json!({"status": "error"}).to_string());
	::http::Response::builder()
		.status(StatusCode::OK)
		.header("content-type", "application/json")
		.body(Body::from(body))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn plain(status: StatusCode, body: &str) -> Response {
	::http::Response::builder()
		.status(status)
		.body(Body::from(body.to_string()))
		.unwrap_or_else(|_| status.into_response())
}

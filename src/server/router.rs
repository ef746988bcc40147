//! Request routing for the HTTPS endpoint
//!
//! - `GET /api/health` - Static cluster health document (JSON)
//! - anything else - `Welcome to <name>` greeting, no content type
//!
//! Routing is a pure lookup over an ordered route table. The table is
//! built once at startup and shared read-only by every connection.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

/// Path of the structured health endpoint
pub const HEALTH_PATH: &str = "/api/health";

/// Cluster colour reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Green,
    Yellow,
    Red,
}

/// Health document served on [`HEALTH_PATH`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: ClusterStatus,
    pub number_of_nodes: u32,
}

/// The fixture always reports a green three-node cluster
pub const FIXTURE_HEALTH: HealthStatus = HealthStatus {
    status: ClusterStatus::Green,
    number_of_nodes: 3,
};

/// A routed response; the status is always 200 OK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureResponse {
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl IntoResponse for FixtureResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::OK;
        if let Some(content_type) = self.content_type {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        response
    }
}

/// Which request paths a route applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    Exact(&'static str),
    Prefix(&'static str),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => path == *expected,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix),
        }
    }
}

/// Data the response builders draw from
#[derive(Debug, Clone)]
pub struct RouteContext {
    health_body: String,
    greeting: String,
}

/// Builds the response for a matched route
pub type ResponseBuilder = fn(&RouteContext) -> FixtureResponse;

struct Route {
    method: Method,
    matcher: PathMatcher,
    build: ResponseBuilder,
}

fn health_response(ctx: &RouteContext) -> FixtureResponse {
    FixtureResponse {
        content_type: Some("application/json"),
        body: ctx.health_body.clone(),
    }
}

fn greeting_response(ctx: &RouteContext) -> FixtureResponse {
    FixtureResponse {
        content_type: None,
        body: ctx.greeting.clone(),
    }
}

/// Ordered route table with a fallback
///
/// The first route whose method and matcher accept the request wins.
/// Unmatched requests, including non-GET methods, get the fallback.
pub struct RouteTable {
    context: RouteContext,
    routes: Vec<Route>,
    fallback: ResponseBuilder,
}

impl RouteTable {
    /// The fixture's routes: health JSON plus the greeting fallback
    pub fn new(app_name: &str, health: HealthStatus) -> Result<Self, serde_json::Error> {
        let context = RouteContext {
            health_body: serde_json::to_string(&health)?,
            greeting: format!("Welcome to {}", app_name),
        };

        Ok(Self {
            context,
            routes: Vec::new(),
            fallback: greeting_response,
        }
        .with_route(Method::GET, PathMatcher::Exact(HEALTH_PATH), health_response))
    }

    /// Append a route after the existing ones
    pub fn with_route(
        mut self,
        method: Method,
        matcher: PathMatcher,
        build: ResponseBuilder,
    ) -> Self {
        self.routes.push(Route {
            method,
            matcher,
            build,
        });
        self
    }

    /// Compute the response for a request
    pub fn route(&self, method: &Method, path: &str) -> FixtureResponse {
        let build = self
            .routes
            .iter()
            .find(|route| route.method == *method && route.matcher.matches(path))
            .map(|route| route.build)
            .unwrap_or(self.fallback);

        build(&self.context)
    }
}

/// Fallback handler: every request goes through the route table
async fn dispatch(State(table): State<Arc<RouteTable>>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    info!(
        method = %request.method(),
        path = request.uri().path(),
        peer = ?peer,
        "HTTP request"
    );

    table
        .route(request.method(), request.uri().path())
        .into_response()
}

/// Build the axum router for the HTTPS endpoint
///
/// `request_timeout` bounds each request when set; expired requests are
/// answered with 408.
pub fn build_router(table: Arc<RouteTable>, request_timeout: Option<Duration>) -> Router {
    let router = Router::new().fallback(dispatch).with_state(table);

    match request_timeout {
        Some(timeout) => router.layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        )),
        None => router,
    }
}

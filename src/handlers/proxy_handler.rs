use std::{convert::Infallible, fmt::Display, net::SocketAddr, sync::Arc, time::Instant};

use http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    controllers::route_controller::{resolve, EntryPointContext, IncomingRequest, RouteDecision},
    handlers::dashboard_handler::dashboard_response,
    models::route_rule::{RouteTable, ServiceTarget},
    utils::response_utils::{return_401, return_404, return_500, return_502, return_redirect, ProxyResponse},
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REQUEST_ID: &str = "x-request-id";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared by every listener. The route table is swapped whole when providers refresh.
pub struct ProxyState {
    pub routes: RwLock<Arc<RouteTable>>,
    pub client: reqwest::Client,
    pub access_log: bool,
}

impl ProxyState {
    pub fn new(routes: RouteTable, access_log: bool) -> Result<ProxyState, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(ProxyState {
            routes: RwLock::new(Arc::new(routes)),
            client,
            access_log,
        })
    }

    pub async fn replace_routes(&self, routes: RouteTable) {
        let mut current = self.routes.write().await;
        *current = Arc::new(routes);
    }

    pub async fn current_routes(&self) -> Arc<RouteTable> {
        self.routes.read().await.clone()
    }
}

fn request_host<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    //headers named by Connection are hop-by-hop as well
    let named = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<HeaderName>>();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Entry point of every proxied request, never fails at the hyper level.
pub async fn handle_request<B>(
    state: Arc<ProxyState>,
    entrypoint: Arc<EntryPointContext>,
    remote: SocketAddr,
    request: Request<B>,
) -> Result<ProxyResponse, Infallible>
where
    B: Body,
    B::Error: Display,
{
    let started = Instant::now();
    let method = request.method().clone();
    let host = request_host(&request);
    let path = request.uri().path().to_string();
    let routes = state.current_routes().await;

    let (response, router) = if entrypoint.dashboard_only {
        (dashboard_response(&routes, &path), Some("dashboard".to_string()))
    } else {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let decision = resolve(
            &routes,
            &entrypoint,
            &IncomingRequest {
                host: &host,
                path: &path,
                path_and_query: &path_and_query,
                headers: request.headers(),
            },
        );
        match decision {
            RouteDecision::Redirect(location) => (return_redirect(&location), None),
            RouteDecision::NotFound => (return_404(), None),
            RouteDecision::Challenge => (return_401(), None),
            RouteDecision::Misconfigured(reason) => {
                tracing::error!("{}", reason);
                (return_500(reason), None)
            }
            RouteDecision::Forward(route) => {
                let router = Some(route.name.clone());
                match &route.service {
                    ServiceTarget::Dashboard => (dashboard_response(&routes, &path), router),
                    ServiceTarget::Upstream { address, .. } => (
                        forward(&state.client, address, &entrypoint, &host, remote, request).await,
                        router,
                    ),
                }
            }
        }
    };

    if state.access_log {
        tracing::info!(
            target: "access",
            remote = %remote,
            entrypoint = %entrypoint.name,
            method = %method,
            host = %host,
            path = %path,
            status = response.status().as_u16(),
            router = router.as_deref().unwrap_or("-"),
            duration_ms = started.elapsed().as_millis() as u64,
            "request"
        );
    }
    Ok(response)
}

/// Replays the request against `address` and copies the upstream answer back.
pub async fn forward<B>(
    client: &reqwest::Client,
    address: &str,
    entrypoint: &EntryPointContext,
    host: &str,
    remote: SocketAddr,
    request: Request<B>,
) -> ProxyResponse
where
    B: Body,
    B::Error: Display,
{
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://{address}{path_and_query}");

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", remote.ip()),
        None => remote.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if entrypoint.secure { "https" } else { "http" }),
    );
    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return return_502(format!("failed to read request body: {err}")),
    };

    let upstream = client
        .request(parts.method, url.as_str())
        .headers(headers)
        .body(body)
        .send()
        .await;
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::warn!("upstream {} failed: {}", url, err);
            return return_502("502 Bad Gateway".to_string());
        }
    };

    let status = upstream.status();
    let mut upstream_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut upstream_headers);
    // the body is re-framed by hyper
    upstream_headers.remove(header::CONTENT_LENGTH);
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!("upstream {} body failed: {}", url, err);
            return return_502("502 Bad Gateway".to_string());
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    *response.headers_mut() = upstream_headers;
    response
}

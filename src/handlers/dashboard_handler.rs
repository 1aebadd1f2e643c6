use http_body_util::Full;
use hyper::body::Bytes;
use serde::Serialize;

use crate::{
    models::route_rule::{RouteTable, ServiceTarget},
    utils::response_utils::{return_404, return_500, return_json, ProxyResponse},
};

#[derive(Serialize)]
struct Overview {
    routers: usize,
    middlewares: usize,
    tls_routers: usize,
    providers: Vec<String>,
}

fn overview(routes: &RouteTable) -> Overview {
    let mut providers = routes
        .routes
        .iter()
        .map(|route| route.provider.clone())
        .collect::<Vec<String>>();
    providers.sort();
    providers.dedup();
    Overview {
        routers: routes.routes.len(),
        middlewares: routes.middlewares.len(),
        tls_routers: routes.routes.iter().filter(|route| route.tls).count(),
        providers,
    }
}

/// Plain listing of routers, one per line.
fn router_lines(routes: &RouteTable) -> String {
    let mut body = String::new();
    for route in &routes.routes {
        let target = match &route.service {
            ServiceTarget::Upstream { name, address } => format!("{name} ({address})"),
            ServiceTarget::Dashboard => "api@internal".to_string(),
        };
        body.push_str(&format!(
            "{}@{}\t{}\t{}{}\n",
            route.name,
            route.provider,
            route.rule,
            target,
            if route.tls { "\ttls" } else { "" }
        ));
    }
    body
}

/// `/api/rawdata`, `/api/overview` and `/dashboard/`, anything else is a 404.
pub fn dashboard_response(routes: &RouteTable, path: &str) -> ProxyResponse {
    let serialized = match path {
        "/api/rawdata" => serde_json::to_string_pretty(routes),
        "/api/overview" => serde_json::to_string_pretty(&overview(routes)),
        "/" | "/dashboard" | "/dashboard/" => {
            let mut response = ProxyResponse::new(Full::new(Bytes::from(router_lines(routes))));
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            return response;
        }
        _ => return return_404(),
    };
    match serialized {
        Ok(body) => return_json(body),
        Err(err) => return_500(err.to_string()),
    }
}

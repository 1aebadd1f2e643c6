use http::{header, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;

pub type ProxyResponse = Response<Full<Bytes>>;

pub const AUTH_REALM: &str = "stack_gate";

fn empty(status: StatusCode) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text(status: StatusCode, message: String) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn return_404() -> ProxyResponse {
    text(StatusCode::NOT_FOUND, "404 page not found".to_string())
}

pub fn return_401() -> ProxyResponse {
    let mut response = text(StatusCode::UNAUTHORIZED, "401 Unauthorized".to_string());
    if let Ok(value) = header::HeaderValue::from_str(&format!("Basic realm=\"{AUTH_REALM}\"")) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

pub fn return_redirect(location: &str) -> ProxyResponse {
    let mut response = empty(StatusCode::PERMANENT_REDIRECT);
    match header::HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => text(StatusCode::BAD_REQUEST, "invalid redirect target".to_string()),
    }
}

pub fn return_500(message: String) -> ProxyResponse {
    text(StatusCode::INTERNAL_SERVER_ERROR, message)
}

pub fn return_502(message: String) -> ProxyResponse {
    text(StatusCode::BAD_GATEWAY, message)
}

pub fn return_json(body: String) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

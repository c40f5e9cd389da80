use super::{ForwardContext, ForwardError};
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Uri};
use url::Url;

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Host the request is bound for: the Host header, then the request-target
/// authority, then the tunnel's CONNECT authority.
pub fn request_host<B>(req: &Request<B>, ctx: &ForwardContext) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .or_else(|| ctx.authority.clone())
}

/// Absolute upstream URL with the context's scheme and the request's host.
pub fn absolute_url<B>(req: &Request<B>, ctx: &ForwardContext) -> Result<Url, ForwardError> {
    let host = request_host(req, ctx).ok_or(ForwardError::MissingHost)?;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let raw = format!("{}://{}{}", ctx.scheme.as_str(), host, path);
    Url::parse(&raw).map_err(|e| ForwardError::InvalidUrl(format!("{raw}: {e}")))
}

/// Origin-form target used on a connection that is already bound to its host.
pub fn origin_form(uri: &Uri) -> Result<Uri, ForwardError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    path.parse()
        .map_err(|e| ForwardError::InvalidUrl(format!("{path}: {e}")))
}

pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::Scheme;
    use http::HeaderValue;

    fn ctx() -> ForwardContext {
        ForwardContext::plain("127.0.0.1:9999".parse().unwrap())
    }

    #[test]
    fn test_absolute_url_prefers_host_header() {
        let req = Request::get("http://ignored.test/path?q=1")
            .header("host", "example.org:8080")
            .body(())
            .unwrap();
        let url = absolute_url(&req, &ctx()).unwrap();
        assert_eq!(url.as_str(), "http://example.org:8080/path?q=1");
    }

    #[test]
    fn test_absolute_url_falls_back_to_target_then_context() {
        let req = Request::get("http://example.org/x").body(()).unwrap();
        assert_eq!(
            absolute_url(&req, &ctx()).unwrap().as_str(),
            "http://example.org/x"
        );

        let tunneled = ForwardContext::tunneled("127.0.0.1:1".parse().unwrap(), "secure.test:8443");
        let req = Request::get("/inner").body(()).unwrap();
        let url = absolute_url(&req, &tunneled).unwrap();
        assert_eq!(tunneled.scheme, Scheme::Https);
        assert_eq!(url.as_str(), "https://secure.test:8443/inner");
    }

    #[test]
    fn test_missing_host() {
        let req = Request::get("/nowhere").body(()).unwrap();
        assert!(matches!(
            absolute_url(&req, &ctx()),
            Err(ForwardError::MissingHost)
        ));
    }

    #[test]
    fn test_origin_form() {
        let uri: Uri = "https://example.com/a/b?c=d".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/a/b?c=d");
        let uri: Uri = "example.com:443".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_is_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade(&headers));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade(&headers));
    }
}

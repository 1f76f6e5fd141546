//! Transport-neutral HTTP JSON surface.
//!
//! Modules register handlers against [`ApiSurface`]; the firmware mounts them
//! on the ESP-IDF HTTP server and tests dispatch them through [`RouteTable`].

pub mod error;
pub mod multipart;
mod routes;

pub use embedded_svc::http::Method;
pub use error::{ErrorCode, ErrorResponse};
pub use routes::{unmatched_route, RouteTable};

use anyhow::Result;
use serde_json::Value;
use std::io::{self, Read};
use std::sync::Arc;

/// Headers the HTTP adapter forwards into [`ApiRequest::headers`].
pub const FORWARDED_HEADERS: &[&str] = &["Content-Type", "Content-Length", "X-OTA-Password"];

pub struct ApiRequest<'a> {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: &'a mut dyn Read,
}

impl<'a> ApiRequest<'a> {
    /// Splits `uri` into path and decoded query pairs.
    pub fn new(method: Method, uri: &str, body: &'a mut dyn Read) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (uri, Vec::new()),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
    }

    /// Reads a small body, refusing anything longer than `limit` bytes.
    pub fn read_body(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = (&mut *self.body)
            .take(limit as u64 + 1)
            .read_to_end(&mut buf)?;
        if read > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request body exceeds {limit} bytes"),
            ));
        }
        Ok(buf)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::json(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn to_json_string(&self) -> String {
        self.body.to_string()
    }
}

pub type Handler = Arc<dyn Fn(&mut ApiRequest<'_>) -> ApiResponse + Send + Sync>;

/// Anything routes can be attached to.
pub trait ApiSurface {
    fn route(&mut self, path: &str, method: Method, handler: Handler) -> Result<()>;
}

/// A surface restricted to `/_api/<namespace>/`.
pub struct ApiScope<'s> {
    surface: &'s mut dyn ApiSurface,
    namespace: String,
    registered: usize,
}

impl<'s> ApiScope<'s> {
    pub fn new(surface: &'s mut dyn ApiSurface, namespace: &str) -> Self {
        Self {
            surface,
            namespace: namespace.to_string(),
            registered: 0,
        }
    }

    pub fn prefix(&self) -> String {
        format!("/_api/{}/", self.namespace)
    }

    pub fn on<F>(&mut self, action: &str, method: Method, handler: F) -> Result<()>
    where
        F: Fn(&mut ApiRequest<'_>) -> ApiResponse + Send + Sync + 'static,
    {
        let path = format!("{}{}", self.prefix(), action.trim_start_matches('/'));
        self.surface.route(&path, method, Arc::new(handler))?;
        self.registered += 1;
        Ok(())
    }

    pub fn registered(&self) -> usize {
        self.registered
    }
}

pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(pair), String::new()),
        })
        .collect()
}

/// Decodes a form-encoded query component; malformed escapes pass through.
pub fn url_decode(input: &str) -> String {
    let spaced = input.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_decodes_query() {
        let mut body = io::empty();
        let req = ApiRequest::new(Method::Post, "/_api/ota/update?path=%2Ffw%20v2.bin&x", &mut body);
        assert_eq!(req.path, "/_api/ota/update");
        assert_eq!(req.query("path"), Some("/fw v2.bin"));
        assert_eq!(req.query("x"), Some(""));
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let mut body = io::empty();
        let req = ApiRequest::new(Method::Get, "/", &mut body).with_header("x-ota-password", "s3cret");
        assert_eq!(req.header("X-OTA-Password"), Some("s3cret"));
    }

    #[test]
    fn read_body_enforces_limit() {
        let mut body: &[u8] = b"0123456789";
        let mut req = ApiRequest::new(Method::Post, "/", &mut body);
        assert!(req.read_body(4).is_err());

        let mut body: &[u8] = b"0123";
        let mut req = ApiRequest::new(Method::Post, "/", &mut body);
        assert_eq!(req.read_body(4).unwrap(), b"0123");
    }

    #[test]
    fn url_decode_keeps_malformed_escapes() {
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("a%2Bb"), "a+b");
        assert_eq!(url_decode("%ff%fe"), "\u{fffd}\u{fffd}");
    }
}

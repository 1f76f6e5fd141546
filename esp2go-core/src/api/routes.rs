use anyhow::{bail, Result};
use std::io::Read;

use super::{ApiRequest, ApiResponse, ApiSurface, ErrorCode, ErrorResponse, Handler, Method};

/// Envelope for a request no route accepts: 405 when `path` is mounted
/// under another method, 404 otherwise. Shared with the device server's
/// wildcard fallbacks so both answer in JSON.
pub fn unmatched_route(path: &str, path_known: bool) -> ApiResponse {
    if path_known {
        ErrorResponse::new(ErrorCode::MethodNotAllowed, "Method not allowed").into()
    } else {
        ErrorResponse::not_found(format!("No route for {path}")).into()
    }
}

/// In-process route table.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<(String, Method, Handler)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, path: &str, method: Method) -> bool {
        self.routes.iter().any(|(p, m, _)| p == path && *m == method)
    }

    /// Registered paths starting with `prefix`, in registration order.
    pub fn paths_under(&self, prefix: &str) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|(p, _, _)| p.starts_with(prefix))
            .map(|(p, _, _)| p.as_str())
            .collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, Method, &Handler)> {
        self.routes.iter().map(|(p, m, h)| (p.as_str(), *m, h))
    }

    pub fn dispatch(&self, req: &mut ApiRequest<'_>) -> ApiResponse {
        let mut path_known = false;
        for (path, method, handler) in &self.routes {
            if *path != req.path {
                continue;
            }
            path_known = true;
            if *method == req.method {
                return handler(req);
            }
        }
        unmatched_route(&req.path, path_known)
    }

    /// Convenience for host runs and tests.
    pub fn call(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> ApiResponse {
        let mut reader: &[u8] = body;
        let reader: &mut dyn Read = &mut reader;
        let mut req = ApiRequest::new(method, uri, reader);
        for (name, value) in headers {
            req = req.with_header(name, value);
        }
        self.dispatch(&mut req)
    }
}

impl ApiSurface for RouteTable {
    fn route(&mut self, path: &str, method: Method, handler: Handler) -> Result<()> {
        if self.contains(path, method) {
            bail!("route already registered: {:?} {}", method, path);
        }
        self.routes.push((path.to_string(), method, handler));
        Ok(())
    }
}

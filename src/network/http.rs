use anyhow::Result;
use esp2go_core::api::{
    unmatched_route, ApiRequest, ApiResponse, ApiSurface, Handler, Method, FORWARDED_HEADERS,
};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::io::{Read as EspRead, Write};
use std::io;
use std::sync::Arc;

/// Handler slots; modules register well under this.
const MAX_URI_HANDLERS: usize = 40;

/// Create HTTP server configuration sized for streamed uploads
pub fn create_http_config(port: u16) -> Configuration {
    Configuration {
        http_port: port,
        stack_size: 12288,       // Upload handlers stream through a 4 KB buffer
        max_uri_handlers: MAX_URI_HANDLERS,
        max_open_sockets: 7,     // LWIP allows max 10, HTTP server uses 3 internally
        max_resp_headers: 10,
        lru_purge_enable: true,
        uri_match_wildcard: true, // JSON fallbacks are mounted on "/*"
        ..Default::default()
    }
}

/// Presents the connection body as `std::io::Read` for the core handlers.
struct BodyReader<'r, R> {
    inner: &'r mut R,
}

impl<R: EspRead> io::Read for BodyReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::other(format!("{:?}", e)))
    }
}

fn send_json(req: Request<&mut EspHttpConnection>, response: &ApiResponse) -> Result<()> {
    let body = response.to_json_string();
    let mut out = req.into_response(
        response.status,
        None,
        &[("Content-Type", "application/json"), ("Connection", "close")],
    )?;
    out.write_all(body.as_bytes())?;
    Ok(())
}

/// [`ApiSurface`] mounted on the ESP-IDF HTTP server.
pub struct EspApiServer {
    server: EspHttpServer<'static>,
    /// Exact paths mounted so far, for 405 detection in the fallbacks.
    paths: Vec<String>,
    routes: usize,
}

impl EspApiServer {
    pub fn new(port: u16) -> Result<Self> {
        let server = EspHttpServer::new(&create_http_config(port))?;
        log::info!("HTTP server started on port {}", port);
        Ok(Self {
            server,
            paths: Vec::new(),
            routes: 0,
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes
    }

    /// Mounts `/*` for every method so unmatched requests get the JSON
    /// error envelope instead of the server's plain-text 404/405.
    ///
    /// The server tries handlers in registration order, so this must run
    /// after every module route is mounted.
    pub fn mount_fallbacks(&mut self) -> Result<()> {
        let known: Arc<[String]> = self.paths.clone().into();
        for method in [Method::Get, Method::Post, Method::Put, Method::Delete] {
            if self.routes >= MAX_URI_HANDLERS {
                anyhow::bail!("HTTP handler table full, cannot mount fallback for {:?}", method);
            }
            let known = Arc::clone(&known);
            self.server.fn_handler("/*", method, move |req| {
                let uri = req.uri().to_string();
                let path = uri.split('?').next().unwrap_or_default();
                log::debug!("No route for {:?} {}", method, path);
                send_json(req, &unmatched_route(path, known.iter().any(|p| p == path)))
            })?;
            self.routes += 1;
        }
        Ok(())
    }
}

impl ApiSurface for EspApiServer {
    fn route(&mut self, path: &str, method: Method, handler: Handler) -> Result<()> {
        if self.routes >= MAX_URI_HANDLERS {
            anyhow::bail!("HTTP handler table full, cannot mount {}", path);
        }
        self.server.fn_handler(path, method, move |mut req| {
            let uri = req.uri().to_string();
            let headers: Vec<(String, String)> = FORWARDED_HEADERS
                .iter()
                .filter_map(|name| req.header(name).map(|v| (name.to_string(), v.to_string())))
                .collect();

            let response = {
                let mut body = BodyReader { inner: &mut req };
                let mut api_req = ApiRequest::new(method, &uri, &mut body);
                api_req.headers = headers;
                handler(&mut api_req)
            };
            send_json(req, &response)
        })?;
        self.paths.push(path.to_string());
        self.routes += 1;
        log::debug!("Mounted {:?} {}", method, path);
        Ok(())
    }
}

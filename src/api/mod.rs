//! Minimal JSON control API over HTTP/1.1 (one request per connection).
//!
//! Routes:
//! - `GET /health`
//! - `GET /streams`
//! - `POST /streams/{id}` with `{"stream_url": "...", "rtsp_port": 8554}`
//! - `GET /streams/{id}`, `GET /streams/{id}/stats`, `GET /streams/{id}/frame`
//! - `GET /streams/{id}/video`: MJPEG (`multipart/x-mixed-replace`) until the
//!   client disconnects or the session stops
//! - `DELETE /streams/{id}`

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::registry::{RegistryError, StreamRegistry};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const JPEG_QUALITY: u8 = 80;
const VIDEO_BOUNDARY: &str = "frame";
const VIDEO_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<StreamRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<StreamRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let registry = self.registry;
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, registry, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    registry: Arc<StreamRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                // Frame requests wait on the session, so each connection gets its own thread.
                let registry = Arc::clone(&registry);
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &registry) {
                            log::warn!("control api request failed: {:#}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("control api could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartRequest {
    stream_url: String,
    rtsp_port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    message: String,
    http_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtsp_url: Option<String>,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, value: &impl Serialize) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
        })
    }

    fn error(status: u16, code: &str) -> Result<Self> {
        Self::json(status, &json!({ "error": code }))
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: Vec::new(),
        }
    }
}

fn handle_connection(mut stream: TcpStream, registry: &StreamRegistry) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return write_response(&mut stream, &Response::error(403, "forbidden")?);
    }

    let response = match read_request(&mut stream) {
        Ok(request) => {
            log::debug!("{} {} from {}", request.method, request.path, peer);
            if let Some(id) = video_feed_id(&request) {
                return serve_video(&mut stream, registry, id);
            }
            route(&request, registry)?
        }
        Err(err) => {
            log::debug!("bad request from {}: {:#}", peer, err);
            Response::error(400, "bad_request")?
        }
    };
    write_response(&mut stream, &response)
}

fn route(request: &HttpRequest, registry: &StreamRegistry) -> Result<Response> {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = request.method.as_str();

    match segments.as_slice() {
        ["health"] => match method {
            "GET" => Response::json(200, &json!({ "status": "ok", "streams": registry.len() })),
            _ => Response::error(405, "method_not_allowed"),
        },
        ["streams"] => match method {
            "GET" => Response::json(200, &json!({ "streams": registry.ids() })),
            _ => Response::error(405, "method_not_allowed"),
        },
        ["streams", id, rest @ ..] => {
            if !valid_stream_id(id) {
                return Response::error(400, "invalid_stream_id");
            }
            match (method, rest) {
                ("POST", []) => start_stream(registry, id, &request.body),
                ("GET", []) => match registry.info(id) {
                    Ok(info) => {
                        let mut value = serde_json::to_value(info)?;
                        value["http_url"] = json!(frame_url(id));
                        Response::json(200, &value)
                    }
                    Err(err) => registry_error(err),
                },
                ("DELETE", []) => match registry.stop(id) {
                    Ok(()) => Response::json(
                        200,
                        &json!({ "message": format!("Stream {} stopped successfully", id) }),
                    ),
                    Err(err) => registry_error(err),
                },
                ("GET", ["stats"]) => match registry.stats(id) {
                    Ok(stats) => Response::json(200, &stats),
                    Err(err) => registry_error(err),
                },
                ("GET", ["frame"]) => match registry.latest_frame(id, None) {
                    Ok(Some(frame)) => Ok(Response {
                        status: 200,
                        content_type: "image/jpeg",
                        body: encode_jpeg(frame.image())?,
                    }),
                    Ok(None) => Ok(Response::empty(204)),
                    Err(err) => registry_error(err),
                },
                (_, []) | (_, ["stats"]) | (_, ["frame"]) | (_, ["video"]) => {
                    Response::error(405, "method_not_allowed")
                }
                _ => Response::error(404, "not_found"),
            }
        }
        _ => Response::error(404, "not_found"),
    }
}

/// Stream id of a `GET /streams/{id}/video` request.
fn video_feed_id(request: &HttpRequest) -> Option<&str> {
    if request.method != "GET" {
        return None;
    }
    let mut segments = request.path.trim_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("streams"), Some(id), Some("video"), None) if valid_stream_id(id) => Some(id),
        _ => None,
    }
}

/// Write one JPEG part per annotated frame until the client goes away or the
/// session stops.
fn serve_video(stream: &mut TcpStream, registry: &StreamRegistry, id: &str) -> Result<()> {
    let session = match registry.get(id) {
        Ok(session) => session,
        Err(err) => return write_response(stream, &registry_error(err)?),
    };
    stream.set_write_timeout(Some(VIDEO_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        VIDEO_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;

    let timeout = session.settings().frame_timeout;
    let mut parts = 0u64;
    loop {
        let Some(frame) = session.get_latest_frame(timeout) else {
            if session.is_active() {
                continue;
            }
            let _ = write!(stream, "--{}--\r\n", VIDEO_BOUNDARY);
            log::debug!("video feed {}: session stopped after {} parts", id, parts);
            return Ok(());
        };
        let jpeg = encode_jpeg(frame.image())?;
        if let Err(err) = write_video_part(stream, &jpeg) {
            log::debug!("video feed {}: client left after {} parts ({})", id, parts, err);
            return Ok(());
        }
        parts += 1;
    }
}

fn write_video_part(stream: &mut TcpStream, jpeg: &[u8]) -> std::io::Result<()> {
    write!(
        stream,
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        VIDEO_BOUNDARY,
        jpeg.len()
    )?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()
}

fn start_stream(registry: &StreamRegistry, id: &str, body: &[u8]) -> Result<Response> {
    let request: StartRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return Response::json(400, &json!({ "error": "invalid_body", "detail": err.to_string() }))
        }
    };
    if request.stream_url.trim().is_empty() {
        return Response::error(400, "invalid_body");
    }
    match registry.start(id, &request.stream_url, request.rtsp_port) {
        Ok(session) => Response::json(
            200,
            &StartResponse {
                message: format!("Stream {} started successfully", id),
                http_url: frame_url(id),
                rtsp_url: session.relay_url(),
            },
        ),
        Err(err) => registry_error(err),
    }
}

fn registry_error(err: RegistryError) -> Result<Response> {
    match err {
        RegistryError::DuplicateSession(_) => Response::error(409, "stream_exists"),
        RegistryError::SessionNotFound(_) => Response::error(404, "stream_not_found"),
        RegistryError::Start(err) => Response::json(
            500,
            &json!({ "error": "start_failed", "detail": format!("{:#}", err) }),
        ),
    }
}

fn frame_url(id: &str) -> String {
    format!("/streams/{}/frame", id)
}

fn valid_stream_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// JPEG snapshot of a BGR frame.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut rgb = frame.as_bytes().to_vec();
    for px in rgb.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(&rgb, frame.width(), frame.height(), ExtendedColorType::Rgb8)
        .context("encode jpeg snapshot")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn content_length(&self) -> Result<usize> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid content-length '{}'", value)),
            None => Ok(0),
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    let mut request = HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body: data[header_end + 4..].to_vec(),
    };

    let length = request.content_length()?;
    if length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    while request.body.len() < length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        request.body.extend_from_slice(&buf[..n]);
    }
    request.body.truncate(length);
    Ok(request)
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_restricted() {
        assert!(valid_stream_id("gate-1.north_cam"));
        assert!(!valid_stream_id(""));
        assert!(!valid_stream_id("a b"));
        assert!(!valid_stream_id("../etc"));
    }

    #[test]
    fn jpeg_snapshot_has_soi_marker() {
        let frame = Frame::filled(32, 16, [0, 0, 255]).unwrap();
        let jpeg = encode_jpeg(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn only_get_video_paths_stream() {
        let request = |method: &str, path: &str| HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        assert_eq!(video_feed_id(&request("GET", "/streams/cam1/video")), Some("cam1"));
        assert_eq!(video_feed_id(&request("POST", "/streams/cam1/video")), None);
        assert_eq!(video_feed_id(&request("GET", "/streams/cam1/video/x")), None);
        assert_eq!(video_feed_id(&request("GET", "/streams/a%20b/video")), None);
    }
}

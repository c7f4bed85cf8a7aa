// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Local control API: a small HTTP/1.1 JSON server over raw TCP.
//
// Other processes (a second `lesewerk` invocation, scripts) submit missions,
// poll status and steer running missions through it.  HTTP framing is parsed
// just far enough to get the request line, headers and a `Content-Length`
// body; every response closes the connection.
//
// # Routes
//
//   GET    /api/health                   liveness + version
//   POST   /api/missions                 submit a mission
//   GET    /api/missions                 list mission statuses
//   GET    /api/missions/{id}            one mission's status
//   POST   /api/missions/{id}/pause      pause
//   POST   /api/missions/{id}/resume     resume
//   POST   /api/missions/{id}/terminate  force-terminate
//   DELETE /api/missions/{id}            clear a terminal mission
//   GET    /api/engine                   active binding + available backends
//   PUT    /api/engine                   swap the binding `{ "id": "..." }`
//
// # Binding
//
// Loopback only unless `allow_lan` is set, in which case the server binds
// every interface and firewalling is the operator's job.  When the port is
// taken the next ones are tried and the effective port is reported.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::human_errors::humanize_error;
use lesewerk_core::{AppConfig, MissionId};

use crate::registry::MissionRegistry;
use crate::submission::MissionRequest;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How many ports after the configured one are tried on collision.
const PORT_SEARCH_LIMIT: u16 = 100;

/// Largest accepted request body.  Buffers travel inline as JSON.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Largest accepted header block.
const MAX_HEADER_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Minimal HTTP request parser
// ---------------------------------------------------------------------------

/// Request line and framing of one HTTP request.
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    content_length: usize,
    /// Offset of the body in the buffer the head was parsed from.
    body_offset: usize,
}

/// Parse the request line and headers once the blank line has arrived.
///
/// Returns `Ok(None)` while the header block is still incomplete.
fn parse_request_head(data: &[u8]) -> std::result::Result<Option<RequestHead>, String> {
    let Some(header_end) = find_subsequence(data, b"\r\n\r\n") else {
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = head.lines();

    let request_line = lines.next().ok_or("empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or("missing method")?.to_ascii_uppercase();
    let target = parts.next().ok_or("missing request target")?;
    let path = target.split('?').next().unwrap_or(target).to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<usize>())
        .transpose()
        .map_err(|e| format!("bad Content-Length: {e}"))?
        .unwrap_or(0);

    Ok(Some(RequestHead {
        method,
        path,
        content_length,
        body_offset: header_end + 4,
    }))
}

/// Find the first occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// ControlServer
// ---------------------------------------------------------------------------

/// The control API listener.
pub struct ControlServer {
    /// Port asked for; the effective port may be higher.
    port: u16,
    allow_lan: bool,
    effective_port: Option<u16>,
    shutdown_signal: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicU32>,
}

impl ControlServer {
    pub fn new(port: u16, allow_lan: bool) -> Self {
        Self {
            port,
            allow_lan,
            effective_port: None,
            shutdown_signal: Arc::new(Notify::new()),
            task_handle: None,
            active_connections: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.control_port, config.allow_lan)
    }

    /// Port actually bound, once started.
    pub fn effective_port(&self) -> Option<u16> {
        self.effective_port
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind and start accepting.  Returns the effective port.
    ///
    /// Port `0` lets the OS pick.  Otherwise, if the configured port is in
    /// use, up to [`PORT_SEARCH_LIMIT`] following ports are tried.
    pub async fn start(&mut self, registry: Arc<MissionRegistry>) -> Result<u16> {
        if let Some(port) = self.effective_port.filter(|_| self.is_running()) {
            debug!(port, "control API already running");
            return Ok(port);
        }

        let listener = self.bind().await?;
        let port = listener
            .local_addr()
            .map_err(|e| LesewerkError::ControlApi(format!("local address: {e}")))?
            .port();
        if port != self.port && self.port != 0 {
            warn!(requested = self.port, port, "control port taken, using the next free one");
        }
        info!(port, allow_lan = self.allow_lan, "Control API listening");

        let shutdown = Arc::clone(&self.shutdown_signal);
        let connections = Arc::clone(&self.active_connections);
        let handle = tokio::spawn(async move {
            Self::accept_loop(listener, shutdown, connections, registry).await;
        });

        self.task_handle = Some(handle);
        self.effective_port = Some(port);
        Ok(port)
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.task_handle.take() else {
            return Ok(());
        };
        self.shutdown_signal.notify_one();
        handle
            .await
            .map_err(|e| LesewerkError::ControlApi(format!("task join: {e}")))?;
        info!(port = ?self.effective_port, "Control API stopped");
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener> {
        let ip: IpAddr = if self.allow_lan {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv4Addr::LOCALHOST.into()
        };
        if self.port == 0 {
            return TcpListener::bind(SocketAddr::new(ip, 0))
                .await
                .map_err(|e| LesewerkError::ControlApi(format!("bind {ip}:0: {e}")));
        }

        let last = self.port.saturating_add(PORT_SEARCH_LIMIT);
        for port in self.port..=last {
            let addr = SocketAddr::new(ip, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!(port, "port in use");
                }
                Err(e) => return Err(LesewerkError::ControlApi(format!("bind {addr}: {e}"))),
            }
        }
        Err(LesewerkError::PortUnavailable(self.port))
    }

    async fn accept_loop(
        listener: TcpListener,
        shutdown: Arc<Notify>,
        connections: Arc<AtomicU32>,
        registry: Arc<MissionRegistry>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "incoming control connection");
                            let registry = Arc::clone(&registry);
                            let connections = Arc::clone(&connections);
                            tokio::spawn(async move {
                                connections.fetch_add(1, Ordering::Relaxed);
                                if let Err(e) = handle_connection(stream, peer, registry).await {
                                    warn!(%peer, error = %e, "connection handler error");
                                }
                                connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

#[instrument(skip(stream, registry))]
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<MissionRegistry>,
) -> Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];

    let head = loop {
        match parse_request_head(&buf) {
            Ok(Some(head)) => break head,
            Ok(None) if buf.len() > MAX_HEADER_BYTES => {
                return send_response(&mut stream, 431, &error_body("bad_request", "headers too large")).await;
            }
            Ok(None) => {}
            Err(e) => return send_response(&mut stream, 400, &error_body("bad_request", &e)).await,
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| LesewerkError::ControlApi(format!("read from {peer}: {e}")))?;
        if n == 0 {
            debug!("connection closed before a full request");
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if head.content_length > MAX_BODY_BYTES {
        return send_response(&mut stream, 413, &error_body("bad_request", "request body too large")).await;
    }
    let body_end = head.body_offset + head.content_length;
    while buf.len() < body_end {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| LesewerkError::ControlApi(format!("read body from {peer}: {e}")))?;
        if n == 0 {
            return send_response(&mut stream, 400, &error_body("bad_request", "truncated body")).await;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    buf.truncate(body_end);
    let body = buf.split_off(head.body_offset);
    debug!(method = %head.method, path = %head.path, bytes = body.len(), "control request");
    let (status, payload) = respond(registry, head.method, head.path, body).await;
    send_response(&mut stream, status, &payload).await
}

/// Run `dispatch` on the blocking pool.  Submissions walk the filesystem and
/// registry calls take std locks.
async fn respond(
    registry: Arc<MissionRegistry>,
    method: String,
    path: String,
    body: Vec<u8>,
) -> (u16, Value) {
    tokio::task::spawn_blocking(move || dispatch(&registry, &method, &path, &body))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "control request handler failed");
            (500, error_body("internal", "request handler failed"))
        })
}

/// Route one request.  Returns the HTTP status and JSON body.
fn dispatch(registry: &MissionRegistry, method: &str, path: &str, body: &[u8]) -> (u16, Value) {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let outcome = match (method, segments.as_slice()) {
        ("GET", ["api", "health"]) => Ok((200, health(registry))),
        ("POST", ["api", "missions"]) => parse_body::<MissionRequest>(body)
            .and_then(|request| registry.submit(request))
            .map(|id| (201, json!({ "id": id }))),
        ("GET", ["api", "missions"]) => to_value(registry.list()).map(|v| (200, v)),
        ("GET", ["api", "missions", id]) => {
            parse_id(id).and_then(|id| registry.status(id)).and_then(ok_json)
        }
        ("DELETE", ["api", "missions", id]) => parse_id(id)
            .and_then(|id| registry.clear(id))
            .map(|()| (200, json!({ "cleared": true }))),
        ("POST", ["api", "missions", id, action]) => parse_id(id).and_then(|id| match *action {
            "pause" => registry.pause(id).and_then(ok_json),
            "resume" => registry.resume(id).and_then(ok_json),
            "terminate" => registry.terminate(id).and_then(ok_json),
            _ => Ok(not_found(path)),
        }),
        ("GET", ["api", "engine"]) => to_value(registry.engine()).map(|v| (200, v)),
        ("PUT", ["api", "engine"]) => parse_body::<EngineSelection>(body)
            .and_then(|selection| registry.apply_engine(&selection.id))
            .and_then(ok_json),
        _ => Ok(not_found(path)),
    };

    match outcome {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "control request failed");
            (status_for(&e), error_json(&e))
        }
    }
}

#[derive(Debug, Deserialize)]
struct EngineSelection {
    id: String,
}

fn health(registry: &MissionRegistry) -> Value {
    json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "missions": registry.list().len(),
        "interruptible": registry.any_interruptible(),
        "engine": registry.engine().active.map(|d| d.id),
    })
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

fn parse_id(raw: &str) -> Result<MissionId> {
    raw.parse()
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn ok_json<T: serde::Serialize>(value: T) -> Result<(u16, Value)> {
    to_value(value).map(|v| (200, v))
}

fn not_found(path: &str) -> (u16, Value) {
    (404, error_body("not_found", &format!("no route for {path}")))
}

/// HTTP status for an operation error.
fn status_for(err: &LesewerkError) -> u16 {
    match err {
        LesewerkError::MissionNotFound(_) => 404,
        LesewerkError::InvalidSubmission(_)
        | LesewerkError::InvalidPageRange(_)
        | LesewerkError::UnknownEngine(_)
        | LesewerkError::Serialization(_) => 400,
        LesewerkError::EngineBusy { .. }
        | LesewerkError::InvalidTransition { .. }
        | LesewerkError::ConfigFrozen
        | LesewerkError::MissionClosed(_) => 409,
        _ => 500,
    }
}

/// Stable machine-readable error code.
fn error_code(err: &LesewerkError) -> &'static str {
    match err {
        LesewerkError::EngineBusy { .. } => "engine_busy",
        LesewerkError::UnknownEngine(_) => "unknown_engine",
        LesewerkError::BackendInit(_) => "backend_init",
        LesewerkError::MissionNotFound(_) => "mission_not_found",
        LesewerkError::InvalidTransition { .. } => "invalid_transition",
        LesewerkError::ConfigFrozen => "config_frozen",
        LesewerkError::MissionClosed(_) => "mission_closed",
        LesewerkError::InvalidSubmission(_) => "invalid_submission",
        LesewerkError::InvalidPageRange(_) => "invalid_page_range",
        LesewerkError::QueueInvariant(_) => "queue_invariant",
        LesewerkError::Output(_) | LesewerkError::PdfError(_) | LesewerkError::ImageError(_) => {
            "output"
        }
        LesewerkError::PortUnavailable(_) => "port_unavailable",
        LesewerkError::ControlApi(_) => "control_api",
        LesewerkError::ConfigPersistFailure(_) => "config_persist",
        LesewerkError::Io(_) => "io",
        LesewerkError::Serialization(_) => "bad_request",
    }
}

fn error_json(err: &LesewerkError) -> Value {
    let human = humanize_error(err);
    json!({
        "error": error_code(err),
        "message": human.message,
        "suggestion": human.suggestion,
        "retriable": human.retriable,
        "detail": err.to_string(),
    })
}

fn error_body(code: &str, message: &str) -> Value {
    json!({
        "error": code,
        "message": message,
        "suggestion": "Check the request against the control API routes.",
        "retriable": false,
    })
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        _ => "Internal Server Error",
    }
}

/// Send a JSON body wrapped in a minimal HTTP/1.1 response.
async fn send_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let body = serde_json::to_vec(body)?;
    let head = format!(
        "HTTP/1.1 {status} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        reason_phrase(status),
        body.len()
    );

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| LesewerkError::ControlApi(format!("write HTTP headers: {e}")))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| LesewerkError::ControlApi(format!("write body: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| LesewerkError::ControlApi(format!("flush: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCatalog, EngineSlot};
    use crate::test_support::{ScriptedBackend, eventually};
    use lesewerk_core::MissionState;

    fn registry(dir: &std::path::Path) -> Arc<MissionRegistry> {
        let mut catalog = EngineCatalog::new();
        catalog.register_instance(ScriptedBackend::named("scripted"));
        catalog.register_instance(ScriptedBackend::named("other"));
        let slot = EngineSlot::new(catalog, 2);
        slot.apply("scripted").unwrap();

        let mut config = AppConfig::default();
        config.mission_defaults.output_dir = Some(dir.to_path_buf());
        Arc::new(MissionRegistry::new(Arc::new(slot), &config, dir.to_path_buf()))
    }

    #[test]
    fn parse_head_waits_for_blank_line() {
        assert_eq!(parse_request_head(b"GET /api/health HTTP/1.1\r\nHost: x\r\n"), Ok(None));
    }

    #[test]
    fn parse_head_reads_method_path_and_length() {
        let raw = b"post /api/missions?x=1 HTTP/1.1\r\nContent-Length: 12\r\n\r\n{\"items\":[]}";
        let head = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/api/missions");
        assert_eq!(head.content_length, 12);
        assert_eq!(&raw[head.body_offset..], b"{\"items\":[]}");
    }

    #[test]
    fn parse_head_rejects_bad_length() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nContent-Length: lots\r\n\r\n").is_err());
    }

    #[test]
    fn find_subsequence_crlf() {
        assert_eq!(find_subsequence(b"ab\r\n\r\ncd", b"\r\n\r\n"), Some(2));
        assert_eq!(find_subsequence(b"abc", b"\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn dispatch_health_reports_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = dispatch(&registry(dir.path()), "GET", "/api/health", b"");
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["engine"], "scripted");
        assert_eq!(body["interruptible"], false);
    }

    #[tokio::test]
    async fn dispatch_submit_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let submit = br#"{"items":[{"type":"image","path":"/in/a.png"}]}"#;
        let (status, body) = dispatch(&reg, "POST", "/api/missions", submit);
        assert_eq!(status, 201);
        let id = body["id"].as_str().unwrap().to_string();

        let path = format!("/api/missions/{id}");
        assert!(eventually(|| dispatch(&reg, "GET", &path, b"").1["state"] == "Completed").await);
        let (_, status_body) = dispatch(&reg, "GET", &path, b"");
        assert_eq!(status_body["counts"]["done"], 1);

        let (status, _) = dispatch(&reg, "DELETE", &path, b"");
        assert_eq!(status, 200);
        let (status, body) = dispatch(&reg, "GET", &path, b"");
        assert_eq!(status, 404);
        assert_eq!(body["error"], "mission_not_found");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn directory_submission_is_routed_on_the_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let scans = dir.path().join("scans");
        std::fs::create_dir(&scans).unwrap();
        for name in ["a.png", "b.png", "notes.txt", "skip.bin"] {
            std::fs::write(scans.join(name), b"").unwrap();
        }
        let reg = registry(&dir.path().join("out"));

        let submit = json!({ "items": [{ "type": "directory", "path": scans }] });
        let (status, body) = respond(
            Arc::clone(&reg),
            "POST".into(),
            "/api/missions".into(),
            serde_json::to_vec(&submit).unwrap(),
        )
        .await;
        assert_eq!(status, 201, "{body}");
        let id: MissionId = body["id"].as_str().unwrap().parse().unwrap();

        assert!(eventually(|| reg.status(id).is_ok_and(|s| s.state == MissionState::Completed)).await);
        assert_eq!(reg.status(id).unwrap().counts.total, 3);

        let (status, body) = respond(reg, "GET".into(), "/api/nowhere".into(), Vec::new()).await;
        assert_eq!((status, body["error"].as_str()), (404, Some("not_found")));
    }

    #[tokio::test]
    async fn dispatch_maps_errors_to_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        let (status, body) = dispatch(&reg, "POST", "/api/missions", b"not json");
        assert_eq!(status, 400);
        assert_eq!(body["retriable"], false);

        let (status, _) = dispatch(&reg, "GET", "/api/missions/not-a-uuid", b"");
        assert_eq!(status, 400);

        let (status, body) = dispatch(&reg, "PUT", "/api/engine", br#"{"id":"nope"}"#);
        assert_eq!(status, 400);
        assert_eq!(body["error"], "unknown_engine");

        let (status, _) = dispatch(&reg, "GET", "/api/nowhere", b"");
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn dispatch_engine_swap_conflicts_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = EngineCatalog::new();
        let gated = ScriptedBackend::named("scripted").gated();
        catalog.register_instance(gated.clone());
        catalog.register_instance(ScriptedBackend::named("other"));
        let slot = EngineSlot::new(catalog, 2);
        slot.apply("scripted").unwrap();
        let mut config = AppConfig::default();
        config.mission_defaults.output_dir = Some(dir.path().to_path_buf());
        let reg = MissionRegistry::new(Arc::new(slot), &config, dir.path().to_path_buf());

        let submit = br#"{"items":[{"type":"image","path":"/in/a.png"}]}"#;
        let (_, body) = dispatch(&reg, "POST", "/api/missions", submit);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = dispatch(&reg, "PUT", "/api/engine", br#"{"id":"other"}"#);
        assert_eq!(status, 409);
        assert_eq!(body["error"], "engine_busy");

        let (status, body) = dispatch(&reg, "POST", &format!("/api/missions/{id}/terminate"), b"");
        assert_eq!(status, 200);
        assert_eq!(body["state"], "Stopped");

        let (status, body) = dispatch(&reg, "PUT", "/api/engine", br#"{"id":"other"}"#);
        assert_eq!(status, 200);
        assert_eq!(body["id"], "other");
        gated.release(1);
    }

    #[tokio::test]
    async fn server_moves_past_a_taken_port() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let mut server = ControlServer::new(taken, false);
        let port = server.start(registry(dir.path())).await.unwrap();
        assert_ne!(port, taken);
        assert!(port > taken && port <= taken.saturating_add(PORT_SEARCH_LIMIT));
        assert_eq!(server.effective_port(), Some(port));
        server.stop().await.unwrap();
        assert!(!server.is_running());
    }
}

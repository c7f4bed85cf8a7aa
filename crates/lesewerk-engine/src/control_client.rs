// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Client for the control API, used by CLI invocations that talk to an
// already running `lesewerk serve`.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::{EngineDescriptor, MissionId, MissionStatus};

use crate::registry::EngineInfo;
use crate::submission::MissionRequest;

/// Upper bound on one request/response exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: SocketAddr,
    base: String,
    http: Client,
    timeout: Duration,
}

impl ControlClient {
    /// Client for a server on this machine.
    pub fn local(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            base: format!("http://{addr}"),
            http: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn health(&self) -> Result<Value> {
        self.call(Method::GET, "/api/health", None).await
    }

    pub async fn submit(&self, request: &MissionRequest) -> Result<MissionId> {
        #[derive(serde::Deserialize)]
        struct Submitted {
            id: MissionId,
        }
        let body = serde_json::to_value(request)?;
        let submitted: Submitted = self.call(Method::POST, "/api/missions", Some(body)).await?;
        Ok(submitted.id)
    }

    pub async fn status(&self, id: MissionId) -> Result<MissionStatus> {
        self.call(Method::GET, &format!("/api/missions/{id}"), None).await
    }

    pub async fn list(&self) -> Result<Vec<MissionStatus>> {
        self.call(Method::GET, "/api/missions", None).await
    }

    pub async fn pause(&self, id: MissionId) -> Result<MissionStatus> {
        self.call(Method::POST, &format!("/api/missions/{id}/pause"), None).await
    }

    pub async fn resume(&self, id: MissionId) -> Result<MissionStatus> {
        self.call(Method::POST, &format!("/api/missions/{id}/resume"), None).await
    }

    pub async fn terminate(&self, id: MissionId) -> Result<MissionStatus> {
        self.call(Method::POST, &format!("/api/missions/{id}/terminate"), None).await
    }

    pub async fn clear(&self, id: MissionId) -> Result<()> {
        let _: Value = self.call(Method::DELETE, &format!("/api/missions/{id}"), None).await?;
        Ok(())
    }

    pub async fn engine(&self) -> Result<EngineInfo> {
        self.call(Method::GET, "/api/engine", None).await
    }

    pub async fn apply_engine(&self, id: &str) -> Result<EngineDescriptor> {
        self.call(Method::PUT, "/api/engine", Some(json!({ "id": id }))).await
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{path}", self.base))
            .timeout(self.timeout);
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LesewerkError::ControlApi(format!("{method} {path}: timed out"))
            } else {
                LesewerkError::ControlApi(format!("{method} {path}: {e}"))
            }
        })?;
        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| {
            LesewerkError::ControlApi(format!("{method} {path}: unreadable response: {e}"))
        })?;
        debug!(%method, path, status = status.as_u16(), "control response");

        if !status.is_success() {
            let message = payload["message"]
                .as_str()
                .or_else(|| payload["error"].as_str())
                .unwrap_or("request failed");
            return Err(LesewerkError::ControlApi(format!("{}: {message}", status.as_u16())));
        }
        Ok(serde_json::from_value(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::control_server::ControlServer;
    use crate::engine::{EngineCatalog, EngineSlot};
    use crate::registry::MissionRegistry;
    use crate::submission::SubmitItem;
    use crate::test_support::ScriptedBackend;
    use lesewerk_core::{AppConfig, MissionState};

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = ControlClient::new(addr).with_timeout(Duration::from_millis(100));
        let err = client.health().await.unwrap_err();
        assert!(matches!(&err, LesewerkError::ControlApi(m) if m.contains("timed out")), "{err}");
        hold.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_a_control_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = ControlClient::local(port).health().await.unwrap_err();
        assert!(matches!(err, LesewerkError::ControlApi(_)));
    }

    #[tokio::test]
    async fn client_drives_a_live_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = EngineCatalog::new();
        catalog.register_instance(ScriptedBackend::named("scripted"));
        let slot = EngineSlot::new(catalog, 2);
        slot.apply("scripted").unwrap();
        let mut config = AppConfig::default();
        config.mission_defaults.output_dir = Some(dir.path().to_path_buf());
        let registry = Arc::new(MissionRegistry::new(Arc::new(slot), &config, dir.path().to_path_buf()));

        let mut server = ControlServer::new(0, false);
        let port = server.start(registry).await.unwrap();
        let client = ControlClient::local(port);

        assert_eq!(client.health().await.unwrap()["status"], "ok");

        let request = MissionRequest {
            items: vec![SubmitItem::Image {
                path: PathBuf::from("/in/scan.png"),
            }],
            ..MissionRequest::default()
        };
        let id = client.submit(&request).await.unwrap();

        let mut completed = false;
        for _ in 0..200 {
            if client.status(id).await.unwrap().state == MissionState::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed);
        assert_eq!(client.list().await.unwrap().len(), 1);

        let err = client.pause(id).await.unwrap_err();
        assert!(matches!(&err, LesewerkError::ControlApi(m) if m.starts_with("409: ")), "{err}");

        assert_eq!(client.engine().await.unwrap().available, vec!["scripted".to_string()]);
        client.clear(id).await.unwrap();
        server.stop().await.unwrap();
    }
}

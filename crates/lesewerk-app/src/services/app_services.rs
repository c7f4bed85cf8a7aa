// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer for `lesewerk serve`: loads the configuration,
// binds the default recognition engine, and owns the control API server.
//
// The registry is shared with the control API's connection tasks; the server
// sits behind an async mutex because starting and stopping it awaits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lesewerk_core::AppConfig;
use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_engine::{ControlServer, EngineSlot, MissionRegistry, builtin_catalog};
use tracing::{info, warn};

use super::data_dir;

const CONFIG_FILE: &str = "config.json";

#[derive(Clone)]
pub struct AppServices {
    registry: Arc<MissionRegistry>,
    control: Arc<tokio::sync::Mutex<ControlServer>>,
    data_dir: PathBuf,
    config: Arc<Mutex<AppConfig>>,
}

impl AppServices {
    /// Initialise services rooted at the platform data directory.
    pub fn init() -> Result<Self> {
        Self::open(data_dir::data_dir())
    }

    /// Initialise services rooted at `dir`.
    ///
    /// A missing or unreadable config file yields the defaults.  An unknown
    /// default engine falls back to `plain-text` with a warning.
    pub fn open(dir: PathBuf) -> Result<Self> {
        info!(path = %dir.display(), "initialising app services");
        let config = load_config(&dir).unwrap_or_default();

        let slot = Arc::new(EngineSlot::new(
            builtin_catalog(&config),
            config.concurrency_ceiling(),
        ));
        if let Err(e) = slot.apply(&config.default_engine) {
            warn!(engine = %config.default_engine, error = %e, "default engine unavailable");
            slot.apply(lesewerk_engine::backends::plain_text::ENGINE_ID)?;
        }

        let registry = Arc::new(MissionRegistry::new(
            slot,
            &config,
            data_dir::fallback_output_dir(&dir),
        ));
        let control = ControlServer::from_config(&config);

        Ok(Self {
            registry,
            control: Arc::new(tokio::sync::Mutex::new(control)),
            data_dir: dir,
            config: Arc::new(Mutex::new(config)),
        })
    }

    pub fn registry(&self) -> &Arc<MissionRegistry> {
        &self.registry
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // -- Control API ---------------------------------------------------------

    /// Replace the not-yet-started server with one on `port` / `allow_lan`.
    pub async fn override_listener(&self, port: Option<u16>, allow_lan: bool) {
        let mut config = self.config();
        if let Some(port) = port {
            config.control_port = port;
        }
        config.allow_lan |= allow_lan;
        *self.control.lock().await = ControlServer::from_config(&config);
        *self.config.lock().expect("config lock poisoned") = config;
    }

    /// Start the control API and return the effective port.
    ///
    /// When the configured port was taken, the port actually bound is written
    /// back to the config file so clients can find the server.
    pub async fn start_control_api(&self) -> Result<u16> {
        let mut server = self.control.lock().await;
        let port = server.start(Arc::clone(&self.registry)).await?;

        let mut config = self.config();
        if config.control_port != 0 && config.control_port != port {
            config.control_port = port;
            self.save_config(&config)?;
        }
        Ok(port)
    }

    pub async fn stop_control_api(&self) -> Result<()> {
        self.control.lock().await.stop().await
    }

    /// Terminate every active mission and stop the control API.
    pub async fn shutdown(&self) -> Result<usize> {
        if self.registry.any_interruptible() {
            warn!("shutting down with missions in progress; unsaved results are discarded");
        }
        let stopped = self.registry.terminate_all();
        self.stop_control_api().await?;
        info!(stopped, "services shut down");
        Ok(stopped)
    }

    // -- Config persistence --------------------------------------------------

    pub fn config(&self) -> AppConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }

    /// Update and persist the config.
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        *self.config.lock().expect("config lock poisoned") = config.clone();
        persist_config(&self.data_dir, config)
    }
}

/// Read `config.json` from `data_dir`.
pub fn load_config(data_dir: &Path) -> Option<AppConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let data = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&data) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable config");
            None
        }
    }
}

fn persist_config(data_dir: &Path, config: &AppConfig) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)
        .map_err(|e| LesewerkError::ConfigPersistFailure(format!("{}: {e}", path.display())))
}

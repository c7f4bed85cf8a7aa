// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Mission registry: every mission the process knows about, plus the shared
// engine slot.  This is the surface the control API drives.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::{AppConfig, EngineDescriptor, MissionConfig, MissionId, MissionStatus};

use crate::engine::{CallSettings, EngineSlot};
use crate::mission::MissionController;
use crate::submission::{self, MissionRequest};

/// Active binding and the backends it could be swapped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub active: Option<EngineDescriptor>,
    pub available: Vec<String>,
    /// Missions currently leasing the binding.
    pub leases: usize,
}

pub struct MissionRegistry {
    slot: Arc<EngineSlot>,
    missions: Mutex<Vec<Arc<MissionController>>>,
    defaults: MissionConfig,
    settings: CallSettings,
    fallback_dir: PathBuf,
}

impl MissionRegistry {
    pub fn new(slot: Arc<EngineSlot>, config: &AppConfig, fallback_dir: PathBuf) -> Self {
        Self {
            slot,
            missions: Mutex::new(Vec::new()),
            defaults: config.mission_defaults.clone(),
            settings: CallSettings::from_config(config),
            fallback_dir,
        }
    }

    fn missions(&self) -> MutexGuard<'_, Vec<Arc<MissionController>>> {
        self.missions.lock().expect("mission registry lock poisoned")
    }

    /// Create, fill and start a mission.  Returns its id.
    ///
    /// Nothing is registered when expansion or start-up fails.
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    pub fn submit(&self, request: MissionRequest) -> Result<MissionId> {
        let name = submission::mission_name(&request);
        let config = request.config.unwrap_or_else(|| self.defaults.clone());
        let specs = submission::expand(request.items, &config)?;

        let mission = MissionController::new(
            name,
            config,
            Arc::clone(&self.slot),
            self.settings,
            self.fallback_dir.clone(),
        );
        let jobs = mission.enqueue(specs)?;
        mission.start()?;

        let id = mission.id();
        info!(mission_id = %id, mission = %mission.name(), jobs, "Mission submitted");
        self.missions().push(mission);
        Ok(id)
    }

    pub fn get(&self, id: MissionId) -> Result<Arc<MissionController>> {
        self.missions()
            .iter()
            .find(|m| m.id() == id)
            .cloned()
            .ok_or(LesewerkError::MissionNotFound(id))
    }

    pub fn status(&self, id: MissionId) -> Result<MissionStatus> {
        Ok(self.get(id)?.status())
    }

    pub fn list(&self) -> Vec<MissionStatus> {
        let missions: Vec<_> = self.missions().clone();
        missions.iter().map(|m| m.status()).collect()
    }

    pub fn pause(&self, id: MissionId) -> Result<MissionStatus> {
        let mission = self.get(id)?;
        mission.pause()?;
        Ok(mission.status())
    }

    pub fn resume(&self, id: MissionId) -> Result<MissionStatus> {
        let mission = self.get(id)?;
        mission.resume()?;
        Ok(mission.status())
    }

    pub fn terminate(&self, id: MissionId) -> Result<MissionStatus> {
        let mission = self.get(id)?;
        mission.force_terminate()?;
        Ok(mission.status())
    }

    /// Forget a terminal mission.
    pub fn clear(&self, id: MissionId) -> Result<()> {
        let mut missions = self.missions();
        let position = missions
            .iter()
            .position(|m| m.id() == id)
            .ok_or(LesewerkError::MissionNotFound(id))?;
        let state = missions[position].state();
        if !state.is_terminal() {
            return Err(LesewerkError::InvalidTransition {
                from: state,
                event: "clear",
            });
        }
        missions.remove(position);
        Ok(())
    }

    pub fn engine(&self) -> EngineInfo {
        EngineInfo {
            active: self.slot.current(),
            available: self.slot.catalog().ids(),
            leases: self.slot.active_leases(),
        }
    }

    /// Swap the active binding.  Fails with `EngineBusy` while any mission
    /// is running, paused or saving.
    pub fn apply_engine(&self, id: &str) -> Result<EngineDescriptor> {
        self.slot.apply(id)
    }

    /// True when closing the process would interrupt a mission.
    pub fn any_interruptible(&self) -> bool {
        self.missions().iter().any(|m| m.is_interruptible())
    }

    /// Force-terminate every active mission (process shutdown).
    pub fn terminate_all(&self) -> usize {
        let missions: Vec<_> = self.missions().clone();
        let mut stopped = 0;
        for mission in missions {
            match mission.force_terminate() {
                Ok(()) => stopped += 1,
                Err(LesewerkError::InvalidTransition { .. }) => {}
                Err(e) => warn!(mission_id = %mission.id(), error = %e, "terminate failed"),
            }
        }
        stopped
    }
}

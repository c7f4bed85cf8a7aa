// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: owns the configuration file, the mission registry and the
// control API server for `lesewerk serve`.

pub mod app_services;
pub mod data_dir;

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lesewerk: local batch OCR engine.
//
// Entry point.  `serve` hosts the mission registry behind the control API;
// every other subcommand is a client of a running server.

mod cli;
mod services;

use std::process::ExitCode;

use lesewerk_core::error::Result;
use lesewerk_core::human_errors::humanize_error;
use lesewerk_core::{AppConfig, MissionStatus};
use lesewerk_engine::ControlClient;
use tracing_subscriber::EnvFilter;

use cli::{Command, Invocation};
use services::app_services::{AppServices, load_config};
use services::data_dir;

#[tokio::main]
async fn main() -> ExitCode {
    let config = load_config(&data_dir::data_dir()).unwrap_or_default();
    init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match cli::parse(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{e}\n\n{}", cli::USAGE);
            return ExitCode::from(2);
        }
    };

    match run(invocation, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let human = humanize_error(&e);
            eprintln!("error: {}", human.message);
            eprintln!("  {}", human.suggestion);
            tracing::debug!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG`, else the configured filter, else `info`.  Logs go to stderr so
/// command output on stdout stays clean.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(invocation: Invocation, config: &AppConfig) -> Result<()> {
    let client = ControlClient::local(invocation.port.unwrap_or(config.control_port));

    match invocation.command {
        Command::Help => println!("{}", cli::USAGE),
        Command::Serve { lan } => serve(invocation.port, lan).await?,
        Command::Submit(submit) => {
            let request = submit.into_request(&config.mission_defaults)?;
            let id = client.submit(&request).await?;
            println!("{id}");
        }
        Command::Status(Some(id)) => print_status(&client.status(id).await?),
        Command::Status(None) => {
            let missions = client.list().await?;
            if missions.is_empty() {
                println!("no missions");
            }
            for status in &missions {
                print_status(status);
            }
        }
        Command::Pause(id) => print_status(&client.pause(id).await?),
        Command::Resume(id) => print_status(&client.resume(id).await?),
        Command::Stop(id) => print_status(&client.terminate(id).await?),
        Command::Engine(Some(id)) => {
            let descriptor = client.apply_engine(&id).await?;
            println!("bound {} (max {} concurrent)", descriptor.id, descriptor.capabilities.max_concurrency);
        }
        Command::Engine(None) => {
            let info = client.engine().await?;
            match &info.active {
                Some(active) => println!("active:    {} ({} leases)", active.id, info.leases),
                None => println!("active:    none"),
            }
            println!("available: {}", info.available.join(", "));
        }
        Command::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }
    Ok(())
}

async fn serve(port: Option<u16>, lan: bool) -> Result<()> {
    let services = AppServices::init()?;
    if !services.config().http_enabled && port.is_none() {
        tracing::warn!("control API disabled in config.json; pass --port to start it anyway");
        return Ok(());
    }
    services.override_listener(port, lan).await;

    let port = services.start_control_api().await?;
    let engine = services.registry().engine().active.map(|d| d.id).unwrap_or_default();
    tracing::info!(port, engine = %engine, data_dir = %services.data_dir().display(), "Lesewerk serving");
    println!("lesewerk listening on port {port}");

    tokio::signal::ctrl_c().await?;
    let stopped = services.shutdown().await?;
    if stopped > 0 {
        println!("terminated {stopped} mission(s)");
    }
    Ok(())
}

fn print_status(status: &MissionStatus) {
    let c = &status.counts;
    println!(
        "{}  {:<10} {:<24} {}/{} done, {} failed, {} cancelled  [{}] {:.1}s",
        status.id,
        format!("{:?}", status.state),
        status.name,
        c.done,
        c.total,
        c.failed,
        c.cancelled,
        status.engine.as_deref().unwrap_or("-"),
        status.elapsed_ms as f64 / 1000.0,
    );
    for failure in &status.failures {
        println!("    #{} {}: {}", failure.index, failure.title, failure.failure);
    }
    for artifact in &status.artifacts {
        println!("    -> {}", artifact.display());
    }
    if let Some(reason) = &status.stop_reason {
        println!("    stopped: {reason:?}");
    }
}

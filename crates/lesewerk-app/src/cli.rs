// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line parsing.

use std::path::PathBuf;

use lesewerk_core::error::{LesewerkError, Result};
use lesewerk_core::{MissionConfig, MissionId, OutputFormat};
use lesewerk_engine::{MissionRequest, SubmitItem};

pub const USAGE: &str = "\
Usage:
  lesewerk serve [--port N] [--lan]
  lesewerk submit [--format f,..] [--out DIR] [--recursive] [--skip-blank] [--name N] PATH..
  lesewerk status [ID]
  lesewerk pause|resume|stop ID
  lesewerk engine [ID]
  lesewerk health

Client commands accept --port N to reach a server on a non-default port.";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubmitArgs {
    pub formats: Vec<OutputFormat>,
    pub out: Option<PathBuf>,
    pub recursive: bool,
    pub skip_blank: bool,
    pub name: Option<String>,
    pub paths: Vec<PathBuf>,
}

impl SubmitArgs {
    /// Build a request from these arguments on top of `defaults`.
    pub fn into_request(self, defaults: &MissionConfig) -> Result<MissionRequest> {
        let mut config = defaults.clone();
        if !self.formats.is_empty() {
            config.formats = self.formats;
        }
        if self.out.is_some() {
            config.output_dir = self.out.map(absolute).transpose()?;
        }
        config.recursive_import |= self.recursive;
        config.skip_blank |= self.skip_blank;

        // The server may run with a different working directory.
        let items = self
            .paths
            .into_iter()
            .map(|p| absolute(p).and_then(SubmitItem::from_path))
            .collect::<Result<Vec<_>>>()?;

        Ok(MissionRequest {
            name: self.name,
            config: Some(config),
            items,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Serve { lan: bool },
    Submit(SubmitArgs),
    Status(Option<MissionId>),
    Pause(MissionId),
    Resume(MissionId),
    Stop(MissionId),
    Engine(Option<String>),
    Health,
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: Command,
    /// `--port`, for `serve` and the client commands alike.
    pub port: Option<u16>,
}

/// Parse the arguments after the program name.
pub fn parse(args: &[String]) -> Result<Invocation> {
    let mut port = None;
    let mut lan = false;
    let mut submit = SubmitArgs::default();
    let mut positional: Vec<&str> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--port" => {
                let value = value_of("--port", iter.next())?;
                port = Some(
                    value
                        .parse()
                        .map_err(|_| usage_error(format!("bad port: {value}")))?,
                );
            }
            "--lan" => lan = true,
            "--format" => {
                for name in value_of("--format", iter.next())?.split(',') {
                    let format = OutputFormat::parse(name)
                        .ok_or_else(|| usage_error(format!("unknown format: {name}")))?;
                    submit.formats.push(format);
                }
            }
            "--out" => submit.out = Some(PathBuf::from(value_of("--out", iter.next())?)),
            "--name" => submit.name = Some(value_of("--name", iter.next())?.to_string()),
            "--recursive" => submit.recursive = true,
            "--skip-blank" => submit.skip_blank = true,
            "-h" | "--help" => positional.insert(0, "help"),
            flag if flag.starts_with("--") => {
                return Err(usage_error(format!("unknown option: {flag}")));
            }
            other => positional.push(other),
        }
    }

    let Some((&verb, rest)) = positional.split_first() else {
        return Ok(Invocation {
            command: Command::Help,
            port,
        });
    };

    let command = match verb {
        "serve" => Command::Serve { lan },
        "submit" => {
            if rest.is_empty() {
                return Err(usage_error("submit needs at least one path".into()));
            }
            submit.paths = rest.iter().map(PathBuf::from).collect();
            Command::Submit(submit)
        }
        "status" => Command::Status(rest.first().map(|s| s.parse()).transpose()?),
        "pause" => Command::Pause(mission_id(rest)?),
        "resume" => Command::Resume(mission_id(rest)?),
        "stop" => Command::Stop(mission_id(rest)?),
        "engine" => Command::Engine(rest.first().map(|s| s.to_string())),
        "health" => Command::Health,
        "help" => Command::Help,
        other => return Err(usage_error(format!("unknown command: {other}"))),
    };
    Ok(Invocation { command, port })
}

fn value_of<'a>(flag: &str, value: Option<&'a String>) -> Result<&'a str> {
    value
        .map(String::as_str)
        .ok_or_else(|| usage_error(format!("{flag} needs a value")))
}

fn mission_id(rest: &[&str]) -> Result<MissionId> {
    rest.first()
        .ok_or_else(|| usage_error("missing mission id".into()))?
        .parse()
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn usage_error(message: String) -> LesewerkError {
    LesewerkError::InvalidSubmission(message)
}

//! # Terminal Front End
//!
//! Reads one command per line from stdin and prints what the core reports.
//!
//! ## Commands
//! ```text
//! scan | disconnect | tare | start | stop | log-start | log-stop
//! read-target | target <grams> | export <path> [shot-id] | append <path> [shot-id]
//! clear | status | help | quit
//! ```
//!
//! Mass readings arrive several times a second and are not echoed; `status`
//! prints the latest one together with a summary of the rolling window and
//! the shot log.

use crate::codec::Grams;
use crate::connection::Command;
use crate::orchestrator::AppEvent;
use crate::recorder::{AggregatorSnapshot, ShotId};
use crate::scale::{MassSample, MassSource, ScaleEvent};
use crate::timeseries::ReadingSliceExt;
use crossbeam_channel::Receiver;
use std::collections::VecDeque;
use std::path::PathBuf;

const MAX_STATUS_MESSAGES: usize = 10;

pub const HELP: &str = "\
Commands:
  scan                       find and connect to the scale
  disconnect                 drop the connection
  tare                       zero the scale
  start | stop               start or stop the brew cycle
  log-start | log-stop       start or stop shot logging
  read-target                read the target mass from the scale
  target <grams>             write a new target mass
  export <path> [shot-id]    write the shot log as CSV
  append <path> [shot-id]    append the shot log to an existing CSV
  clear                      clear the shot log
  status                     show connection, mass and log summary
  help                       show this message
  quit                       disconnect and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Input>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let verb = verb.to_ascii_lowercase();
    let command = match verb.as_str() {
        "help" | "?" => return Ok(Some(Input::Help)),
        "quit" | "exit" => return Ok(Some(Input::Quit)),
        "scan" => Command::Scan,
        "disconnect" => Command::Disconnect,
        "tare" => Command::Tare,
        "start" => Command::StartCycle,
        "stop" => Command::StopCycle,
        "log-start" => Command::StartShotLogging,
        "log-stop" => Command::StopShotLogging,
        "read-target" => Command::ReadTargetMass,
        "target" => {
            let grams = args
                .first()
                .ok_or_else(|| "Usage: target <grams>".to_string())?;
            let value: f32 = grams
                .parse()
                .map_err(|_| format!("Invalid target mass: {}", grams))?;
            if !value.is_finite() {
                return Err(format!("Invalid target mass: {}", grams));
            }
            Command::WriteTargetMass(Grams(value))
        }
        "export" | "append" => parse_export(verb == "append", &args)?,
        "clear" => Command::ClearLog,
        "status" => Command::Snapshot,
        other => return Err(format!("Unknown command '{}', type help", other)),
    };
    Ok(Some(Input::Command(command)))
}

fn parse_export(append: bool, args: &[&str]) -> Result<Command, String> {
    let usage = || {
        let verb = if append { "append" } else { "export" };
        format!("Usage: {} <path> [shot-id]", verb)
    };
    let path = args.first().ok_or_else(usage)?;
    let shot_id = match args.get(1) {
        Some(id) => Some(
            id.parse::<ShotId>()
                .map_err(|_| format!("Invalid shot id: {}", id))?,
        ),
        None => None,
    };
    if args.len() > 2 {
        return Err(usage());
    }
    Ok(Command::Export {
        path: PathBuf::from(path),
        append,
        shot_id,
    })
}

/// Turns core events into printable lines
#[derive(Debug, Default)]
pub struct Console {
    connection: String,
    latest: Option<MassSample>,
    status_messages: VecDeque<String>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            connection: "Idle".to_string(),
            ..Self::default()
        }
    }

    fn remember(&mut self, message: &str) {
        if self.status_messages.len() == MAX_STATUS_MESSAGES {
            self.status_messages.pop_front();
        }
        self.status_messages.push_back(message.to_string());
    }

    /// Lines to print for `event`, if any
    pub fn apply(&mut self, event: AppEvent) -> Vec<String> {
        match event {
            AppEvent::Status(message) => {
                self.remember(&message);
                vec![message]
            }
            AppEvent::Rejected(message) => {
                self.remember(&message);
                vec![format!("! {}", message)]
            }
            AppEvent::ShotState {
                in_progress,
                logging_active,
            } => vec![format!(
                "Shot in progress: {}, logging: {}",
                in_progress, logging_active
            )],
            AppEvent::Scale(event) => self.apply_scale(event),
            AppEvent::Snapshot(snapshot) => self.summary(&snapshot),
        }
    }

    fn apply_scale(&mut self, event: ScaleEvent) -> Vec<String> {
        let line = match event {
            ScaleEvent::MassUpdated(sample) | ScaleEvent::LoggingSample(sample) => {
                self.latest = Some(sample);
                return Vec::new();
            }
            ScaleEvent::ScanStarted => {
                self.connection = "Scanning".to_string();
                return Vec::new();
            }
            ScaleEvent::ScanTimedOut => {
                self.connection = "Idle".to_string();
                return Vec::new();
            }
            ScaleEvent::ScanFailed(reason) => {
                self.connection = "Idle".to_string();
                format!("Scan failed: {}", reason)
            }
            ScaleEvent::DeviceFound { name, .. } => format!("Found {}", name),
            ScaleEvent::Connecting(device) => {
                self.connection = "Connecting".to_string();
                format!("Connecting to {}...", device)
            }
            ScaleEvent::Connected(_) => {
                self.connection = "Discovering services".to_string();
                "Connected, discovering services...".to_string()
            }
            ScaleEvent::Ready(device) => {
                self.connection = format!("Ready ({})", device);
                "Scale ready".to_string()
            }
            ScaleEvent::Disconnecting(_) => {
                self.connection = "Disconnecting".to_string();
                return Vec::new();
            }
            ScaleEvent::Disconnected { .. } | ScaleEvent::FailedToConnect { .. } => {
                self.connection = "Idle".to_string();
                self.latest = None;
                return Vec::new();
            }
            ScaleEvent::TargetMassRead(grams) => format!("Target mass: {} g", grams),
            ScaleEvent::ShotStatusChanged(running) => {
                format!("Scale shot status: {}", if running { "running" } else { "stopped" })
            }
        };
        vec![line]
    }

    fn summary(&self, snapshot: &AggregatorSnapshot) -> Vec<String> {
        let mut lines = vec![format!("Connection: {}", self.connection)];

        lines.push(match self.latest {
            Some(sample) => {
                let source = match sample.source {
                    MassSource::Live => "live",
                    MassSource::LoggingFeed => "logging feed",
                };
                format!("Mass: {} g ({})", sample.value, source)
            }
            None => "Mass: --".to_string(),
        });

        let readings = snapshot.readings.as_slice();
        match (readings.min_max_time(), readings.min_max_mass()) {
            (Some((first, last)), Some((min, max))) => lines.push(format!(
                "Window: {} readings over {:.1} s, {} to {} g",
                readings.len(),
                (last - first) as f64 / 1000.0,
                min,
                max
            )),
            _ => lines.push("Window: empty".to_string()),
        }

        let shots: Vec<String> = snapshot.shot_ids.iter().map(|id| id.to_string()).collect();
        lines.push(format!(
            "Shot log: {} entries, shots [{}]",
            snapshot.entries.len(),
            shots.join(", ")
        ));

        if let Some(session) = snapshot.session {
            let phase = match (session.in_progress, session.logging_active) {
                (true, _) => "in progress",
                (false, true) => "finishing",
                (false, false) => "done",
            };
            lines.push(format!("Current shot: {} ({})", session.id, phase));
        }

        if !self.status_messages.is_empty() {
            lines.push("Recent:".to_string());
            lines.extend(self.status_messages.iter().map(|m| format!("  {}", m)));
        }
        lines
    }
}

/// Print events until every sender is gone
pub fn run_printer(events: Receiver<AppEvent>) {
    let mut console = Console::new();
    for event in events.iter() {
        for line in console.apply(event) {
            println!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ShotAggregator;
    use crate::transport::DeviceId;
    use std::time::Duration;

    fn command(line: &str) -> Command {
        match parse_line(line) {
            Ok(Some(Input::Command(command))) => command,
            other => panic!("{:?} parsed as {:?}", line, other),
        }
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(command("scan"), Command::Scan);
        assert_eq!(command("  TARE "), Command::Tare);
        assert_eq!(command("log-start"), Command::StartShotLogging);
        assert_eq!(command("log-stop"), Command::StopShotLogging);
        assert_eq!(command("status"), Command::Snapshot);
        assert_eq!(parse_line("help"), Ok(Some(Input::Help)));
        assert_eq!(parse_line("quit"), Ok(Some(Input::Quit)));
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn test_parse_target_mass() {
        assert_eq!(command("target 36.5"), Command::WriteTargetMass(Grams(36.5)));
        assert!(parse_line("target").is_err());
        assert!(parse_line("target lots").is_err());
        assert!(parse_line("target NaN").is_err());
    }

    #[test]
    fn test_parse_export() {
        assert_eq!(
            command("export shots.csv"),
            Command::Export {
                path: PathBuf::from("shots.csv"),
                append: false,
                shot_id: None,
            }
        );
        assert_eq!(
            command("append logs/shots.csv 1718000000000"),
            Command::Export {
                path: PathBuf::from("logs/shots.csv"),
                append: true,
                shot_id: Some(1_718_000_000_000),
            }
        );
        assert!(parse_line("export").is_err());
        assert!(parse_line("export a.csv notanid").is_err());
        assert!(parse_line("export a.csv 1 2").is_err());
    }

    #[test]
    fn test_unknown_command() {
        let err = parse_line("brew").unwrap_err();
        assert!(err.contains("brew"));
    }

    #[test]
    fn test_mass_updates_are_quiet() {
        let mut console = Console::new();
        let sample = MassSample {
            value: Grams(12.3),
            source: MassSource::Live,
            observed_at: 1_000,
        };
        assert!(console
            .apply(AppEvent::Scale(ScaleEvent::MassUpdated(sample)))
            .is_empty());
        assert_eq!(console.latest, Some(sample));
    }

    #[test]
    fn test_status_history_is_bounded() {
        let mut console = Console::new();
        for i in 0..15 {
            console.apply(AppEvent::Status(format!("message {}", i)));
        }
        assert_eq!(console.status_messages.len(), MAX_STATUS_MESSAGES);
        assert_eq!(console.status_messages.front().map(String::as_str), Some("message 5"));
    }

    #[test]
    fn test_connection_tracking() {
        let mut console = Console::new();
        let device = DeviceId("scale-1".to_string());
        console.apply(AppEvent::Scale(ScaleEvent::ScanStarted));
        assert_eq!(console.connection, "Scanning");
        console.apply(AppEvent::Scale(ScaleEvent::Ready(device.clone())));
        assert_eq!(console.connection, "Ready (scale-1)");
        console.apply(AppEvent::Scale(ScaleEvent::Disconnected {
            device,
            reason: "link lost".to_string(),
        }));
        assert_eq!(console.connection, "Idle");
    }

    #[test]
    fn test_snapshot_summary() {
        let mut aggregator = ShotAggregator::new(Duration::from_secs(60));
        let id = aggregator.start_shot(1_000);
        aggregator.record_sample(Grams(0.5), true, 1_000);
        aggregator.record_sample(Grams(4.0), true, 3_500);

        let mut console = Console::new();
        let lines = console.apply(AppEvent::Snapshot(aggregator.snapshot()));
        assert_eq!(lines[0], "Connection: Idle");
        assert_eq!(lines[1], "Mass: --");
        assert_eq!(lines[2], "Window: 2 readings over 2.5 s, 0.5 to 4.0 g");
        assert_eq!(lines[3], format!("Shot log: 2 entries, shots [{}]", id));
        assert_eq!(lines[4], format!("Current shot: {} (in progress)", id));
    }
}

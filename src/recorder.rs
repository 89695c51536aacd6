//! # Shot Recording Module
//!
//! Aggregates scale telemetry into the two views the app shows and exports.
//!
//! ## Views
//! - **Rolling window**: every mass reading from the last 60 seconds, live feed and
//!   logging feed alike, tagged with whether a shot was in progress
//! - **Shot log**: logging-feed readings captured while a shot is being logged,
//!   cumulative across shots and keyed by shot id
//!
//! ## Shot lifecycle
//! `start_shot` → `stop_shot` → (grace period) → `finalize_logging`
//!
//! Stopping only clears the display flag. Capture continues until finalize so
//! readings the scale already had in flight still land in the finished shot.
//!
//! ## CSV layout
//! ```text
//! ShotID,Timestamp,ShotTimeMs,Mass,ShotStatus
//! 1718000000000,1718000000250,0,0.4,true
//! ```

use crate::codec::Grams;
use crate::error::ExportError;
use crate::timeseries::{RollingReading, RollingWindow};
use serde::Serialize;
use std::time::Duration;

pub const CSV_HEADER: [&str; 5] = ["ShotID", "Timestamp", "ShotTimeMs", "Mass", "ShotStatus"];

/// Identifier minted when a shot starts; strictly increasing
pub type ShotId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotLogEntry {
    pub shot_id: ShotId,
    pub timestamp: u64,
    pub elapsed_ms: u64,
    pub mass: Grams,
    pub shot_in_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotSession {
    pub id: ShotId,
    pub in_progress: bool,
    pub logging_active: bool,
    /// Timestamp of the first captured entry, the origin for elapsed times
    first_entry_at: Option<u64>,
    last_elapsed_ms: u64,
}

impl ShotSession {
    fn new(id: ShotId) -> Self {
        Self {
            id,
            in_progress: true,
            logging_active: true,
            first_entry_at: None,
            last_elapsed_ms: 0,
        }
    }

    fn elapsed_for(&mut self, timestamp: u64) -> u64 {
        let origin = *self.first_entry_at.get_or_insert(timestamp);
        let elapsed = timestamp.saturating_sub(origin).max(self.last_elapsed_ms);
        self.last_elapsed_ms = elapsed;
        elapsed
    }
}

/// Owned copy of the aggregator state for renderers
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSnapshot {
    pub version: u64,
    pub readings: Vec<RollingReading>,
    pub entries: Vec<ShotLogEntry>,
    pub shot_ids: Vec<ShotId>,
    pub session: Option<ShotSession>,
}

#[derive(Serialize)]
struct CsvRow {
    shot_id: ShotId,
    timestamp: u64,
    elapsed_ms: u64,
    mass: String,
    shot_in_progress: bool,
}

impl From<&ShotLogEntry> for CsvRow {
    fn from(entry: &ShotLogEntry) -> Self {
        Self {
            shot_id: entry.shot_id,
            timestamp: entry.timestamp,
            elapsed_ms: entry.elapsed_ms,
            mass: entry.mass.to_string(),
            shot_in_progress: entry.shot_in_progress,
        }
    }
}

pub struct ShotAggregator {
    window: RollingWindow,
    entries: Vec<ShotLogEntry>,
    session: Option<ShotSession>,
    last_shot_id: ShotId,
    version: u64,
}

impl ShotAggregator {
    pub fn new(window_span: Duration) -> Self {
        Self {
            window: RollingWindow::new(window_span),
            entries: Vec::new(),
            session: None,
            last_shot_id: 0,
            version: 0,
        }
    }

    pub fn shot_in_progress(&self) -> bool {
        self.session.is_some_and(|s| s.in_progress)
    }

    pub fn logging_active(&self) -> bool {
        self.session.is_some_and(|s| s.logging_active)
    }

    pub fn session(&self) -> Option<ShotSession> {
        self.session
    }

    /// Add a reading to the rolling window and, when it came from the logging
    /// feed during an active capture, to the shot log.
    pub fn record_sample(&mut self, mass: Grams, from_logging_feed: bool, at: u64) {
        let shot_in_progress = self.shot_in_progress();
        self.window.push(RollingReading {
            mass,
            timestamp: at,
            shot_in_progress,
        });

        if from_logging_feed {
            if let Some(session) = self.session.as_mut().filter(|s| s.logging_active) {
                let elapsed_ms = session.elapsed_for(at);
                self.entries.push(ShotLogEntry {
                    shot_id: session.id,
                    timestamp: at,
                    elapsed_ms,
                    mass,
                    shot_in_progress,
                });
            }
        }
        self.version += 1;
    }

    /// Begin a new shot, replacing any session still capturing.
    ///
    /// The id is the start timestamp, bumped when needed to stay strictly
    /// above the previous one.
    pub fn start_shot(&mut self, at: u64) -> ShotId {
        if let Some(previous) = self.session.filter(|s| s.logging_active) {
            log::info!("Shot {} superseded before finalize", previous.id);
        }
        let id = at.max(self.last_shot_id + 1);
        self.last_shot_id = id;
        self.session = Some(ShotSession::new(id));
        self.version += 1;
        log::info!("Shot {} started", id);
        id
    }

    pub fn stop_shot(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.in_progress = false;
            self.version += 1;
        }
    }

    pub fn finalize_logging(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.logging_active = false;
            self.version += 1;
            log::info!(
                "Shot {} finalized with {} entries",
                session.id,
                self.entries.iter().filter(|e| e.shot_id == session.id).count()
            );
        }
    }

    pub fn clear_log(&mut self) {
        self.entries.clear();
        self.version += 1;
    }

    pub fn entries(&self) -> &[ShotLogEntry] {
        &self.entries
    }

    /// Distinct shot ids in the log, oldest first
    pub fn shot_ids(&self) -> Vec<ShotId> {
        let mut ids: Vec<ShotId> = Vec::new();
        for entry in &self.entries {
            if ids.last() != Some(&entry.shot_id) && !ids.contains(&entry.shot_id) {
                ids.push(entry.shot_id);
            }
        }
        ids
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            version: self.version,
            readings: self.window.to_vec(),
            entries: self.entries.clone(),
            shot_ids: self.shot_ids(),
            session: self.session,
        }
    }

    /// Serialize the shot log, optionally restricted to one shot
    pub fn export_csv(&self, shot_id: Option<ShotId>) -> Result<String, ExportError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        writer.write_record(CSV_HEADER)?;
        for entry in self
            .entries
            .iter()
            .filter(|e| shot_id.map_or(true, |id| e.shot_id == id))
        {
            writer.serialize(CsvRow::from(entry))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| ExportError::Csv(e.into_error().into()))?;
        Ok(String::from_utf8(bytes)?)
    }
}

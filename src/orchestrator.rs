//! # Session Orchestrator Module
//!
//! Glue between the device session, the shot aggregator and the presentation
//! layer. Owns both and is the only thing that mutates them.
//!
//! ## Composite actions
//! - **Start shot logging**: tare, start the shot, enable the device logging
//!   feed, start the brew cycle. Refused unless the scale is ready.
//! - **Stop shot logging**: stop the brew cycle (when connected), stop the shot,
//!   then after the grace period finalize capture and disable the logging feed.
//!   A stop pushed by the scale itself takes the same path.
//!
//! Each step is best-effort; a failed step is reported and the sequence carries on.

use crate::clock::Clock;
use crate::config::Config;
use crate::connection::{Command, LoopEvent};
use crate::error::PreconditionError;
use crate::export;
use crate::recorder::{AggregatorSnapshot, ShotAggregator};
use crate::scale::{DeviceSession, ScaleEvent, SessionSettings};
use crate::timer::{self, TimerHandle, TimerIds};
use crate::transport::Transport;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// What the presentation layer receives
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Scale(ScaleEvent),
    /// Human-readable progress message
    Status(String),
    /// A command that could not be carried out, and why
    Rejected(String),
    ShotState {
        in_progress: bool,
        logging_active: bool,
    },
    Snapshot(AggregatorSnapshot),
}

pub struct Orchestrator<T: Transport> {
    device: DeviceSession<T>,
    aggregator: ShotAggregator,
    clock: Arc<dyn Clock>,
    sink: Sender<AppEvent>,
    loop_tx: UnboundedSender<LoopEvent>,
    finalize_delay: Duration,
    finalize_timer: Option<TimerHandle>,
    timer_ids: TimerIds,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(
        transport: T,
        config: &Config,
        clock: Arc<dyn Clock>,
        loop_tx: UnboundedSender<LoopEvent>,
        sink: Sender<AppEvent>,
    ) -> Self {
        let settings = SessionSettings {
            name_filter: config.device_name_filter.clone(),
            scan_timeout: config.scan_timeout(),
        };
        Self {
            device: DeviceSession::new(transport, settings, clock.clone(), loop_tx.clone()),
            aggregator: ShotAggregator::new(config.rolling_window()),
            clock,
            sink,
            loop_tx,
            finalize_delay: config.finalize_delay(),
            finalize_timer: None,
            timer_ids: TimerIds::default(),
        }
    }

    pub fn device(&self) -> &DeviceSession<T> {
        &self.device
    }

    pub fn aggregator(&self) -> &ShotAggregator {
        &self.aggregator
    }

    /// Process one loop event. Returns false when the loop should stop.
    pub fn handle(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::Command(command) => self.handle_command(command),
            LoopEvent::Transport(event) => self.device.handle_transport_event(event),
            LoopEvent::ScanTimeout(id) => self.device.handle_scan_timeout(id),
            LoopEvent::FinalizeDue(id) => {
                if timer::take_if_current(&mut self.finalize_timer, id) {
                    self.finalize_shot_logging();
                }
            }
            LoopEvent::Shutdown => return false,
        }
        self.dispatch_scale_events();
        true
    }

    /// Leave the scale in a clean state before the loop exits.
    ///
    /// Returns true when a disconnect was issued and the caller should wait
    /// for the transport to confirm it.
    pub fn shutdown(&mut self) -> bool {
        if self.finalize_timer.take().is_some() {
            self.finalize_shot_logging();
        }
        let disconnecting = match self.device.disconnect() {
            Ok(()) => true,
            Err(e) => {
                log::debug!("No disconnect needed on shutdown: {}", e);
                false
            }
        };
        self.dispatch_scale_events();
        disconnecting
    }

    fn notify(&self, event: AppEvent) {
        if self.sink.send(event).is_err() {
            log::debug!("Presentation sink closed, dropping event");
        }
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.notify(AppEvent::Status(message));
    }

    fn reject(&self, action: &str, reason: &PreconditionError) {
        let message = format!("Cannot {}: {}", action, reason);
        log::warn!("{}", message);
        self.notify(AppEvent::Rejected(message));
    }

    fn shot_state_changed(&self) {
        self.notify(AppEvent::ShotState {
            in_progress: self.aggregator.shot_in_progress(),
            logging_active: self.aggregator.logging_active(),
        });
    }

    /// Run a single device command, reporting a rejection instead of failing
    fn device_step(
        &mut self,
        action: &str,
        step: impl FnOnce(&mut DeviceSession<T>) -> Result<(), PreconditionError>,
    ) -> bool {
        match step(&mut self.device) {
            Ok(()) => true,
            Err(reason) => {
                self.reject(action, &reason);
                false
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Scan => {
                if self.device_step("scan", |d| d.start_scan()) {
                    self.status("Scanning for LoggingScale...");
                }
            }
            Command::Disconnect => {
                self.device_step("disconnect", |d| d.disconnect());
            }
            Command::Tare => {
                if self.device_step("send tare command", |d| d.send_tare()) {
                    self.status("Sent tare command");
                }
            }
            Command::StartCycle => {
                if self.device_step("start shot", |d| d.send_start_cycle()) {
                    self.status("Sent Shot Start command");
                }
            }
            Command::StopCycle => {
                if self.device_step("stop shot", |d| d.send_stop_cycle()) {
                    self.status("Sent Shot Stop command");
                }
            }
            Command::ReadTargetMass => {
                if self.device_step("read target mass", |d| d.read_target_mass()) {
                    self.status("Reading Target Mass from Scale...");
                }
            }
            Command::WriteTargetMass(grams) => {
                if self.device_step("write target mass", |d| d.write_target_mass(grams)) {
                    self.status(format!("Writing Target Mass: {} g", grams));
                }
            }
            Command::StartShotLogging => self.start_shot_logging(),
            Command::StopShotLogging => self.stop_shot_logging(),
            Command::Export {
                path,
                append,
                shot_id,
            } => {
                let result = self
                    .aggregator
                    .export_csv(shot_id)
                    .and_then(|csv| export::save_csv(&path, &csv, append));
                match result {
                    Ok(()) => self.status(format!(
                        "Saved CSV to {} (append={})",
                        path.display(),
                        append
                    )),
                    Err(e) => {
                        log::warn!("CSV export failed: {}", e);
                        self.notify(AppEvent::Rejected(format!("Error saving CSV: {}", e)));
                    }
                }
            }
            Command::ClearLog => {
                self.aggregator.clear_log();
                self.status("Shot log cleared");
            }
            Command::Snapshot => self.notify(AppEvent::Snapshot(self.aggregator.snapshot())),
        }
    }

    fn start_shot_logging(&mut self) {
        if !self.device.is_ready() {
            self.reject("start shot logging", &PreconditionError::NotConnected);
            return;
        }
        if let Some(pending) = self.finalize_timer.take() {
            log::info!("New shot started inside grace period, cancelling finalize");
            pending.cancel();
        }

        self.device_step("send tare command", |d| d.send_tare());
        let shot_id = self.aggregator.start_shot(self.clock.now_ms());
        self.device_step("enable logging", |d| d.start_logging_feed());
        self.device_step("start shot", |d| d.send_start_cycle());

        self.status(format!("Shot logging started (shot {})", shot_id));
        self.shot_state_changed();
    }

    fn stop_shot_logging(&mut self) {
        if self.device.is_ready() {
            self.device_step("stop shot", |d| d.send_stop_cycle());
        } else {
            self.status("Device not connected; stopping shot locally");
        }

        self.aggregator.stop_shot();
        self.shot_state_changed();

        if !self.aggregator.logging_active() {
            return;
        }
        if self.finalize_timer.is_some() {
            log::debug!("Finalize already pending");
            return;
        }
        let id = self.timer_ids.next();
        self.finalize_timer = Some(TimerHandle::schedule(
            id,
            self.finalize_delay,
            self.loop_tx.clone(),
            LoopEvent::FinalizeDue(id),
        ));
        self.status(format!(
            "Shot logging ending in {}s.",
            self.finalize_delay.as_secs()
        ));
    }

    fn finalize_shot_logging(&mut self) {
        self.aggregator.finalize_logging();
        if self.device.is_ready() {
            self.device_step("disable logging", |d| d.stop_logging_feed());
        }
        self.status("Shot logging ended.");
        self.shot_state_changed();
    }

    fn dispatch_scale_events(&mut self) {
        for event in self.device.drain_events() {
            match &event {
                ScaleEvent::MassUpdated(sample) => {
                    self.aggregator
                        .record_sample(sample.value, false, sample.observed_at);
                }
                ScaleEvent::LoggingSample(sample) => {
                    self.aggregator
                        .record_sample(sample.value, true, sample.observed_at);
                }
                ScaleEvent::ShotStatusChanged(false) => {
                    if self.aggregator.shot_in_progress() {
                        log::info!("Scale reported end of shot");
                        self.stop_shot_logging();
                    } else {
                        // Our own stop-cycle write echoed back
                        log::debug!("Scale reported end of shot with none in progress");
                    }
                }
                ScaleEvent::Disconnected { reason, .. } => {
                    self.status(format!("Disconnected, reason: {}", reason));
                }
                ScaleEvent::FailedToConnect { reason, .. } => {
                    self.status(format!("Failed to connect: {}", reason));
                }
                ScaleEvent::ScanTimedOut => self.status("No scale found, scan stopped"),
                _ => {}
            }
            self.notify(AppEvent::Scale(event));
        }
    }
}

//! # Connection Management Module
//!
//! Runs the scale core on a dedicated thread with its own Tokio runtime.
//!
//! ## Key Components
//! - `ConnectionManager`: owns the runtime and the single event loop
//! - `LoopEvent`: everything the loop reacts to (user commands, transport
//!   events, timer expiries)
//! - `CommandSender`: handle the presentation layer uses to issue commands
//!
//! ## Threading
//! The device session and the shot aggregator are only touched from the loop
//! task. Transport callbacks and timers post a `LoopEvent` instead of mutating
//! anything themselves.

use crate::btle::BtleTransport;
use crate::clock::SystemClock;
use crate::codec::Grams;
use crate::config::Config;
use crate::orchestrator::{AppEvent, Orchestrator};
use crate::recorder::ShotId;
use crate::transport::{Transport, TransportEvent};
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long shutdown waits for the last writes and the disconnect to go out
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// User-level commands, forwarded unchanged from the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Scan,
    Disconnect,
    Tare,
    StartCycle,
    StopCycle,
    ReadTargetMass,
    WriteTargetMass(Grams),
    StartShotLogging,
    StopShotLogging,
    Export {
        path: PathBuf,
        append: bool,
        shot_id: Option<ShotId>,
    },
    ClearLog,
    Snapshot,
}

#[derive(Debug)]
pub enum LoopEvent {
    Command(Command),
    Transport(TransportEvent),
    ScanTimeout(u64),
    FinalizeDue(u64),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: UnboundedSender<LoopEvent>,
}

impl CommandSender {
    /// Returns false once the event loop has gone away
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(LoopEvent::Command(command)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopEvent::Shutdown);
    }
}

/// Manages the scale connection lifecycle.
///
/// Runs in a dedicated thread with its own Tokio runtime so the terminal
/// front end can block on stdin.
pub struct ConnectionManager {
    loop_tx: UnboundedSender<LoopEvent>,
    loop_rx: UnboundedReceiver<LoopEvent>,
    sink: Sender<AppEvent>,
    config: Config,
}

impl ConnectionManager {
    /// Creates a new ConnectionManager.
    ///
    /// Returns the manager and a sender for issuing commands from the UI thread.
    pub fn new(sink: Sender<AppEvent>, config: Config) -> (Self, CommandSender) {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let commands = CommandSender {
            tx: loop_tx.clone(),
        };
        let manager = ConnectionManager {
            loop_tx,
            loop_rx,
            sink,
            config,
        };
        (manager, commands)
    }

    /// Runs the event loop until shutdown or until every command sender is dropped.
    ///
    /// This should be called in a spawned thread.
    pub fn run(self) {
        let rt = match Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("Failed to create async runtime: {}", e);
                let _ = self.sink.send(AppEvent::Status(format!(
                    "Failed to create async runtime: {}",
                    e
                )));
                return;
            }
        };
        rt.block_on(self.event_loop());
        log::info!("Connection manager: event loop finished, shutting down");
    }

    async fn event_loop(self) {
        let ConnectionManager {
            loop_tx,
            mut loop_rx,
            sink,
            config,
        } = self;

        let transport = match BtleTransport::open(loop_tx.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Bluetooth unavailable: {}", e);
                let _ = sink.send(AppEvent::Status(e.to_string()));
                BtleTransport::unavailable(loop_tx.clone(), e)
            }
        };

        let mut orchestrator = Orchestrator::new(
            transport,
            &config,
            Arc::new(SystemClock::new()),
            loop_tx.clone(),
            sink,
        );
        // Orchestrator and transport keep senders alive, so recv() ends on Shutdown
        drop(loop_tx);

        if config.scan_on_startup {
            orchestrator.handle(LoopEvent::Command(Command::Scan));
        }

        while let Some(event) = loop_rx.recv().await {
            if !orchestrator.handle(event) {
                break;
            }
        }
        log::debug!(
            "Event loop ending in state {:?} (device {:?}), {} shot log entries",
            orchestrator.device().state(),
            orchestrator.device().device(),
            orchestrator.aggregator().entries().len()
        );
        if orchestrator.shutdown() {
            drain_until_disconnected(&mut orchestrator, &mut loop_rx, SHUTDOWN_GRACE).await;
        }
    }
}

/// Keep handling loop events until the transport confirms the disconnect.
///
/// The runtime cancels every spawned task when it is dropped, so returning
/// early would abandon the final writes. Returns false on timeout.
async fn drain_until_disconnected<T: Transport>(
    orchestrator: &mut Orchestrator<T>,
    loop_rx: &mut UnboundedReceiver<LoopEvent>,
    grace: Duration,
) -> bool {
    let drain = async {
        while let Some(event) = loop_rx.recv().await {
            let done = matches!(
                event,
                LoopEvent::Transport(TransportEvent::Disconnected { .. })
            );
            orchestrator.handle(event);
            if done {
                return true;
            }
        }
        false
    };
    match tokio::time::timeout(grace, drain).await {
        Ok(true) => true,
        Ok(false) => {
            log::warn!("Event channel closed before the scale disconnected");
            false
        }
        Err(_) => {
            log::warn!("Scale did not disconnect within {:?}", grace);
            false
        }
    }
}

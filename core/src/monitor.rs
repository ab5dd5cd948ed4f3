//! Decides when the sync engine runs: on connectivity changes, on a
//! periodic timer, after a debounce window following local edits, and when
//! another process marks the shared store dirty.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::{SyncConfig, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A local mutation was recorded.
    ChangesMarked,
    /// Someone asked for a sync soon.
    SyncRequested,
    Online,
    Offline,
    /// A pass failed for a reason other than connectivity.
    RetryLater,
    Shutdown,
}

#[derive(Clone)]
pub struct SignalSender(mpsc::UnboundedSender<Signal>);

pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender(tx), rx)
}

impl SignalSender {
    /// Send without caring whether a monitor is listening.
    pub fn send(&self, signal: Signal) {
        if self.0.send(signal).is_err() {
            debug!(?signal, "no monitor listening");
        }
    }

    /// A sender whose receiver is already gone, for one-shot processes.
    pub fn detached() -> Self {
        signal_channel().0
    }
}

pub struct SyncMonitor {
    engine: Arc<SyncEngine>,
    signals: SignalReceiver,
    config: SyncConfig,
}

/// Owner of the running monitor tasks.
pub struct MonitorHandle {
    sender: SignalSender,
    main: JoinHandle<()>,
    helpers: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn notify(&self, signal: Signal) {
        self.sender.send(signal);
    }

    /// Stop every timer and wait for the main loop to exit. A pass already
    /// running finishes on its own.
    pub async fn shutdown(self) {
        for helper in &self.helpers {
            helper.abort();
        }
        self.sender.send(Signal::Shutdown);
        if let Err(e) = self.main.await {
            debug!(error = %e, "monitor loop ended abnormally");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

impl SyncMonitor {
    /// Start the monitor. `signals` must be the receiving half of the
    /// channel the engine and its tracker send to.
    pub fn spawn(engine: Arc<SyncEngine>, signals: SignalReceiver, config: SyncConfig) -> MonitorHandle {
        let sender = engine.signals().clone();
        let helpers = vec![
            tokio::spawn(Self::probe_connectivity(
                Arc::clone(&engine),
                config.probe_interval,
            )),
            tokio::spawn(Self::watch_marker(Arc::clone(&engine), config.marker_poll)),
        ];
        let monitor = SyncMonitor {
            engine,
            signals,
            config,
        };
        MonitorHandle {
            sender,
            main: tokio::spawn(monitor.run()),
            helpers,
        }
    }

    fn launch(&self, reason: &'static str) {
        debug!(reason, "starting sync pass");
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move { engine.sync_in_background().await });
    }

    async fn run(mut self) {
        let mut debounce: Option<Instant> = None;
        let mut retry: Option<Instant> = None;
        let mut periodic = time::interval_at(
            Instant::now() + self.config.periodic_interval,
            self.config.periodic_interval,
        );
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                signal = self.signals.recv() => {
                    let Some(signal) = signal else { break };
                    match signal {
                        Signal::ChangesMarked | Signal::SyncRequested => {
                            debounce = Some(Instant::now() + self.config.debounce);
                        }
                        Signal::Online => {
                            if !self.engine.set_online(true) {
                                info!("connectivity restored");
                            }
                            debounce = None;
                            retry = None;
                            self.launch("online");
                        }
                        Signal::Offline => {
                            if self.engine.set_online(false) {
                                info!("connectivity lost");
                            }
                            debounce = None;
                            retry = None;
                        }
                        Signal::RetryLater => {
                            retry = Some(Instant::now() + self.config.retry_backoff);
                        }
                        Signal::Shutdown => break,
                    }
                }
                () = sleep_until(debounce) => {
                    debounce = None;
                    if self.engine.is_online() {
                        self.launch("debounce");
                    }
                }
                () = sleep_until(retry) => {
                    retry = None;
                    if self.engine.is_online() {
                        self.launch("retry");
                    }
                }
                _ = periodic.tick() => {
                    if self.engine.is_online() {
                        self.launch("periodic");
                    }
                }
            }
        }
        debug!("sync monitor stopped");
    }

    async fn probe_connectivity(engine: Arc<SyncEngine>, every: Duration) {
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = engine.probe().await;
            if reachable != engine.is_online() {
                let signal = if reachable {
                    Signal::Online
                } else {
                    Signal::Offline
                };
                engine.signals().send(signal);
            }
        }
    }

    async fn watch_marker(engine: Arc<SyncEngine>, every: Duration) {
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if engine.tracker().foreign_change() {
                engine.tracker().note_external();
            }
        }
    }
}

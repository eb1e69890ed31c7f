//! Background delivery of due commands.
//!
//! Commands scheduled for later are not delivered by `schedule`; the poller
//! calls `deliver_due` on a fixed interval until it is shut down. Each pass
//! resolves a new scheduler, so it runs the interceptors registered so far.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use chronicle_events::EventSourced;

use super::configuration::SchedulerResolver;

/// Poller runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerStats {
    pub polls: u64,
    pub delivered: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running poller.
#[derive(Debug)]
pub struct DueCommandPollerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<PollerStats>>,
}

impl DueCommandPollerHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct DueCommandPoller<A: EventSourced> {
    resolver: SchedulerResolver<A>,
    interval: Duration,
}

impl<A: EventSourced> DueCommandPoller<A> {
    pub fn new(resolver: SchedulerResolver<A>, interval: Duration) -> Self {
        Self { resolver, interval }
    }

    /// Spawn the poller on the current tokio runtime.
    pub fn spawn(self) -> DueCommandPollerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(PollerStats::default()));
        let join = tokio::spawn(poll_loop(self, shutdown_rx, Arc::clone(&stats)));

        DueCommandPollerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

async fn poll_loop<A: EventSourced>(
    poller: DueCommandPoller<A>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<PollerStats>>,
) {
    let name = poller.resolver.settings().scheduler_name.clone();
    info!(scheduler = %name, interval_ms = poller.interval.as_millis() as u64, "due command poller started");
    let started = Instant::now();
    let mut ticker = tokio::time::interval(poller.interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let outcome = poller.resolver.resolve().deliver_due().await;

        if let Ok(mut s) = stats.lock() {
            s.polls += 1;
            s.uptime_secs = started.elapsed().as_secs();
            match &outcome {
                Ok(report) => {
                    s.delivered += report.delivered as u64;
                    s.succeeded += report.succeeded as u64;
                    s.failed += report.failed as u64;
                    s.errors += report.errored as u64;
                }
                Err(_) => s.errors += 1,
            }
        }

        if let Err(e) = outcome {
            error!(scheduler = %name, error = %e, "due command poll failed");
        }
    }

    info!(scheduler = %name, "due command poller stopped");
}

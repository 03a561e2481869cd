//! Dedicated driver thread: periodic polling plus an event trigger.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Outcome of one claim cycle, as seen by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub claim_failed: bool,
}

/// Handle to the running driver (notify + shutdown).
#[derive(Debug)]
pub struct DriverHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl DriverHandle {
    /// Spawn the driver loop.
    ///
    /// - Schedule: runs `cycle` every `poll_interval`
    /// - Event-trigger: `notify()` runs a cycle right away
    /// - Claim failures back off exponentially and never stop the loop
    /// - Shutdown: the loop exits, then `on_shutdown` runs on the driver thread
    pub(crate) fn spawn<C, F>(
        name: String,
        poll_interval: Duration,
        cycle: C,
        on_shutdown: F,
    ) -> std::io::Result<Self>
    where
        C: FnMut() -> CycleReport + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let thread_name = name.clone();
        let join = thread::Builder::new().name(thread_name).spawn(move || {
            driver_loop(&name, poll_interval, shutdown_rx, trigger_rx, cycle);
            on_shutdown();
        })?;

        Ok(Self {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        })
    }

    /// Request a cycle as soon as possible, e.g. right after creating an object.
    ///
    /// Triggers coalesce: while one is pending, further calls are no-ops.
    pub fn notify(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop the driver and the engine it drives, waiting for in-flight work to drain.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        // Wake the loop if it is waiting for a trigger.
        let _ = self.trigger.try_send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn driver_loop<C>(
    name: &str,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    mut cycle: C,
) where
    C: FnMut() -> CycleReport,
{
    info!(driver = name, poll_interval_ms = poll_interval.as_millis() as u64, "driver started");

    let mut next_tick = Instant::now();
    let mut failures: u32 = 0;

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            let report = cycle();
            if report.claim_failed {
                failures += 1;
                let wait = backoff(poll_interval, failures);
                warn!(driver = name, failures, backoff_ms = wait.as_millis() as u64, "claim cycle failed");
                next_tick = Instant::now() + wait;
            } else {
                failures = 0;
                // More work is likely waiting when a cycle claimed something.
                next_tick = if report.claimed > 0 {
                    Instant::now()
                } else {
                    Instant::now() + poll_interval
                };
            }
            if report.claimed > 0 {
                // Let the pool make progress before claiming again.
                thread::sleep(Duration::from_millis(1));
            }
            continue;
        }

        match trigger_rx.recv_timeout(next_tick.saturating_duration_since(now)) {
            Ok(()) => {
                if failures == 0 {
                    next_tick = Instant::now();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(driver = name, "driver stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    // Exponential backoff: base * 2^(attempt-1), capped at one minute.
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(u128::from(pow));
    Duration::from_millis(ms.min(60_000) as u64)
}

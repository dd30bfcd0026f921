//! Fire-duration task and background fault reporting.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ujlaser_core::error::LaserError;
use ujlaser_core::keywords;
use ujlaser_core::status::StatusWord;

use crate::controller::ControllerInner;

/// How a fire sequence ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Ran for its full duration and the device reported the laser inactive.
    Completed,
    /// Stopped by `emergency_stop()` or `disarm()`.
    Aborted,
}

/// Fault raised by a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireFault {
    /// The laser went inactive before the sequence duration elapsed.
    LaserUnexpectedlyOff {
        /// Status word that showed the laser inactive.
        status: StatusWord,
    },
    /// The laser was still active after the grace period; `FL 0` was sent.
    FireDidNotStop,
    /// The link failed while the sequence was being supervised.
    Link(String),
}

impl From<FireFault> for LaserError {
    fn from(fault: FireFault) -> Self {
        match fault {
            FireFault::LaserUnexpectedlyOff { status } => {
                LaserError::LaserUnexpectedlyOff { status }
            }
            FireFault::FireDidNotStop => LaserError::FireDidNotStop,
            FireFault::Link(message) => LaserError::Io(io::Error::new(io::ErrorKind::Other, message)),
        }
    }
}

/// Last background fault plus a broadcast of every fault.
pub(crate) struct FaultLog {
    last: Mutex<Option<FireFault>>,
    tx: broadcast::Sender<FireFault>,
}

impl FaultLog {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            last: Mutex::new(None),
            tx,
        }
    }

    pub(crate) fn record(&self, fault: FireFault) {
        warn!(?fault, "background fault");
        *self.last.lock() = Some(fault.clone());
        // No subscribers is fine.
        let _ = self.tx.send(fault);
    }

    pub(crate) fn take(&self) -> Option<FireFault> {
        self.last.lock().take()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<FireFault> {
        self.tx.subscribe()
    }
}

enum Poll {
    Status(StatusWord),
    Missed,
}

async fn poll(inner: &ControllerInner) -> Result<Poll, FireFault> {
    match inner.query_status().await {
        Ok(status) => Ok(Poll::Status(status)),
        Err(LaserError::NoResponse { .. }) => {
            warn!("status poll timed out during fire");
            Ok(Poll::Missed)
        }
        Err(e) => Err(FireFault::Link(e.to_string())),
    }
}

/// Supervise one fire sequence.
///
/// `started` is taken just before `FL 1` went out, so the local deadline is
/// never later than the device's. Until the deadline every poll must show the
/// laser active; afterwards the task waits up to the completion grace for the
/// device to report it inactive.
pub(crate) async fn supervise(
    inner: &ControllerInner,
    started: Instant,
    duration: Duration,
) -> Result<FireOutcome, FireFault> {
    let timing = &inner.config.timing;
    let deadline = started + duration;
    let aborted = || inner.stop_requested.load(Ordering::SeqCst);

    loop {
        let next = Instant::now() + timing.fire_poll_interval;
        if next >= deadline {
            tokio::time::sleep_until(deadline).await;
            break;
        }
        tokio::time::sleep_until(next).await;

        if aborted() {
            info!("fire aborted");
            return Ok(FireOutcome::Aborted);
        }
        let status = match poll(inner).await? {
            Poll::Status(status) => status,
            Poll::Missed => continue,
        };
        // A stop may have gone out while the poll was waiting for the lock.
        if aborted() {
            info!("fire aborted");
            return Ok(FireOutcome::Aborted);
        }
        if !status.laser_active {
            // The poll may have waited on the link past the deadline.
            if Instant::now() >= deadline {
                info!(?duration, "fire complete");
                return Ok(FireOutcome::Completed);
            }
            return Err(FireFault::LaserUnexpectedlyOff { status });
        }
    }

    let grace_deadline = deadline + timing.fire_completion_grace;
    loop {
        if aborted() {
            info!("fire aborted");
            return Ok(FireOutcome::Aborted);
        }
        if let Poll::Status(status) = poll(inner).await? {
            if !status.laser_active {
                info!(?duration, "fire complete");
                return Ok(FireOutcome::Completed);
            }
            debug!("laser still active after fire duration");
        }
        if Instant::now() >= grace_deadline {
            if let Err(e) = inner.command(keywords::FIRE, Some("0")).await {
                warn!(error = %e, "FL 0 after overrun failed");
            }
            return Err(FireFault::FireDidNotStop);
        }
        tokio::time::sleep(timing.fire_poll_interval).await;
    }
}

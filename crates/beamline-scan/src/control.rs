//! Cooperative pause, abort and halt of a running scan.
//!
//! The queue manager holds one [`ScanControl`] per entry and flips it; the
//! scan observes it only at suspension points (every stub entry and every
//! engine-side wait). Device operations already in flight are never torn
//! down mid-way.
//!
//! A deferred pause is only honoured at point boundaries, which step scans
//! pass between two points. Fly scans have none and run to their end.

use beamline_core::{ScanError, ScanResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How a scan was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Stop and unwind, returning motors to their start positions if configured
    Abort,
    /// Stop and unwind, leaving motors where they are
    Halt,
}

struct ControlState {
    cancel: CancellationToken,
    stop: Mutex<Option<StopKind>>,
    paused: watch::Sender<bool>,
    deferred: AtomicBool,
}

/// Shared control handle of one scan.
#[derive(Clone)]
pub struct ScanControl {
    state: Arc<ControlState>,
}

impl Default for ScanControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanControl {
    /// Running, unpaused control.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(ControlState {
                cancel: CancellationToken::new(),
                stop: Mutex::new(None),
                paused,
                deferred: AtomicBool::new(false),
            }),
        }
    }

    /// Ask the scan to stop at its next suspension point.
    ///
    /// A halt overrides an earlier abort; the reverse does not.
    pub fn request_stop(&self, kind: StopKind) {
        {
            let mut stop = self.state.stop.lock();
            if *stop != Some(StopKind::Halt) {
                *stop = Some(kind);
            }
        }
        info!(?kind, "scan stop requested");
        self.state.cancel.cancel();
    }

    /// How the scan was asked to stop, if it was.
    pub fn stop_kind(&self) -> Option<StopKind> {
        *self.state.stop.lock()
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Resolves once a stop is requested.
    pub async fn cancelled(&self) {
        self.state.cancel.cancelled().await;
    }

    /// Park the scan at its next suspension point.
    pub fn pause(&self) {
        self.state.paused.send_replace(true);
    }

    /// Park the scan once it finishes its current point.
    pub fn defer_pause(&self) {
        if !self.is_paused() {
            self.state.deferred.store(true, Ordering::SeqCst);
        }
    }

    /// Let a parked scan continue; also drops a deferred pause.
    pub fn resume(&self) {
        self.state.deferred.store(false, Ordering::SeqCst);
        self.state.paused.send_replace(false);
    }

    /// Whether the scan is asked to park.
    pub fn is_paused(&self) -> bool {
        *self.state.paused.borrow()
    }

    /// Whether a deferred pause waits for the next point boundary.
    pub fn is_pause_deferred(&self) -> bool {
        self.state.deferred.load(Ordering::SeqCst)
    }

    /// Resolves once the scan is asked to park.
    pub async fn parked(&self) {
        let mut rx = self.state.paused.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|paused| *paused).await;
    }

    /// The error a stopped scan unwinds with.
    pub fn stop_error(&self) -> ScanError {
        match self.stop_kind() {
            Some(StopKind::Halt) => ScanError::cancelled("halted"),
            _ => ScanError::cancelled("aborted"),
        }
    }

    /// Suspension point: fail if stopped, wait while paused.
    ///
    /// # Errors
    /// `Cancelled` once a stop was requested, also while parked.
    pub async fn checkpoint(&self) -> ScanResult<()> {
        if self.is_cancelled() {
            return Err(self.stop_error());
        }
        let mut rx = self.state.paused.subscribe();
        let parked = *rx.borrow_and_update();
        if parked {
            info!("scan parked");
            let resumed = async { rx.wait_for(|paused| !*paused).await.map(|_| ()) };
            tokio::select! {
                _ = self.state.cancel.cancelled() => return Err(self.stop_error()),
                result = resumed => {
                    result.map_err(|_| ScanError::EngineFault("scan control dropped".into()))?;
                }
            }
            info!("scan resumed");
        }
        if self.is_cancelled() {
            return Err(self.stop_error());
        }
        Ok(())
    }

    /// Suspension point between two points: a deferred pause turns into a
    /// pause here.
    ///
    /// # Errors
    /// As [`ScanControl::checkpoint`].
    pub async fn point_boundary(&self) -> ScanResult<()> {
        if self.state.deferred.swap(false, Ordering::SeqCst) {
            info!("deferred pause reached");
            self.pause();
        }
        self.checkpoint().await
    }
}

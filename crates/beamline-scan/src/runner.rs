//! Drives one scan through its lifecycle and guarantees the unwind.
//!
//! Whatever happens in the scan body (success, device failure, abort,
//! halt), the runner shields the stubs from further cancellation, then
//! finalizes and unstages before reporting the outcome. A scan that fails
//! while preparing its positions has touched nothing and skips the unwind.

use crate::control::StopKind;
use crate::scan::{Scan, ScanContext};
use crate::state::{ScanState, ScanStateMachine};
use beamline_core::{
    now_ns, EntryState, RequestId, ScanError, ScanPhase, ScanResult, ScanStatus,
};
use tracing::{info, instrument, warn};

/// How a scan ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Every point acquired
    Completed,
    /// Stopped on request
    Aborted {
        /// Stopped by halt rather than abort
        halted: bool,
    },
    /// Stopped by an error
    Failed(ScanError),
}

impl ScanOutcome {
    fn from_error(error: Option<ScanError>, stop: Option<StopKind>) -> Self {
        match error {
            None => ScanOutcome::Completed,
            Some(err) if err.is_cancellation() => ScanOutcome::Aborted {
                halted: stop == Some(StopKind::Halt),
            },
            Some(err) => ScanOutcome::Failed(err),
        }
    }

    /// Queue entry state for this outcome.
    pub fn entry_state(&self) -> EntryState {
        match self {
            ScanOutcome::Completed => EntryState::Completed,
            ScanOutcome::Aborted { .. } => EntryState::Aborted,
            ScanOutcome::Failed(_) => EntryState::Failed,
        }
    }

    /// Phase reported in the closing scan status.
    pub fn phase(&self) -> ScanPhase {
        match self {
            ScanOutcome::Completed => ScanPhase::Closed,
            ScanOutcome::Aborted { halted: false } => ScanPhase::Aborted,
            ScanOutcome::Aborted { halted: true } => ScanPhase::Halted,
            ScanOutcome::Failed(_) => ScanPhase::Failed,
        }
    }

    /// The error of a failed scan.
    pub fn error(&self) -> Option<&ScanError> {
        match self {
            ScanOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Result of running a scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Scan RID
    pub rid: RequestId,
    /// How it ended
    pub outcome: ScanOutcome,
    /// States visited, in order
    pub states: Vec<ScanState>,
    /// Points emitted
    pub points: u64,
    /// Unstage failures, logged but not fatal on the unwind path
    pub unstage_errors: Vec<ScanError>,
}

impl ScanReport {
    /// Report of a scan that could not even be built.
    pub fn rejected(rid: RequestId, error: ScanError) -> Self {
        Self {
            rid,
            outcome: ScanOutcome::Failed(error),
            states: vec![ScanState::Created, ScanState::Failed],
            points: 0,
            unstage_errors: Vec::new(),
        }
    }
}

/// Opening or closing status of a scan.
pub fn scan_status(
    scan: &dyn Scan,
    ctx: &ScanContext,
    phase: ScanPhase,
    num_points: u64,
) -> ScanStatus {
    ScanStatus {
        rid: ctx.rid().clone(),
        scan_type: scan.scan_type().to_string(),
        category: scan.category(),
        phase,
        num_points,
        scan_motors: scan.scan_motors().to_vec(),
        readout_priority: scan.readout_groups(ctx),
        monitor_sync: scan.monitor_sync(),
        scan_number: ctx.scan_number,
        metadata: ctx.request.metadata.clone(),
        timestamp_ns: now_ns(),
    }
}

async fn run_body(
    scan: &mut dyn Scan,
    ctx: &mut ScanContext,
    machine: &mut ScanStateMachine,
) -> ScanResult<()> {
    ctx.stubs.checkpoint().await?;
    scan.prepare_positions(ctx).await?;
    machine.advance(ScanState::Prepared)?;

    ctx.stubs.scan_report_instructions(scan.report_instructions());
    let status = scan_status(scan, ctx, ScanPhase::Open, scan.num_points());
    ctx.stubs.open_scan(status);

    scan.stage(ctx).await?;
    machine.advance(ScanState::Staged)?;
    scan.baseline_reading(ctx).await?;
    machine.advance(ScanState::BaselineRead)?;
    scan.pre_scan(ctx).await?;
    machine.advance(ScanState::Running)?;
    scan.scan_core(ctx).await
}

fn advance(machine: &mut ScanStateMachine, next: ScanState, error: &mut Option<ScanError>) {
    if let Err(err) = machine.advance(next) {
        warn!(error = %err, "scan state machine rejected transition");
        error.get_or_insert(err);
    }
}

/// Record the terminal state matching `outcome`.
fn settle(machine: &mut ScanStateMachine, outcome: &ScanOutcome) {
    let last = match outcome {
        ScanOutcome::Completed => ScanState::CleanedUp,
        ScanOutcome::Aborted { .. } => ScanState::Aborted,
        ScanOutcome::Failed(_) => ScanState::Failed,
    };
    if let Err(err) = machine.advance(last) {
        warn!(error = %err, "could not record final scan state");
    }
}

/// Run `scan` to its end.
///
/// Never fails: errors end up in the report's outcome.
#[instrument(skip_all, fields(rid = %ctx.rid(), scan_type = %scan.scan_type()))]
pub async fn run_scan(mut scan: Box<dyn Scan>, mut ctx: ScanContext) -> ScanReport {
    let mut machine = ScanStateMachine::new();
    let body = run_body(scan.as_mut(), &mut ctx, &mut machine).await;

    if machine.state() == ScanState::Created {
        let error = body
            .err()
            .unwrap_or_else(|| ScanError::EngineFault("scan ended before preparing".into()));
        let outcome = ScanOutcome::from_error(Some(error), ctx.stubs.stop_kind());
        warn!(outcome = ?outcome, "scan rejected before moving anything");
        settle(&mut machine, &outcome);
        ctx.stubs.retire();
        return ScanReport {
            rid: ctx.rid().clone(),
            outcome,
            states: machine.history().to_vec(),
            points: 0,
            unstage_errors: Vec::new(),
        };
    }

    let unwinding = body.is_err();
    let mut error = body.err();
    match &error {
        Some(err) if err.is_cancellation() => info!(reason = %err, "scan stopping"),
        Some(err) => warn!(error = %err, state = %machine.state(), "scan failed, unwinding"),
        None => {}
    }

    ctx.stubs.shield();
    advance(&mut machine, ScanState::Finalizing, &mut error);
    if let Err(err) = scan.finalize(&mut ctx, unwinding).await {
        warn!(error = %err, "finalize failed");
        error.get_or_insert(err);
    }

    advance(&mut machine, ScanState::Unstaged, &mut error);
    let unstage_errors = scan.unstage(&mut ctx).await;
    if let Some(first) = unstage_errors.first() {
        error.get_or_insert_with(|| first.clone());
    }

    let outcome = ScanOutcome::from_error(error, ctx.stubs.stop_kind());
    let points = ctx.points.emitted();
    let status = scan_status(scan.as_ref(), &ctx, outcome.phase(), points);
    ctx.stubs.close_scan(status);
    settle(&mut machine, &outcome);
    ctx.stubs.retire();

    info!(outcome = ?outcome, points, "scan finished");
    ScanReport {
        rid: ctx.rid().clone(),
        outcome,
        states: machine.history().to_vec(),
        points,
        unstage_errors,
    }
}

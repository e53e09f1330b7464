//! Device coordination primitives used by scan implementations.
//!
//! Every instruction follows the same path:
//!
//! 1. pass a suspension point (unless the scan is shielded for unwinding)
//! 2. allocate a DIID and register it with the [`InstructionCorrelator`]
//! 3. publish the [`DeviceInstruction`] on the bus
//! 4. hand the device call to a forwarding task, which publishes the
//!    readings (for reads) and the [`DeviceAck`] and resolves the waiter
//!
//! The caller gets a [`PendingInstruction`] back and decides when to wait
//! for it. The blocking helpers (`move_and_wait`, `read_and_wait`, ...) retry
//! a timed out call according to the engine's [`RetryPolicy`].

use crate::control::{ScanControl, StopKind};
use crate::correlator::{AckPayload, InstructionCorrelator, PendingAck, Resolution, WaitError};
use beamline_core::{
    readings_stream, retry_on_timeout, BusMessage, DeviceAck, DeviceInstruction,
    DeviceInstructionId, DeviceStatus, EngineConfig, FlyProgress, InstructionAction,
    InstructionCounter, MessageBus, PointId, ProgressUpdate, ReadingMap, ReadingUpdate,
    ReadoutStream, ReportInstruction, ReportInstructions, RequestId, RetryPolicy, ScanError,
    ScanResult, ScanStatus, StatusError,
};
use beamline_hardware::{DeviceRegistry, StagingLedger};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Timeouts and retries applied by the stubs.
#[derive(Debug, Clone, PartialEq)]
pub struct StubSettings {
    /// Moves, triggers, reads, kickoff, rpc
    pub device_timeout: Duration,
    /// Stage and unstage
    pub stage_timeout: Duration,
    /// Flyer completion
    pub complete_timeout: Duration,
    /// Retries of timed out moves and reads
    pub retry: RetryPolicy,
}

impl From<&EngineConfig> for StubSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            device_timeout: config.device_timeout,
            stage_timeout: config.stage_timeout,
            complete_timeout: config.complete_timeout,
            retry: config.retry_policy(),
        }
    }
}

impl Default for StubSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Shared engine services a scan's stubs talk to.
#[derive(Clone)]
pub struct StubWiring {
    /// Devices
    pub registry: Arc<DeviceRegistry>,
    /// Transport
    pub bus: Arc<dyn MessageBus>,
    /// DIID bookkeeping
    pub correlator: Arc<InstructionCorrelator>,
    /// Staging exclusivity across queues
    pub ledger: Arc<StagingLedger>,
}

/// An issued device instruction awaiting its acknowledgement.
#[derive(Debug)]
pub struct PendingInstruction {
    device: String,
    action: InstructionAction,
    timeout: Duration,
    ack: PendingAck,
    correlator: Arc<InstructionCorrelator>,
}

impl PendingInstruction {
    /// Instruction id.
    pub fn diid(&self) -> DeviceInstructionId {
        self.ack.diid()
    }

    /// Target device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Wait for the acknowledgement.
    ///
    /// # Errors
    /// `DeviceTimeout` if nothing arrived in time, the device's failure
    /// otherwise.
    pub async fn wait(self) -> ScanResult<AckPayload> {
        let PendingInstruction {
            device,
            action,
            timeout,
            ack,
            correlator,
        } = self;
        let rid = ack.rid().clone();
        let diid = ack.diid();
        match ack.wait(timeout).await {
            Ok(Resolution {
                ack,
                payload,
                error,
            }) => {
                if ack.success {
                    return Ok(payload);
                }
                Err(error.unwrap_or_else(|| ScanError::DeviceError {
                    device,
                    operation: action.as_str().to_string(),
                    message: ack
                        .error
                        .unwrap_or_else(|| "device reported failure".to_string()),
                }))
            }
            Err(WaitError::TimedOut) => {
                correlator.withdraw(&rid, diid);
                warn!(%rid, %diid, device = %device, action = action.as_str(), ?timeout, "device instruction timed out");
                Err(ScanError::DeviceTimeout {
                    device,
                    operation: action.as_str().to_string(),
                    timeout,
                })
            }
            Err(WaitError::Withdrawn) => Err(ScanError::EngineFault(format!(
                "instruction {diid} on '{device}' was withdrawn before its acknowledgement"
            ))),
        }
    }
}

/// Wait for a batch of instructions; every one is awaited, the first error wins.
///
/// # Errors
/// The first failure in issue order.
pub async fn wait_all(pending: Vec<PendingInstruction>) -> ScanResult<Vec<AckPayload>> {
    join_all(pending.into_iter().map(PendingInstruction::wait))
        .await
        .into_iter()
        .collect()
}

/// Readings in flight, as returned by [`ScanStubs::read`].
#[derive(Debug, Default)]
pub struct PendingReads {
    reads: Vec<PendingInstruction>,
}

impl PendingReads {
    /// Number of devices being read.
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    /// True if nothing is being read.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Wait for every read and collect the values per device.
    ///
    /// # Errors
    /// The first failed read.
    pub async fn wait(self) -> ScanResult<HashMap<String, ReadingMap>> {
        let devices: Vec<String> = self.reads.iter().map(|r| r.device.clone()).collect();
        let payloads = wait_all(self.reads).await?;
        Ok(devices
            .into_iter()
            .zip(payloads)
            .map(|(device, payload)| match payload {
                AckPayload::Readings(values) => (device, values),
                _ => (device, ReadingMap::new()),
            })
            .collect())
    }
}

/// Coordination primitives of one scan.
pub struct ScanStubs {
    rid: RequestId,
    wiring: StubWiring,
    control: ScanControl,
    settings: StubSettings,
    diids: InstructionCounter,
    shielded: AtomicBool,
    staged: Mutex<Vec<String>>,
    unsettled_stages: Mutex<HashMap<String, JoinHandle<()>>>,
    responses: Mutex<HashMap<DeviceInstructionId, PendingInstruction>>,
}

impl ScanStubs {
    /// Stubs for scan `rid`.
    pub fn new(
        rid: RequestId,
        wiring: StubWiring,
        control: ScanControl,
        settings: StubSettings,
    ) -> Self {
        Self {
            rid,
            wiring,
            control,
            settings,
            diids: InstructionCounter::new(),
            shielded: AtomicBool::new(false),
            staged: Mutex::new(Vec::new()),
            unsettled_stages: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
        }
    }

    /// Scan RID.
    pub fn rid(&self) -> &RequestId {
        &self.rid
    }

    /// Control handle of the scan.
    pub fn control(&self) -> &ScanControl {
        &self.control
    }

    /// Timeouts and retries in effect.
    pub fn settings(&self) -> &StubSettings {
        &self.settings
    }

    /// How the scan was asked to stop, if it was.
    pub fn stop_kind(&self) -> Option<StopKind> {
        self.control.stop_kind()
    }

    /// Number of DIIDs allocated so far.
    pub fn instructions_issued(&self) -> u64 {
        self.diids.issued()
    }

    /// Stop observing pause and abort; used while unwinding.
    pub fn shield(&self) {
        self.shielded.store(true, Ordering::SeqCst);
    }

    /// Whether the stubs ignore pause and abort.
    pub fn is_shielded(&self) -> bool {
        self.shielded.load(Ordering::SeqCst)
    }

    /// Drop all bookkeeping of this scan: correlator records and any
    /// ledger claims still held.
    pub fn retire(&self) {
        let leaked = self.wiring.ledger.release_all(&self.rid);
        if !leaked.is_empty() {
            warn!(rid = %self.rid, devices = ?leaked, "released claims left after unstage");
        }
        self.wiring.correlator.retire(&self.rid);
    }

    /// Suspension point.
    ///
    /// # Errors
    /// `Cancelled` once the scan was asked to stop, unless shielded.
    pub async fn checkpoint(&self) -> ScanResult<()> {
        if self.is_shielded() {
            return Ok(());
        }
        self.control.checkpoint().await
    }

    /// Suspension point between two points; honours a deferred pause.
    ///
    /// # Errors
    /// As [`ScanStubs::checkpoint`].
    pub async fn point_boundary(&self) -> ScanResult<()> {
        if self.is_shielded() {
            return Ok(());
        }
        self.control.point_boundary().await
    }

    // =========================================================================
    // Instruction Plumbing
    // =========================================================================

    fn issue(
        &self,
        device: &str,
        action: InstructionAction,
        parameter: Value,
        point_id: Option<PointId>,
        timeout: Duration,
    ) -> ScanResult<PendingInstruction> {
        let diid = self.diids.next_id();
        let ack = self
            .wiring
            .correlator
            .register(&self.rid, diid, device, action)?;
        self.wiring
            .bus
            .publish(BusMessage::DeviceInstruction(DeviceInstruction {
                rid: self.rid.clone(),
                diid,
                device: device.to_string(),
                action,
                parameter,
                point_id,
            }));
        debug!(rid = %self.rid, %diid, device, action = action.as_str(), "device instruction issued");
        Ok(PendingInstruction {
            device: device.to_string(),
            action,
            timeout,
            ack,
            correlator: self.wiring.correlator.clone(),
        })
    }

    /// Run `work` in a forwarding task that acknowledges `pending` when done.
    ///
    /// Readings of a read are published (and appended to the scan's readings
    /// stream) before the acknowledgement, and only while the instruction is
    /// still outstanding.
    fn dispatch<F>(
        &self,
        pending: &PendingInstruction,
        read: Option<(ReadoutStream, Option<PointId>)>,
        work: F,
    ) where
        F: Future<Output = ScanResult<AckPayload>> + Send + 'static,
    {
        let _detached = self.forward(pending, read, work);
    }

    /// [`ScanStubs::dispatch`], keeping a handle on the forwarding task.
    ///
    /// The task ends at the latest twice the instruction's timeout after it
    /// started, whether or not the device answered.
    fn forward<F>(
        &self,
        pending: &PendingInstruction,
        read: Option<(ReadoutStream, Option<PointId>)>,
        work: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ScanResult<AckPayload>> + Send + 'static,
    {
        let rid = self.rid.clone();
        let diid = pending.diid();
        let device = pending.device.clone();
        let action = pending.action;
        let grace = pending.timeout.saturating_mul(2);
        let bus = self.wiring.bus.clone();
        let correlator = self.wiring.correlator.clone();

        let changes_staging = matches!(action, InstructionAction::Stage | InstructionAction::Unstage);

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(grace, work).await {
                Ok(outcome) => outcome,
                Err(_) if changes_staging => {
                    warn!(%rid, %diid, device = %device, action = action.as_str(), "staging call abandoned, device state unknown");
                    return;
                }
                Err(_) => {
                    debug!(%rid, %diid, device = %device, "device call abandoned");
                    return;
                }
            };
            if !correlator.is_outstanding(&rid, diid) {
                if changes_staging {
                    warn!(%rid, %diid, device = %device, action = action.as_str(), ok = outcome.is_ok(), "late staging result dropped");
                } else {
                    debug!(%rid, %diid, device = %device, "late device result dropped");
                }
                return;
            }
            let (ack, payload, error) = match outcome {
                Ok(payload) => (
                    DeviceAck::success(rid.clone(), diid, device.clone(), action),
                    payload,
                    None,
                ),
                Err(err) => (
                    DeviceAck::failure(rid.clone(), diid, device.clone(), action, err.to_string()),
                    AckPayload::None,
                    Some(err),
                ),
            };
            if let (Some((stream, point_id)), AckPayload::Readings(values)) = (read, &payload) {
                let update = BusMessage::Reading(ReadingUpdate {
                    rid: rid.clone(),
                    diid: Some(diid),
                    point_id,
                    stream,
                    device: device.clone(),
                    values: values.clone(),
                });
                bus.append(&readings_stream(&rid), update.clone());
                bus.publish(update);
            }
            correlator.resolve(ack.clone(), payload, error);
            bus.publish(BusMessage::DeviceAck(ack));
        })
    }

    // =========================================================================
    // Scan Lifecycle Messages
    // =========================================================================

    /// Publish the scan's opening status.
    pub fn open_scan(&self, status: ScanStatus) {
        info!(rid = %self.rid, scan_type = %status.scan_type, num_points = status.num_points, "scan opened");
        self.wiring.bus.publish(BusMessage::ScanStatus(status));
    }

    /// Publish the scan's closing status.
    pub fn close_scan(&self, status: ScanStatus) {
        info!(rid = %self.rid, phase = ?status.phase, num_points = status.num_points, "scan closed");
        self.wiring.bus.publish(BusMessage::ScanStatus(status));
    }

    /// Publish how clients should visualize progress.
    pub fn scan_report_instructions(&self, instructions: Vec<ReportInstruction>) {
        self.wiring
            .bus
            .publish(BusMessage::ReportInstructions(ReportInstructions {
                rid: self.rid.clone(),
                instructions,
            }));
    }

    /// Publish acquisition progress of the scan or of a device.
    pub fn publish_progress(&self, device: Option<&str>, value: u64, max: u64, done: bool) {
        self.wiring.bus.publish(BusMessage::Progress(ProgressUpdate {
            rid: self.rid.clone(),
            device: device.map(str::to_string),
            value,
            max,
            done,
        }));
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Devices currently staged by this scan, in staging order.
    pub fn staged_devices(&self) -> Vec<String> {
        self.staged.lock().clone()
    }

    /// Whether this scan staged `device`.
    pub fn is_staged(&self, device: &str) -> bool {
        self.staged.lock().iter().any(|d| d == device)
    }

    /// Stage one device.
    ///
    /// # Errors
    /// See [`ScanStubs::stage_all`].
    pub async fn stage(&self, device: &str) -> ScanResult<()> {
        self.stage_all(&[device.to_string()]).await
    }

    /// Stage several devices concurrently.
    ///
    /// Repeated names are staged once. All devices are claimed in the
    /// staging ledger first; if any is held by another scan nothing is
    /// staged. Devices whose stage fails are released again; the others
    /// stay staged for the unwind to undo. A device whose stage timed out
    /// may still finish staging, so it is kept as staged too.
    ///
    /// # Errors
    /// `AlreadyStaged`, `UnknownDevice`, or the first device failure.
    #[instrument(skip_all, fields(rid = %self.rid, devices = devices.len()))]
    pub async fn stage_all(&self, devices: &[String]) -> ScanResult<()> {
        self.checkpoint().await?;
        let mut unique: Vec<String> = Vec::with_capacity(devices.len());
        for name in devices {
            if !unique.contains(name) {
                unique.push(name.clone());
            }
        }
        let devices = unique.as_slice();
        if devices.is_empty() {
            return Ok(());
        }
        let handles = devices
            .iter()
            .map(|name| self.wiring.registry.device(name))
            .collect::<ScanResult<Vec<_>>>()?;
        self.wiring.ledger.claim_all(devices, &self.rid)?;

        let mut issued = Vec::with_capacity(devices.len());
        let mut first_error = None;
        for (index, (name, device)) in devices.iter().zip(handles).enumerate() {
            let pending = match self.issue(
                name,
                InstructionAction::Stage,
                Value::Null,
                None,
                self.settings.stage_timeout,
            ) {
                Ok(pending) => pending,
                Err(err) => {
                    for unissued in &devices[index..] {
                        self.wiring.ledger.release(unissued, &self.rid);
                    }
                    first_error = Some(err);
                    break;
                }
            };
            let device_name = name.clone();
            let task = self.forward(&pending, None, async move {
                device
                    .stage()
                    .await
                    .map(|_| AckPayload::None)
                    .map_err(|e| ScanError::from_device(&device_name, "stage", e))
            });
            issued.push((name.clone(), task, pending));
        }

        let (tasks, pending): (Vec<_>, Vec<_>) = issued
            .into_iter()
            .map(|(name, task, pending)| ((name, task), pending))
            .unzip();
        let results = join_all(pending.into_iter().map(PendingInstruction::wait)).await;
        for ((name, task), result) in tasks.into_iter().zip(results) {
            match result {
                Ok(_) => self.staged.lock().push(name),
                Err(err @ ScanError::DeviceTimeout { .. }) => {
                    warn!(rid = %self.rid, device = %name, "stage timed out, device kept for unstage");
                    self.unsettled_stages.lock().insert(name.clone(), task);
                    self.staged.lock().push(name);
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    self.wiring.ledger.release(&name, &self.rid);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unstage a device this scan staged. A no-op for any other device.
    ///
    /// A stage call that timed out is given time to finish first. The ledger
    /// claim is released whatever the device answers.
    ///
    /// # Errors
    /// The device's failure or timeout.
    pub async fn unstage(&self, device: &str) -> ScanResult<()> {
        {
            let mut staged = self.staged.lock();
            match staged.iter().position(|d| d == device) {
                Some(index) => {
                    staged.remove(index);
                }
                None => return Ok(()),
            }
        }
        let unsettled = self.unsettled_stages.lock().remove(device);
        if let Some(task) = unsettled {
            debug!(rid = %self.rid, device, "waiting for a timed out stage to settle");
            if let Err(err) = task.await {
                warn!(rid = %self.rid, device, error = %err, "stage task ended abnormally");
            }
        }
        let result = self.unstage_device(device).await;
        self.wiring.ledger.release(device, &self.rid);
        result
    }

    async fn unstage_device(&self, name: &str) -> ScanResult<()> {
        let device = self.wiring.registry.device(name)?;
        let pending = self.issue(
            name,
            InstructionAction::Unstage,
            Value::Null,
            None,
            self.settings.stage_timeout,
        )?;
        let device_name = name.to_string();
        self.dispatch(&pending, None, async move {
            device
                .unstage()
                .await
                .map(|_| AckPayload::None)
                .map_err(|e| ScanError::from_device(&device_name, "unstage", e))
        });
        pending.wait().await.map(|_| ())
    }

    /// Unstage everything this scan staged, in reverse staging order.
    ///
    /// Best effort: every device is attempted and every failure returned.
    pub async fn unstage_all(&self) -> Vec<ScanError> {
        let mut devices = self.staged_devices();
        devices.reverse();
        let results = join_all(devices.iter().map(|device| self.unstage(device))).await;
        let errors: Vec<ScanError> = results.into_iter().filter_map(Result::err).collect();
        for err in &errors {
            warn!(rid = %self.rid, error = %err, "unstage failed");
        }
        errors
    }

    /// Run every device's pre-scan hook.
    ///
    /// # Errors
    /// The first failure.
    pub async fn pre_scan(&self, devices: &[String]) -> ScanResult<()> {
        self.checkpoint().await?;
        let mut pending = Vec::with_capacity(devices.len());
        for name in devices {
            let device = self.wiring.registry.device(name)?;
            let instruction = self.issue(
                name,
                InstructionAction::PreScan,
                Value::Null,
                None,
                self.settings.device_timeout,
            )?;
            let device_name = name.clone();
            self.dispatch(&instruction, None, async move {
                device
                    .pre_scan()
                    .await
                    .map(|_| AckPayload::None)
                    .map_err(|e| ScanError::from_device(&device_name, "pre_scan", e))
            });
            pending.push(instruction);
        }
        wait_all(pending).await.map(|_| ())
    }

    /// Tell devices the scan is stopping early.
    ///
    /// Best effort; failures are logged and returned.
    pub async fn stop_devices(&self, devices: &[String]) -> Vec<ScanError> {
        let mut pending = Vec::with_capacity(devices.len());
        let mut errors = Vec::new();
        for name in devices {
            let device = match self.wiring.registry.device(name) {
                Ok(device) => device,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            match self.issue(
                name,
                InstructionAction::Stop,
                json!(false),
                None,
                self.settings.device_timeout,
            ) {
                Ok(instruction) => {
                    let device_name = name.clone();
                    self.dispatch(&instruction, None, async move {
                        device
                            .stop(false)
                            .await
                            .map(|_| AckPayload::None)
                            .map_err(|e| ScanError::from_device(&device_name, "stop", e))
                    });
                    pending.push(instruction);
                }
                Err(err) => errors.push(err),
            }
        }
        for result in join_all(pending.into_iter().map(PendingInstruction::wait)).await {
            if let Err(err) = result {
                warn!(rid = %self.rid, error = %err, "device stop failed");
                errors.push(err);
            }
        }
        errors
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Start moving `device` to `target` without waiting.
    ///
    /// # Errors
    /// `Cancelled`, `UnknownDevice`, `MissingCapability` or `LimitExceeded`
    /// before anything is sent.
    pub async fn set(&self, device: &str, target: f64) -> ScanResult<PendingInstruction> {
        self.checkpoint().await?;
        let positioner = self.wiring.registry.positioner(device)?;
        if let Some(limits) = positioner.limits() {
            limits.check(device, target)?;
        }
        let pending = self.issue(
            device,
            InstructionAction::Set,
            json!(target),
            None,
            self.settings.device_timeout,
        )?;
        let name = device.to_string();
        self.dispatch(&pending, None, async move {
            let status = positioner
                .move_to(target)
                .await
                .map_err(|e| ScanError::from_device(&name, "set", e))?;
            settle_status(&name, InstructionAction::Set, status).await
        });
        Ok(pending)
    }

    /// Start moving several devices at once.
    ///
    /// # Errors
    /// As [`ScanStubs::set`]; devices already started keep moving.
    pub async fn set_many(
        &self,
        devices: &[String],
        targets: &[f64],
    ) -> ScanResult<Vec<PendingInstruction>> {
        check_arity(devices, targets)?;
        let mut pending = Vec::with_capacity(devices.len());
        for (device, target) in devices.iter().zip(targets) {
            pending.push(self.set(device, *target).await?);
        }
        Ok(pending)
    }

    /// Move one device and wait, retrying a timeout once.
    ///
    /// # Errors
    /// The move's failure, or its second timeout.
    pub async fn move_and_wait(&self, device: &str, target: f64) -> ScanResult<()> {
        retry_on_timeout(&self.settings.retry, |_| async move {
            self.set(device, target).await?.wait().await.map(|_| ())
        })
        .await
    }

    /// Move several devices concurrently and wait for all of them.
    ///
    /// # Errors
    /// The first failure.
    pub async fn set_and_wait(&self, devices: &[String], targets: &[f64]) -> ScanResult<()> {
        check_arity(devices, targets)?;
        join_all(
            devices
                .iter()
                .zip(targets)
                .map(|(device, target)| self.move_and_wait(device, *target)),
        )
        .await
        .into_iter()
        .collect()
    }

    /// Wait for moves started with [`ScanStubs::set_many`].
    ///
    /// If one of them timed out the whole batch is re-issued under the
    /// remaining retry budget.
    ///
    /// # Errors
    /// The first failure.
    pub async fn finish_moves(
        &self,
        pending: Vec<PendingInstruction>,
        devices: &[String],
        targets: &[f64],
    ) -> ScanResult<()> {
        match wait_all(pending).await {
            Err(err) if err.is_retryable() && self.settings.retry.max_attempts > 0 => {
                warn!(rid = %self.rid, error = %err, "move timed out, retrying");
                if !self.settings.retry.backoff_delay.is_zero() {
                    tokio::time::sleep(self.settings.retry.backoff_delay).await;
                }
                let remaining = RetryPolicy {
                    max_attempts: self.settings.retry.max_attempts - 1,
                    ..self.settings.retry.clone()
                };
                check_arity(devices, targets)?;
                join_all(devices.iter().zip(targets).map(|(device, target)| {
                    retry_on_timeout(&remaining, move |_| async move {
                        self.set(device, *target).await?.wait().await.map(|_| ())
                    })
                }))
                .await
                .into_iter()
                .collect()
            }
            result => result.map(|_| ()),
        }
    }

    /// Start a move and remember it under its DIID.
    ///
    /// # Errors
    /// As [`ScanStubs::set`].
    pub async fn set_with_response(
        &self,
        device: &str,
        target: f64,
    ) -> ScanResult<DeviceInstructionId> {
        let pending = self.set(device, target).await?;
        let diid = pending.diid();
        self.responses.lock().insert(diid, pending);
        Ok(diid)
    }

    /// Whether the instruction has been acknowledged.
    pub fn request_is_completed(&self, diid: DeviceInstructionId) -> bool {
        self.wiring.correlator.is_completed(&self.rid, diid)
    }

    /// Wait for an instruction started with [`ScanStubs::set_with_response`].
    ///
    /// # Errors
    /// The instruction's failure, or `InvalidRequest` for an unknown DIID.
    pub async fn wait_for(&self, diid: DeviceInstructionId) -> ScanResult<()> {
        let pending = self.responses.lock().remove(&diid);
        match pending {
            Some(pending) => pending.wait().await.map(|_| ()),
            None if self.request_is_completed(diid) => Ok(()),
            None => Err(ScanError::InvalidRequest(format!(
                "no instruction {diid} was started with a response"
            ))),
        }
    }

    // =========================================================================
    // Readout
    // =========================================================================

    /// Trigger every triggerable device in `devices`; others are skipped.
    ///
    /// # Errors
    /// The first trigger failure.
    pub async fn trigger(&self, devices: &[String], point_id: Option<PointId>) -> ScanResult<()> {
        self.checkpoint().await?;
        let mut pending = Vec::new();
        for name in devices {
            let Some(triggerable) = self.wiring.registry.get_triggerable(name) else {
                continue;
            };
            let instruction = self.issue(
                name,
                InstructionAction::Trigger,
                Value::Null,
                point_id,
                self.settings.device_timeout,
            )?;
            let device_name = name.clone();
            self.dispatch(&instruction, None, async move {
                let status = triggerable
                    .trigger()
                    .await
                    .map_err(|e| ScanError::from_device(&device_name, "trigger", e))?;
                settle_status(&device_name, InstructionAction::Trigger, status).await
            });
            pending.push(instruction);
        }
        wait_all(pending).await.map(|_| ())
    }

    /// Start reading `devices`; the values land in `stream`.
    ///
    /// # Errors
    /// `Cancelled` or `UnknownDevice` before anything is sent.
    pub async fn read(
        &self,
        devices: &[String],
        point_id: Option<PointId>,
        stream: ReadoutStream,
    ) -> ScanResult<PendingReads> {
        self.checkpoint().await?;
        let mut reads = Vec::with_capacity(devices.len());
        for name in devices {
            let device = self.wiring.registry.device(name)?;
            let parameter = json!({ "stream": stream });
            let instruction = self.issue(
                name,
                InstructionAction::Read,
                parameter,
                point_id,
                self.settings.device_timeout,
            )?;
            let device_name = name.clone();
            self.dispatch(&instruction, Some((stream, point_id)), async move {
                device
                    .read()
                    .await
                    .map(AckPayload::Readings)
                    .map_err(|e| ScanError::from_device(&device_name, "read", e))
            });
            reads.push(instruction);
        }
        Ok(PendingReads { reads })
    }

    /// Read `devices` and wait, retrying a timed out read once.
    ///
    /// # Errors
    /// The first failure.
    pub async fn read_and_wait(
        &self,
        devices: &[String],
        point_id: Option<PointId>,
        stream: ReadoutStream,
    ) -> ScanResult<HashMap<String, ReadingMap>> {
        let results = join_all(devices.iter().map(|device| async move {
            let values = retry_on_timeout(&self.settings.retry, |_| async move {
                let mut values = self
                    .read(std::slice::from_ref(device), point_id, stream)
                    .await?
                    .wait()
                    .await?;
                Ok(values.remove(device).unwrap_or_default())
            })
            .await?;
            Ok::<_, ScanError>((device.clone(), values))
        }))
        .await;
        results.into_iter().collect()
    }

    /// Wait for reads started with [`ScanStubs::read`].
    ///
    /// A read that timed out is re-issued for its device alone under the
    /// remaining retry budget; the other devices keep their first answer.
    ///
    /// # Errors
    /// The first failure.
    pub async fn finish_reads(
        &self,
        reads: PendingReads,
        point_id: Option<PointId>,
        stream: ReadoutStream,
    ) -> ScanResult<HashMap<String, ReadingMap>> {
        let retry = &self.settings.retry;
        let remaining = RetryPolicy {
            max_attempts: retry.max_attempts.saturating_sub(1),
            ..retry.clone()
        };
        let remaining = &remaining;
        let results = join_all(reads.reads.into_iter().map(|pending| async move {
            let device = pending.device.clone();
            let values = match pending.wait().await {
                Ok(AckPayload::Readings(values)) => values,
                Ok(_) => ReadingMap::new(),
                Err(err) if err.is_retryable() && retry.max_attempts > 0 => {
                    warn!(rid = %self.rid, error = %err, "read timed out, retrying");
                    if !retry.backoff_delay.is_zero() {
                        tokio::time::sleep(retry.backoff_delay).await;
                    }
                    let name = &device;
                    retry_on_timeout(remaining, move |_| async move {
                        let mut values = self
                            .read(std::slice::from_ref(name), point_id, stream)
                            .await?
                            .wait()
                            .await?;
                        Ok(values.remove(name).unwrap_or_default())
                    })
                    .await?
                }
                Err(err) => return Err(err),
            };
            Ok::<_, ScanError>((device, values))
        }))
        .await;
        results.into_iter().collect()
    }

    /// Read the baseline devices once.
    ///
    /// # Errors
    /// The first failure.
    pub async fn baseline_reading(
        &self,
        devices: &[String],
    ) -> ScanResult<HashMap<String, ReadingMap>> {
        self.read_and_wait(devices, None, ReadoutStream::Baseline)
            .await
    }

    /// Publish data computed by the scan as if `device` had been read.
    ///
    /// # Errors
    /// `Cancelled`.
    pub async fn publish_data_as_read(
        &self,
        device: &str,
        values: ReadingMap,
        point_id: Option<PointId>,
    ) -> ScanResult<()> {
        self.checkpoint().await?;
        let diid = self.diids.next_id();
        self.wiring
            .bus
            .publish(BusMessage::DeviceInstruction(DeviceInstruction {
                rid: self.rid.clone(),
                diid,
                device: device.to_string(),
                action: InstructionAction::PublishDataAsRead,
                parameter: Value::Null,
                point_id,
            }));
        let update = BusMessage::Reading(ReadingUpdate {
            rid: self.rid.clone(),
            diid: Some(diid),
            point_id,
            stream: ReadoutStream::Primary,
            device: device.to_string(),
            values,
        });
        self.wiring
            .bus
            .append(&readings_stream(&self.rid), update.clone());
        self.wiring.bus.publish(update);
        Ok(())
    }

    // =========================================================================
    // Flyers
    // =========================================================================

    /// Start a flyer's acquisition.
    ///
    /// # Errors
    /// The kickoff failure.
    pub async fn kickoff(&self, device: &str, params: HashMap<String, Value>) -> ScanResult<()> {
        self.checkpoint().await?;
        let flyer = self.wiring.registry.flyer(device)?;
        let pending = self.issue(
            device,
            InstructionAction::Kickoff,
            json!(params),
            None,
            self.settings.device_timeout,
        )?;
        let name = device.to_string();
        self.dispatch(&pending, None, async move {
            let status = flyer
                .kickoff(params)
                .await
                .map_err(|e| ScanError::from_device(&name, "kickoff", e))?;
            settle_status(&name, InstructionAction::Kickoff, status).await
        });
        pending.wait().await.map(|_| ())
    }

    /// Wait for a flyer to finish its acquisition.
    ///
    /// # Errors
    /// The completion failure, or a timeout after `complete_timeout`.
    pub async fn complete(&self, device: &str) -> ScanResult<()> {
        self.checkpoint().await?;
        let flyer = self.wiring.registry.flyer(device)?;
        let pending = self.issue(
            device,
            InstructionAction::Complete,
            Value::Null,
            None,
            self.settings.complete_timeout,
        )?;
        let name = device.to_string();
        self.dispatch(&pending, None, async move {
            let status = flyer
                .complete()
                .await
                .map_err(|e| ScanError::from_device(&name, "complete", e))?;
            settle_status(&name, InstructionAction::Complete, status).await
        });
        pending.wait().await.map(|_| ())
    }

    /// Query a flyer's progress and publish it.
    ///
    /// # Errors
    /// `Cancelled`, or the flyer's failure.
    pub async fn device_progress(&self, device: &str) -> ScanResult<FlyProgress> {
        self.checkpoint().await?;
        let flyer = self.wiring.registry.flyer(device)?;
        let progress = flyer
            .progress()
            .await
            .map_err(|e| ScanError::from_device(device, "progress", e))?;
        self.publish_progress(Some(device), progress.value, progress.max, progress.done);
        Ok(progress)
    }

    // =========================================================================
    // Miscellaneous
    // =========================================================================

    /// Call a named method on a device and return its result.
    ///
    /// # Errors
    /// The call's failure or timeout.
    pub async fn rpc(&self, device: &str, method: &str, args: Vec<Value>) -> ScanResult<Value> {
        self.checkpoint().await?;
        let handle = self.wiring.registry.device(device)?;
        let pending = self.issue(
            device,
            InstructionAction::Rpc,
            json!({ "method": method, "args": args }),
            None,
            self.settings.device_timeout,
        )?;
        let name = device.to_string();
        let method = method.to_string();
        self.dispatch(&pending, None, async move {
            handle
                .call(&method, &args)
                .await
                .map(AckPayload::Value)
                .map_err(|e| ScanError::from_device(&name, "rpc", e))
        });
        match pending.wait().await? {
            AckPayload::Value(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    /// Sleep on the engine side; a stop request cuts the wait short.
    ///
    /// # Errors
    /// `Cancelled` unless shielded.
    pub async fn wait(&self, duration: Duration) -> ScanResult<()> {
        if self.is_shielded() {
            tokio::time::sleep(duration).await;
            return Ok(());
        }
        self.control.checkpoint().await?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.control.cancelled() => Err(self.control.stop_error()),
        }
    }
}

fn check_arity(devices: &[String], targets: &[f64]) -> ScanResult<()> {
    if devices.len() != targets.len() {
        return Err(ScanError::InvalidRequest(format!(
            "{} devices but {} targets",
            devices.len(),
            targets.len()
        )));
    }
    Ok(())
}

async fn settle_status(
    device: &str,
    action: InstructionAction,
    status: DeviceStatus,
) -> ScanResult<AckPayload> {
    status
        .resolve()
        .await
        .map(|_| AckPayload::None)
        .map_err(|err| match err {
            StatusError::Failed(err) => ScanError::from_device(device, action.as_str(), err),
            other => ScanError::DeviceError {
                device: device.to_string(),
                operation: action.as_str().to_string(),
                message: other.to_string(),
            },
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::{DeviceComponents, LocalBus, Positioner, Reading};
    use beamline_hardware::drivers::{CallLog, FaultConfig, FaultScenario, SimMonitor, SimMotor};

    struct Fixture {
        stubs: ScanStubs,
        bus: Arc<LocalBus>,
        log: CallLog,
        ledger: Arc<StagingLedger>,
        registry: Arc<DeviceRegistry>,
    }

    fn fixture_with(motor: SimMotor, settings: StubSettings) -> Fixture {
        let log = CallLog::new();
        let mut registry = DeviceRegistry::new();
        registry
            .register(DeviceComponents::motor(Arc::new(
                motor.with_limits(-10.0, 10.0).with_log(log.clone()),
            )))
            .unwrap();
        registry
            .register(DeviceComponents::detector(Arc::new(
                SimMonitor::new("det", 7.0).with_log(log.clone()),
            )))
            .unwrap();
        let registry = Arc::new(registry);
        let bus = Arc::new(LocalBus::recording(1024));
        let ledger = Arc::new(StagingLedger::new());
        let wiring = StubWiring {
            registry: registry.clone(),
            bus: bus.clone(),
            correlator: Arc::new(InstructionCorrelator::new()),
            ledger: ledger.clone(),
        };
        Fixture {
            stubs: ScanStubs::new(RequestId::new(), wiring, ScanControl::new(), settings),
            bus,
            log,
            ledger,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SimMotor::new("samx"), StubSettings::default())
    }

    #[tokio::test]
    async fn move_and_wait_publishes_instruction_and_ack() {
        let f = fixture();
        f.stubs.move_and_wait("samx", 3.0).await.unwrap();

        let position = f.registry.positioner("samx").unwrap().position().await.unwrap();
        assert_eq!(position, 3.0);

        let journal = f.bus.journal();
        let instruction = journal.iter().find_map(|m| match m {
            BusMessage::DeviceInstruction(i) => Some(i.clone()),
            _ => None,
        });
        let ack = journal.iter().find_map(|m| match m {
            BusMessage::DeviceAck(a) => Some(a.clone()),
            _ => None,
        });
        let (instruction, ack) = (instruction.unwrap(), ack.unwrap());
        assert_eq!(instruction.diid, ack.diid);
        assert_eq!(instruction.action, InstructionAction::Set);
        assert!(ack.success);
    }

    #[tokio::test]
    async fn out_of_limit_move_sends_nothing() {
        let f = fixture();
        let err = f.stubs.move_and_wait("samx", 11.0).await.unwrap_err();
        assert!(matches!(err, ScanError::LimitExceeded { .. }));
        assert_eq!(f.stubs.instructions_issued(), 0);
        assert_eq!(f.log.count("samx", "move"), 0);
    }

    #[tokio::test]
    async fn reads_land_in_the_readings_stream() {
        let f = fixture();
        let values = f
            .stubs
            .read_and_wait(&["det".to_string()], Some(PointId(0)), ReadoutStream::Primary)
            .await
            .unwrap();
        assert_eq!(values["det"]["det"].as_f64(), Some(7.0));

        let stream = f.bus.read_stream(&readings_stream(f.stubs.rid()));
        assert_eq!(stream.len(), 1);
        assert!(matches!(
            &stream[0],
            BusMessage::Reading(update) if update.point_id == Some(PointId(0)) && update.device == "det"
        ));
    }

    #[tokio::test]
    async fn data_published_as_read_joins_the_stream() {
        let f = fixture();
        let mut values = ReadingMap::new();
        values.insert("fit_center".to_string(), Reading::now(1.25));
        f.stubs
            .publish_data_as_read("fit", values, Some(PointId(3)))
            .await
            .unwrap();

        assert_eq!(f.stubs.instructions_issued(), 1);
        assert_eq!(f.log.calls().len(), 0);
        let stream = f.bus.read_stream(&readings_stream(f.stubs.rid()));
        match &stream[..] {
            [BusMessage::Reading(update)] => {
                assert_eq!(update.device, "fit");
                assert_eq!(update.point_id, Some(PointId(3)));
                assert_eq!(update.values["fit_center"].as_f64(), Some(1.25));
            }
            other => panic!("unexpected stream {other:?}"),
        }
    }

    #[tokio::test]
    async fn staging_claims_and_releases_the_ledger() {
        let f = fixture();
        let devices = vec!["samx".to_string(), "det".to_string()];
        f.stubs.stage_all(&devices).await.unwrap();
        assert_eq!(f.ledger.owner("samx").as_ref(), Some(f.stubs.rid()));
        assert!(f.stubs.is_staged("det"));

        assert!(f.stubs.unstage_all().await.is_empty());
        assert!(f.ledger.held_by(f.stubs.rid()).is_empty());
        assert_eq!(f.log.count("samx", "unstage"), 1);

        // a second unstage of the same device is a no-op
        f.stubs.unstage("samx").await.unwrap();
        assert_eq!(f.log.count("samx", "unstage"), 1);
    }

    #[tokio::test]
    async fn staging_a_held_device_fails_without_side_effects() {
        let f = fixture();
        let other = RequestId::new();
        f.ledger.claim("det", &other).unwrap();

        let err = f
            .stubs
            .stage_all(&["samx".to_string(), "det".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::AlreadyStaged { .. }));
        assert_eq!(f.log.count("samx", "stage"), 0);
        assert_eq!(f.ledger.owner("samx"), None);
    }

    #[tokio::test]
    async fn repeated_devices_are_staged_once() {
        let f = fixture();
        let devices = vec!["samx".to_string(), "det".to_string(), "samx".to_string()];
        f.stubs.stage_all(&devices).await.unwrap();
        assert_eq!(f.log.count("samx", "stage"), 1);
        assert_eq!(f.stubs.staged_devices(), vec!["samx".to_string(), "det".to_string()]);
    }

    #[tokio::test]
    async fn a_timed_out_stage_is_unstaged_after_it_lands() {
        let settings = StubSettings {
            stage_timeout: Duration::from_millis(20),
            ..StubSettings::default()
        };
        let motor = SimMotor::new("samx").with_faults(FaultConfig::scenario(FaultScenario::Delay {
            operation: "stage",
            delay: Duration::from_millis(60),
            times: 1,
        }));
        let f = fixture_with(motor, settings);

        let err = f
            .stubs
            .stage_all(&["samx".to_string(), "det".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::DeviceTimeout { .. }));
        assert!(f.stubs.is_staged("samx"));
        assert_eq!(f.ledger.owner("samx").as_ref(), Some(f.stubs.rid()));

        assert!(f.stubs.unstage_all().await.is_empty());
        assert_eq!(f.log.count("samx", "unstage"), 1);
        assert!(f.ledger.held_by(f.stubs.rid()).is_empty());

        // The motor itself is free again: staging it once more succeeds.
        f.stubs.stage("samx").await.unwrap();
    }

    #[tokio::test]
    async fn a_hung_move_is_retried_once() {
        let settings = StubSettings {
            device_timeout: Duration::from_millis(30),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_delay: Duration::ZERO,
            },
            ..StubSettings::default()
        };
        let motor = SimMotor::new("samx").with_faults(FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 1,
        }));
        let f = fixture_with(motor, settings);

        f.stubs.move_and_wait("samx", 2.0).await.unwrap();
        assert_eq!(f.log.count("samx", "move"), 2);
    }

    #[tokio::test]
    async fn two_timeouts_surface_as_device_timeout() {
        let settings = StubSettings {
            device_timeout: Duration::from_millis(20),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_delay: Duration::ZERO,
            },
            ..StubSettings::default()
        };
        let motor = SimMotor::new("samx").with_faults(FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 5,
        }));
        let f = fixture_with(motor, settings);

        let err = f.stubs.move_and_wait("samx", 2.0).await.unwrap_err();
        assert!(matches!(err, ScanError::DeviceTimeout { .. }));
        assert_eq!(f.log.count("samx", "move"), 2);
    }

    #[tokio::test]
    async fn set_with_response_can_be_polled() {
        let f = fixture();
        let diid = f.stubs.set_with_response("samx", 1.0).await.unwrap();
        f.stubs.wait_for(diid).await.unwrap();
        assert!(f.stubs.request_is_completed(diid));
        assert!(f.stubs.wait_for(DeviceInstructionId(99)).await.is_err());
    }

    #[tokio::test]
    async fn rpc_returns_the_device_value() {
        let f = fixture();
        f.stubs.move_and_wait("samx", 4.0).await.unwrap();
        let value = f.stubs.rpc("samx", "position", Vec::new()).await.unwrap();
        assert_eq!(value.as_f64(), Some(4.0));

        let err = f.stubs.rpc("det", "no_such_method", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::DeviceError { .. }));
    }

    #[tokio::test]
    async fn stopped_scan_refuses_new_instructions() {
        let f = fixture();
        f.stubs.control().request_stop(StopKind::Abort);
        assert!(f.stubs.move_and_wait("samx", 1.0).await.unwrap_err().is_cancellation());
        assert!(f.stubs.wait(Duration::from_secs(5)).await.unwrap_err().is_cancellation());

        f.stubs.shield();
        f.stubs.move_and_wait("samx", 1.0).await.unwrap();
    }
}

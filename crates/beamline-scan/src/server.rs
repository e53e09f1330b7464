//! The scan server: engine services plus queues behind one handle.

use crate::context::EngineContext;
use crate::correlator::AckOutcome;
use crate::queue::QueueManager;
use crate::scans::ScanCatalogue;
use beamline_core::{
    BusMessage, DeviceAck, EngineConfig, MessageBus, RequestId, ScanRequest, ScanResult,
};
use beamline_hardware::DeviceRegistry;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Scan orchestration engine.
///
/// ```no_run
/// # async fn demo() -> beamline_core::ScanResult<()> {
/// use beamline_core::{EngineConfig, LocalBus, ScanRequest};
/// use beamline_hardware::create_sim_registry;
/// use beamline_scan::ScanServer;
/// use std::sync::Arc;
///
/// let server = ScanServer::new(
///     Arc::new(create_sim_registry()?),
///     Arc::new(LocalBus::default()),
///     EngineConfig::default(),
/// );
/// server.start()?;
/// let rid = server.submit(
///     ScanRequest::new("line_scan").arg("samx").arg(0.0).arg(4.0).kwarg("steps", 5),
/// )?;
/// server.queues().wait_for(&rid).await?;
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ScanServer {
    engine: EngineContext,
    queues: QueueManager,
    listener: CancellationToken,
}

impl ScanServer {
    /// Server with the built-in scan types.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: Arc<dyn MessageBus>,
        config: EngineConfig,
    ) -> Self {
        Self::with_catalogue(registry, bus, config, ScanCatalogue::with_builtin())
    }

    /// Server with a custom set of scan types.
    pub fn with_catalogue(
        registry: Arc<DeviceRegistry>,
        bus: Arc<dyn MessageBus>,
        config: EngineConfig,
        catalogue: ScanCatalogue,
    ) -> Self {
        let engine = EngineContext::new(registry, bus, catalogue, config);
        Self {
            queues: QueueManager::new(engine.clone()),
            engine,
            listener: CancellationToken::new(),
        }
    }

    /// Load the scan counter and create the configured queues.
    ///
    /// # Errors
    /// `InvalidConfig` for an unreadable scan number file, `EngineFault`
    /// outside a tokio runtime.
    #[instrument(skip_all)]
    pub fn start(&self) -> ScanResult<()> {
        let last_scan = self.engine.scan_numbers.load()?;
        for name in &self.engine.config.queues {
            self.queues.create_queue(name)?;
        }
        info!(
            queues = ?self.queues.queue_names(),
            devices = self.engine.registry.len(),
            scan_types = ?self.engine.catalogue.scan_types(),
            last_scan,
            "scan server started"
        );
        Ok(())
    }

    /// Engine services.
    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    /// Queue control.
    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Submit a request directly.
    ///
    /// # Errors
    /// `InvalidRequest` if the request does not validate.
    pub fn submit(&self, request: ScanRequest) -> ScanResult<RequestId> {
        self.queues.enqueue(request)
    }

    /// Feed an acknowledgement from a remote device server to the waiting scan.
    pub fn deliver_ack(&self, ack: DeviceAck) -> AckOutcome {
        let outcome = self.engine.correlator.acknowledge(ack);
        debug!(?outcome, "external acknowledgement");
        outcome
    }

    /// Enqueue every `ScanRequest` published on the bus.
    ///
    /// Rejections are reported on the bus as `RequestResponse`s.
    pub fn spawn_request_listener(&self) -> JoinHandle<()> {
        let mut rx = self.engine.bus.subscribe();
        let queues = self.queues.clone();
        let stop = self.listener.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = stop.cancelled() => break,
                    message = rx.recv() => message,
                };
                match message {
                    Ok(BusMessage::ScanRequest(request)) => {
                        // Rejections are already logged and published.
                        let _ = queues.enqueue(request);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "request listener lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("request listener stopped");
        })
    }

    /// Stop listening, abort active scans and stop the queue workers.
    pub async fn shutdown(&self) {
        self.listener.cancel();
        self.queues.shutdown().await;
        info!("scan server stopped");
    }
}

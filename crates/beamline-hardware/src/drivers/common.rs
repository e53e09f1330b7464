//! Plumbing shared by the simulated devices: fault injection and a call journal.

use anyhow::anyhow;
use beamline_core::StatusNotifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Fault Injection
// =============================================================================

/// A scripted misbehaviour of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultScenario {
    /// Every call of `operation` after the first `count` fails.
    FailAfterN {
        /// Operation name ("move", "trigger", "read", "stage", ...)
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// The first `times` calls of `operation` never complete.
    Hang {
        /// Operation name
        operation: &'static str,
        /// Calls that hang
        times: u32,
    },
    /// The first `times` calls of `operation` take `delay` longer than usual.
    Delay {
        /// Operation name
        operation: &'static str,
        /// Extra time spent in the call
        delay: Duration,
        /// Calls that are slowed down
        times: u32,
    },
}

/// What a device should do with the current call.
#[derive(Debug)]
pub enum FaultAction {
    /// Behave normally
    Proceed,
    /// Fail with this error
    Fail(anyhow::Error),
    /// Never complete
    Hang,
    /// Complete normally after this long
    Delay(Duration),
}

impl FaultAction {
    /// Sleep out a `Delay`; anything else is returned untouched.
    pub async fn settle(self) -> Self {
        match self {
            FaultAction::Delay(delay) => {
                tokio::time::sleep(delay).await;
                FaultAction::Proceed
            }
            other => other,
        }
    }
}

/// Fault injection configuration for simulated devices.
#[derive(Clone, Debug, Default)]
pub struct FaultConfig {
    scenarios: Arc<Vec<FaultScenario>>,
    counts: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl FaultConfig {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// A single scenario.
    pub fn scenario(scenario: FaultScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            counts: Arc::default(),
        }
    }

    /// Count a call of `operation` and decide how it behaves.
    pub fn check(&self, device: &str, operation: &'static str) -> FaultAction {
        let call = {
            let mut counts = self.counts.lock();
            let n = counts.entry(operation).or_insert(0);
            *n += 1;
            *n
        };
        for scenario in self.scenarios.iter() {
            match scenario {
                FaultScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation && call > *count => {
                    return FaultAction::Fail(anyhow!(
                        "injected {operation} failure on '{device}' after {count} call(s)"
                    ));
                }
                FaultScenario::Hang {
                    operation: op,
                    times,
                } if *op == operation && call <= *times => {
                    return FaultAction::Hang;
                }
                FaultScenario::Delay {
                    operation: op,
                    delay,
                    times,
                } if *op == operation && call <= *times => {
                    return FaultAction::Delay(*delay);
                }
                _ => {}
            }
        }
        FaultAction::Proceed
    }
}

/// Completion handles of calls that were told to hang.
///
/// Handles whose waiter has given up are dropped on the next park, and a
/// device stop fails whatever is still parked.
#[derive(Default)]
pub struct HungCalls {
    parked: Mutex<Vec<StatusNotifier>>,
}

impl HungCalls {
    /// Keep `notifier` unresolved until the device is stopped.
    pub fn park(&self, notifier: StatusNotifier) {
        let mut parked = self.parked.lock();
        parked.retain(|n| !n.is_abandoned());
        parked.push(notifier);
    }

    /// Fail every parked handle.
    pub fn release(&self, device: &str) -> usize {
        let parked: Vec<StatusNotifier> = self.parked.lock().drain(..).collect();
        let released = parked.len();
        for notifier in parked {
            notifier.fail(anyhow!("'{device}' was stopped"));
        }
        released
    }

    /// Number of parked handles.
    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    /// True if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Call Journal
// =============================================================================

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCall {
    /// Position in the journal, shared by all devices writing to it
    pub seq: usize,
    /// Device name
    pub device: String,
    /// Operation, e.g. "move", "move_done", "trigger", "read_done"
    pub operation: String,
    /// Operation argument, such as a move target
    pub value: Option<f64>,
}

/// Journal of simulated device calls.
///
/// Devices sharing one `CallLog` produce a single, totally ordered record,
/// which lets tests assert ordering across devices.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<SimCall>>>,
}

impl CallLog {
    /// Empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call.
    pub fn record(&self, device: &str, operation: &str, value: Option<f64>) {
        let mut calls = self.inner.lock();
        let seq = calls.len();
        calls.push(SimCall {
            seq,
            device: device.to_string(),
            operation: operation.to_string(),
            value,
        });
    }

    /// All calls in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.inner.lock().clone()
    }

    /// Calls of one device.
    pub fn for_device(&self, device: &str) -> Vec<SimCall> {
        self.inner
            .lock()
            .iter()
            .filter(|c| c.device == device)
            .cloned()
            .collect()
    }

    /// Number of calls of `operation` on `device`.
    pub fn count(&self, device: &str, operation: &str) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|c| c.device == device && c.operation == operation)
            .count()
    }

    /// Values passed to `operation` on `device`, in order.
    pub fn values(&self, device: &str, operation: &str) -> Vec<f64> {
        self.inner
            .lock()
            .iter()
            .filter(|c| c.device == device && c.operation == operation)
            .filter_map(|c| c.value)
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_after_n_counts_per_operation() {
        let faults = FaultConfig::scenario(FaultScenario::FailAfterN {
            operation: "trigger",
            count: 2,
        });
        assert!(matches!(faults.check("det", "trigger"), FaultAction::Proceed));
        assert!(matches!(faults.check("det", "read"), FaultAction::Proceed));
        assert!(matches!(faults.check("det", "trigger"), FaultAction::Proceed));
        assert!(matches!(faults.check("det", "trigger"), FaultAction::Fail(_)));
    }

    #[test]
    fn hang_only_affects_first_calls() {
        let faults = FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 1,
        });
        assert!(matches!(faults.check("samx", "move"), FaultAction::Hang));
        assert!(matches!(faults.check("samx", "move"), FaultAction::Proceed));
    }

    #[tokio::test]
    async fn delay_slows_the_first_calls_then_proceeds() {
        let faults = FaultConfig::scenario(FaultScenario::Delay {
            operation: "stage",
            delay: Duration::from_millis(5),
            times: 1,
        });
        let action = faults.check("samx", "stage");
        assert!(matches!(action, FaultAction::Delay(d) if d == Duration::from_millis(5)));
        assert!(matches!(action.settle().await, FaultAction::Proceed));
        assert!(matches!(faults.check("samx", "stage"), FaultAction::Proceed));
    }

    #[test]
    fn hung_calls_drop_abandoned_handles() {
        let hung = HungCalls::default();
        let (first, status) = beamline_core::DeviceStatus::pending();
        hung.park(first);
        drop(status);
        let (second, _kept) = beamline_core::DeviceStatus::pending();
        hung.park(second);
        assert_eq!(hung.len(), 1);
    }

    #[tokio::test]
    async fn release_fails_parked_handles() {
        let hung = HungCalls::default();
        let (notifier, status) = beamline_core::DeviceStatus::pending();
        hung.park(notifier);
        assert_eq!(hung.release("samx"), 1);
        assert!(hung.is_empty());
        assert!(status.resolve().await.is_err());
    }

    #[test]
    fn call_log_is_shared_and_ordered() {
        let log = CallLog::new();
        let other = log.clone();
        log.record("samx", "move", Some(1.0));
        other.record("det", "trigger", None);
        log.record("samx", "move", Some(2.0));

        let calls = log.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].device, "det");
        assert_eq!(calls[2].seq, 2);
        assert_eq!(log.values("samx", "move"), vec![1.0, 2.0]);
        assert_eq!(other.count("det", "trigger"), 1);
    }
}

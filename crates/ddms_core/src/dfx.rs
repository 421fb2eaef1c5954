//! Fault and behaviour reporting.
//!
//! Reports are fire-and-forget. The default [`TracingReporter`] turns them
//! into structured log events under the `ddms::dfx` target.

use crate::GeneralError;

/// Category of a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Device communication failed.
    Communication,
    /// A database operation failed.
    Database,
    /// Cloud sync failed.
    CloudSync,
    /// The service itself misbehaved.
    Service,
}

/// Telemetry collaborator.
pub trait DfxReporter: Send + Sync {
    /// Reports a fault in `module`.
    fn report_fault(&self, kind: FaultKind, module: &str, detail: &str);

    /// Reports a notable user or system action.
    fn report_behaviour(&self, action: &str, detail: &str);

    /// Reports a counter sample for a store.
    fn report_statistic(&self, store: &str, name: &str, value: u64);

    /// Reports a failed database operation.
    fn report_db_fault(&self, store: &str, code: GeneralError) {
        self.report_fault(FaultKind::Database, store, &code.to_string());
    }

    /// Reports a device communication failure.
    fn report_comm_fault(&self, device: &str, detail: &str) {
        self.report_fault(FaultKind::Communication, device, detail);
    }
}

/// Reporter that emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl DfxReporter for TracingReporter {
    fn report_fault(&self, kind: FaultKind, module: &str, detail: &str) {
        tracing::warn!(target: "ddms::dfx", ?kind, module, detail, "fault");
    }

    fn report_behaviour(&self, action: &str, detail: &str) {
        tracing::debug!(target: "ddms::dfx", action, detail, "behaviour");
    }

    fn report_statistic(&self, store: &str, name: &str, value: u64) {
        tracing::debug!(target: "ddms::dfx", store, name, value, "statistic");
    }
}

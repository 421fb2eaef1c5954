use crate::error::StoreResult;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stage of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Progress {
    /// Queued, not yet started.
    #[default]
    Begin,
    /// Transferring data.
    InProgress,
    /// Done, successfully or not.
    Finished,
}

/// Record counters for one direction of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistic {
    /// Records to transfer.
    pub total: u32,
    /// Records transferred.
    pub success: u32,
    /// Records that failed.
    pub failed: u32,
    /// Records not attempted.
    pub untreated: u32,
}

/// Upload and download counters of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableDetail {
    /// Local to remote.
    pub upload: Statistic,
    /// Remote to local.
    pub download: Statistic,
}

/// Progress report for one sync target (a device or a store).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressDetail {
    /// Current stage.
    pub progress: Progress,
    /// Outcome; only meaningful once finished.
    pub code: StoreResult<()>,
    /// True if local data changed as a result.
    pub data_change: bool,
    /// Per table counters.
    pub details: BTreeMap<String, TableDetail>,
}

impl Default for ProgressDetail {
    fn default() -> Self {
        Self {
            progress: Progress::Begin,
            code: Ok(()),
            data_change: false,
            details: BTreeMap::new(),
        }
    }
}

impl ProgressDetail {
    /// A finished report with the given outcome.
    pub fn finished(code: StoreResult<()>) -> Self {
        Self {
            progress: Progress::Finished,
            code,
            ..Self::default()
        }
    }
}

/// Progress keyed by target id.
pub type GenDetails = BTreeMap<String, ProgressDetail>;

/// Async progress callback.
pub type DetailAsync = Arc<dyn Fn(&GenDetails) + Send + Sync>;

//! Background tasks driving the value log.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Context};
use crate::vlog::ValueLog;

/// Periodically attempts a garbage collection pass. "Nothing to do" and
/// "already running" are normal outcomes, not failures.
pub struct GcTask {
    vlog: Arc<ValueLog>,
}

impl GcTask {
    pub fn new(vlog: Arc<ValueLog>) -> Self {
        Self { vlog }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for GcTask {
    fn name(&self) -> &'static str {
        "value-log-gc"
    }

    fn interval(&self) -> Duration {
        self.vlog.config.gc.gc_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        match self.vlog.run_gc(self.vlog.config.gc.discard_ratio) {
            Ok(()) | Err(Error::NoRewrite) | Err(Error::Rejected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Periodically syncs the head file when `sync_writes` is off.
pub struct SyncTask {
    vlog: Arc<ValueLog>,
}

impl SyncTask {
    pub fn new(vlog: Arc<ValueLog>) -> Self {
        Self { vlog }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SyncTask {
    fn name(&self) -> &'static str {
        "value-log-sync"
    }

    fn interval(&self) -> Duration {
        self.vlog.config.gc.sync_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.vlog.sync()
    }
}

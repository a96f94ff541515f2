use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{ActionError, ErrorKind};
use crate::state::{new_state, Shared};

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub pools_configured: u32,
    pub vms_configured: u32,
    pub actions_attempted: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub failures_by_kind: HashMap<ErrorKind, u64>,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    attempted: Arc<AtomicU64>,
    succeeded: Arc<AtomicU64>,
    failures: Shared<HashMap<ErrorKind, u64>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            attempted: Arc::new(AtomicU64::new(0)),
            succeeded: Arc::new(AtomicU64::new(0)),
            failures: new_state(HashMap::new()),
        }
    }

    pub fn record<T>(&self, outcome: &Result<T, ActionError>) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => *self.failures.lock().entry(e.kind()).or_insert(0) += 1,
        }
    }

    pub fn get_health(&self, pools: usize, vms: usize) -> KernelHealth {
        let failures_by_kind = self.failures.lock().clone();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            pools_configured: pools as u32,
            vms_configured: vms as u32,
            actions_attempted: self.attempted.load(Ordering::Relaxed),
            actions_succeeded: self.succeeded.load(Ordering::Relaxed),
            actions_failed: failures_by_kind.values().sum(),
            failures_by_kind,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;

    #[test]
    fn counts_outcomes_by_kind() {
        let h = HealthTracker::new();
        h.record::<()>(&Ok(()));
        h.record::<()>(&Err(ActionError::NotFound("p1:v9".into())));
        h.record::<()>(&Err(ActionError::Remote(RemoteError::call("VM.start", "boom"))));
        h.record::<()>(&Err(ActionError::NotFound("p1:v8".into())));

        let report = h.get_health(2, 5);
        assert_eq!(report.actions_attempted, 4);
        assert_eq!(report.actions_succeeded, 1);
        assert_eq!(report.actions_failed, 3);
        assert_eq!(report.failures_by_kind[&ErrorKind::ResourceNotFound], 2);
        assert_eq!(report.failures_by_kind[&ErrorKind::RemoteCallFailure], 1);
        assert_eq!(report.vms_configured, 5);
    }
}

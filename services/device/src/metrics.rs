use serde::Serialize;
use std::collections::VecDeque;

/// Which wire form an apply cycle consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Full,
    Incremental,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::Full => "full",
            UpdateKind::Incremental => "incremental",
        }
    }
}

/// One applied (or rejected) update, retained for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyMetric {
    pub sequence: u64,
    #[serde(rename = "type")]
    pub update_type: UpdateKind,
    pub apply_time_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock ms since epoch.
    pub timestamp: u64,
}

/// Bounded ring of recent apply metrics (in-memory only, lost on restart).
#[derive(Debug)]
pub struct MetricsRing {
    entries: VecDeque<ApplyMetric>,
    capacity: usize,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, metric: ApplyMetric) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(metric);
    }

    pub fn snapshot(&self) -> Vec<ApplyMetric> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Status - キューの状態スナップショット
//!
//! `dueq stats` と定期ログで使います。

use serde::{Deserialize, Serialize};

/// Per-status row counts of the hot table plus the archive size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub archived: u64,
}

impl QueueCounts {
    /// Rows still in the hot table.
    pub fn hot(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed
    }

    /// Rows that still need a worker.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing
    }
}

/// Result of one `Sweep`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Expired leases handed back to `pending` or frozen at `failed`.
    pub reclaimed: u64,
    /// Rows flipped to `failed` by the retry-cap check.
    pub capped: u64,
}

/// Result of one `Cleanup`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Never-claimed rows failed by the max-age fallback.
    pub expired: u64,
    pub capped: u64,
    /// Rows moved from the hot table to the archive.
    pub archived: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals() {
        let counts = QueueCounts {
            pending: 3,
            processing: 2,
            sent: 10,
            failed: 1,
            archived: 40,
        };
        assert_eq!(counts.hot(), 16);
        assert_eq!(counts.outstanding(), 5);
    }

    #[test]
    fn counts_serialize_flat() {
        let json = serde_json::to_value(QueueCounts::default()).unwrap();
        assert_eq!(json["pending"], 0);
        assert_eq!(json["archived"], 0);
    }
}

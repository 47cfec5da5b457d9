/*!
 * Per-operation call metrics
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct OperationStats {
    count: u64,
    errors: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            count: 0,
            errors: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }
}

/// Summary row for one `model.method`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub operation: String,
    pub count: u64,
    pub errors: u64,
    pub total_ms: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Call timings keyed by `model.method`
#[derive(Debug, Default)]
pub struct CallMetrics {
    operations: Mutex<HashMap<String, OperationStats>>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one logical call, including its retries
    pub fn record(&self, operation: &str, elapsed: Duration, success: bool) {
        let mut operations = self.operations.lock();
        let stats = operations
            .entry(operation.to_string())
            .or_insert_with(OperationStats::new);

        stats.count += 1;
        if !success {
            stats.errors += 1;
        }
        stats.total += elapsed;
        stats.min = stats.min.min(elapsed);
        stats.max = stats.max.max(elapsed);
    }

    /// Summaries sorted by operation name
    pub fn summary(&self) -> Vec<OperationSummary> {
        let operations = self.operations.lock();
        let mut rows: Vec<OperationSummary> = operations
            .iter()
            .map(|(operation, stats)| {
                let total_ms = stats.total.as_millis() as u64;
                OperationSummary {
                    operation: operation.clone(),
                    count: stats.count,
                    errors: stats.errors,
                    total_ms,
                    avg_ms: if stats.count > 0 {
                        stats.total.as_secs_f64() * 1000.0 / stats.count as f64
                    } else {
                        0.0
                    },
                    min_ms: if stats.count > 0 {
                        stats.min.as_millis() as u64
                    } else {
                        0
                    },
                    max_ms: stats.max.as_millis() as u64,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.operation.cmp(&b.operation));
        rows
    }

    /// Operations averaging more than `threshold`, slowest first
    pub fn slow_operations(&self, threshold: Duration) -> Vec<OperationSummary> {
        let threshold_ms = threshold.as_secs_f64() * 1000.0;
        let mut rows: Vec<OperationSummary> = self
            .summary()
            .into_iter()
            .filter(|row| row.avg_ms > threshold_ms)
            .collect();
        rows.sort_by(|a, b| {
            b.avg_ms
                .total_cmp(&a.avg_ms)
                .then_with(|| a.operation.cmp(&b.operation))
        });
        rows
    }

    pub fn reset(&self) {
        self.operations.lock().clear();
    }
}

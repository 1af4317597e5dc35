use std::collections::HashMap;

use parking_lot::RwLock;

pub type Metrics = HashMap<String, i64>;

/// Callback producing a batch of usage counters.
pub type MetricsFunc = Box<dyn Fn() -> anyhow::Result<Metrics> + Send + Sync>;

/// Sink for usage-report callbacks.
pub trait UsageStats: Send + Sync {
    fn register_metrics_func(&self, f: MetricsFunc);
}

/// Keeps registered callbacks and merges their output on demand.
#[derive(Default)]
pub struct UsageStatsRegistry {
    funcs: RwLock<Vec<MetricsFunc>>,
}

impl UsageStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every callback. A failing callback is logged and skipped.
    pub fn collect(&self) -> Metrics {
        let mut metrics = Metrics::new();
        for f in self.funcs.read().iter() {
            match f() {
                Ok(m) => metrics.extend(m),
                Err(e) => log::warn!("usage stats callback failed: {e:#}"),
            }
        }
        metrics
    }
}

impl UsageStats for UsageStatsRegistry {
    fn register_metrics_func(&self, f: MetricsFunc) {
        self.funcs.write().push(f);
    }
}

/// `stats.<prefix>.<name>`, or `stats.<name>` without a prefix.
pub fn metric_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        format!("stats.{name}")
    } else {
        format!("stats.{prefix}.{name}")
    }
}

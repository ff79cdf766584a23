//! Optional timing instrumentation.
//!
//! Layers report checkpoints to a caller-supplied [`TimingSink`]. When no sink
//! is attached the checkpoints are skipped entirely.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// Receives named checkpoints from the engine.
pub trait TimingSink {
    fn time_check(&mut self, label: &str);
}

/// Shared handle to a sink, as attached to layers.
pub type SharedTimingSink = Rc<RefCell<dyn TimingSink>>;

/// Accumulates the time elapsed since the previous checkpoint under each label.
pub struct StatefulTimer {
    last: Instant,
    totals: BTreeMap<String, f64>,
}

impl StatefulTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            totals: BTreeMap::new(),
        }
    }

    pub fn shared() -> Rc<RefCell<StatefulTimer>> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Accumulated milliseconds per label, sorted by label.
    pub fn dump(&self) -> Vec<(String, f64)> {
        self.totals.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn total_ms(&self, label: &str) -> Option<f64> {
        self.totals.get(label).copied()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
        self.last = Instant::now();
    }
}

impl Default for StatefulTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingSink for StatefulTimer {
    fn time_check(&mut self, label: &str) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64() * 1000.0;
        self.last = now;
        *self.totals.entry(label.to_string()).or_insert(0.0) += elapsed;
    }
}

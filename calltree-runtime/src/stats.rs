/// Aggregated timing statistics for one node of the call tree.
///
/// All durations are in raw cycle-counter ticks. `min_cycles` starts at
/// `u64::MAX` so the first completed call always replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub call_count: u32,
    /// Re-entries into this node without an intervening exit.
    pub recursion_depth: u32,
    /// Counter value when the call currently in flight started.
    pub start_cycles: u64,
    pub total_cycles: u64,
    pub max_cycles: u64,
    pub min_cycles: u64,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            call_count: 0,
            recursion_depth: 0,
            start_cycles: 0,
            total_cycles: 0,
            max_cycles: 0,
            min_cycles: u64::MAX,
        }
    }
}

impl NodeStats {
    /// Reset every field to its default.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one completed call into the extrema and the total.
    pub(crate) fn record(&mut self, elapsed: u64) {
        if elapsed > self.max_cycles {
            self.max_cycles = elapsed;
        }
        if elapsed < self.min_cycles {
            self.min_cycles = elapsed;
        }
        self.total_cycles = self.total_cycles.saturating_add(elapsed);
    }

    /// Mean cycles per call; 0 when nothing has been called.
    pub fn average_cycles(&self) -> u64 {
        if self.call_count == 0 {
            0
        } else {
            self.total_cycles / u64::from(self.call_count)
        }
    }

    /// True once at least one call has completed since the last reset.
    pub fn has_sample(&self) -> bool {
        self.min_cycles <= self.max_cycles
    }
}

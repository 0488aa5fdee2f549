//! Load admission and resident memory accounting
//!
//! Caps the number of node loads in flight and tracks how many payload bytes
//! are resident. The pressure metrics are reported to the external LOD
//! driver, which owns the eviction policy.

/// In-flight load budget plus resident payload accounting
#[derive(Clone, Debug)]
pub struct LoadBudget {
    /// Maximum number of concurrently loading nodes
    max_nodes_loading: usize,
    /// Nodes currently past admission and not yet settled
    nodes_loading: usize,
    /// Soft limit on resident payload bytes
    memory_budget_bytes: usize,
    /// Bytes held by loaded payloads
    resident_bytes: usize,
}

impl LoadBudget {
    /// Create a new budget
    ///
    /// # Arguments
    /// * `max_nodes_loading` - Maximum number of loads in flight
    /// * `memory_budget_mb` - Resident payload budget in megabytes
    pub fn new(max_nodes_loading: usize, memory_budget_mb: usize) -> Self {
        Self {
            max_nodes_loading,
            nodes_loading: 0,
            memory_budget_bytes: memory_budget_mb.saturating_mul(1024 * 1024),
            resident_bytes: 0,
        }
    }

    // --- Admission ---

    /// Whether another load may start
    pub fn has_capacity(&self) -> bool {
        self.nodes_loading < self.max_nodes_loading
    }

    /// Claim a load slot. Returns `false` when the budget is exhausted.
    pub fn begin_load(&mut self) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.nodes_loading += 1;
        true
    }

    /// Release a load slot claimed by [`begin_load`](Self::begin_load)
    pub fn end_load(&mut self) {
        debug_assert!(self.nodes_loading > 0, "load settled without a claimed slot");
        self.nodes_loading = self.nodes_loading.saturating_sub(1);
    }

    pub fn nodes_loading(&self) -> usize {
        self.nodes_loading
    }

    pub fn max_nodes_loading(&self) -> usize {
        self.max_nodes_loading
    }

    /// Change the in-flight cap. Loads already admitted are unaffected.
    pub fn set_max_nodes_loading(&mut self, max: usize) {
        self.max_nodes_loading = max;
    }

    // --- Resident memory ---

    /// Account for a newly resident payload
    pub fn add_resident(&mut self, bytes: usize) {
        self.resident_bytes = self.resident_bytes.saturating_add(bytes);
    }

    /// Account for a released payload
    pub fn remove_resident(&mut self, bytes: usize) {
        self.resident_bytes = self.resident_bytes.saturating_sub(bytes);
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    /// Resident memory pressure (0.0 to 1.0+)
    ///
    /// Values above 1.0 indicate over-budget.
    pub fn memory_pressure(&self) -> f32 {
        if self.memory_budget_bytes == 0 {
            return 0.0;
        }
        self.resident_bytes as f32 / self.memory_budget_bytes as f32
    }

    /// Whether the driver should start evicting payloads (above 90% usage)
    pub fn should_evict(&self) -> bool {
        self.memory_pressure() > 0.9
    }
}

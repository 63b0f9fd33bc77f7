use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use crate::config::PortPoolConfig;
use crate::error::OrchestratorError;
use crate::run::RunId;

/// Role of each port inside a run's block, by offset from the base port.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum EndpointRole {
    EventBusFrontend = 0,
    EventBusBackend = 1,
    DatasetFrontend = 2,
    DatasetBackend = 3,
    RawInferenceFrontend = 4,
    RawInferenceBackend = 5,
    Records = 6,
    CreditDrop = 7,
    CreditReturn = 8,
}

impl EndpointRole {
    pub fn offset(self) -> u16 {
        self as u16
    }
}

/// A contiguous block of ports reserved for one run.
///
/// Returned by [`PortAllocator::allocate`] and handed back through
/// [`PortAllocator::release`] when the run ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    /// The run owning this block.
    pub run_id: RunId,
    /// Host the ports are bound on.
    pub host: String,
    /// First port of the block.
    pub base: u16,
    /// Number of ports in the block.
    pub count: u16,
    /// When the block was reserved.
    pub allocated_at: DateTime<Utc>,
}

impl PortAllocation {
    pub fn ports(&self) -> Range<u16> {
        self.base..self.base + self.count
    }

    /// Port for `role`, if the block is large enough to carry it.
    pub fn port(&self, role: EndpointRole) -> Option<u16> {
        (role.offset() < self.count).then(|| self.base + role.offset())
    }

    /// Port the tool publishes live metrics on (event bus backend).
    pub fn metrics_port(&self) -> u16 {
        self.base + EndpointRole::EventBusBackend.offset()
    }

    /// Socket address of the metric publisher.
    pub fn metrics_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.metrics_port())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    in_use: BTreeSet<u16>,
    assignments: HashMap<RunId, PortAllocation>,
}

/// Hands out disjoint port blocks from a fixed pool.
///
/// Scanning and marking happen under one lock, so two live allocations never
/// share a port.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    config: PortPoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl PortAllocator {
    pub fn new(config: PortPoolConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn config(&self) -> &PortPoolConfig {
        &self.config
    }

    /// Reserve the first free block for `run_id`.
    ///
    /// Fails with [`OrchestratorError::Capacity`] if no block fits; the caller
    /// decides what to do, nothing is retried here. Allocating twice for the
    /// same run returns the existing block.
    pub fn allocate(
        &self,
        run_id: RunId,
    ) -> Result<PortAllocation, OrchestratorError> {
        let mut state = self.state.lock();

        if let Some(existing) = state.assignments.get(&run_id) {
            return Ok(existing.clone());
        }

        let base = self.find_free_block(&state.in_use).ok_or(
            OrchestratorError::Capacity {
                needed: self.config.ports_per_run,
                start: self.config.start,
                end: self.config.end,
            },
        )?;

        let allocation = PortAllocation {
            run_id,
            host: self.config.host.clone(),
            base,
            count: self.config.ports_per_run,
            allocated_at: Utc::now(),
        };
        state.in_use.extend(allocation.ports());
        state.assignments.insert(run_id, allocation.clone());

        crate::telemetry::set_ports_allocated(state.in_use.len());
        tracing::debug!(
            run_id = %run_id,
            base = base,
            count = allocation.count,
            "ports allocated"
        );
        Ok(allocation)
    }

    /// Return a run's block to the pool. No-op for unknown runs.
    pub fn release(&self, run_id: RunId) -> Option<PortAllocation> {
        let mut state = self.state.lock();
        let allocation = state.assignments.remove(&run_id)?;
        for port in allocation.ports() {
            state.in_use.remove(&port);
        }

        crate::telemetry::set_ports_allocated(state.in_use.len());
        tracing::debug!(run_id = %run_id, base = allocation.base, "ports released");
        Some(allocation)
    }

    /// Current block for a run, if any.
    pub fn allocation(&self, run_id: RunId) -> Option<PortAllocation> {
        self.state.lock().assignments.get(&run_id).cloned()
    }

    /// Number of ports currently reserved.
    pub fn allocated_count(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Lowest base whose whole block lies in `[start, end)` and is free.
    fn find_free_block(&self, in_use: &BTreeSet<u16>) -> Option<u16> {
        let width = self.config.ports_per_run;
        let last_base = self.config.end.checked_sub(width)?;
        let mut base = self.config.start;

        while base <= last_base {
            // Jump past the highest taken port inside the candidate block.
            match in_use.range(base..base + width).next_back() {
                Some(&taken) => base = taken + 1,
                None => return Some(base),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(start: u16, end: u16, per_run: u16) -> PortAllocator {
        PortAllocator::new(PortPoolConfig {
            host: "127.0.0.1".into(),
            start,
            end,
            ports_per_run: per_run,
        })
    }

    fn overlaps(a: &PortAllocation, b: &PortAllocation) -> bool {
        a.ports().any(|port| b.ports().contains(&port))
    }

    #[test]
    fn test_live_allocations_are_disjoint() {
        let allocator = pool(6000, 6100, 9);
        let a = allocator.allocate(RunId::new()).unwrap();
        let b = allocator.allocate(RunId::new()).unwrap();

        assert_eq!(a.base, 6000);
        assert_eq!(b.base, 6009);
        assert!(!overlaps(&a, &b));
        assert_eq!(allocator.allocated_count(), 18);
    }

    #[test]
    fn test_released_ports_are_reused() {
        let allocator = pool(6000, 6100, 9);
        let run_a = RunId::new();
        let a = allocator.allocate(run_a).unwrap();
        let b = allocator.allocate(RunId::new()).unwrap();

        let released = allocator.release(run_a).unwrap();
        assert_eq!(released, a);
        assert!(allocator.allocation(run_a).is_none());

        let c = allocator.allocate(RunId::new()).unwrap();
        assert_eq!(c.base, a.base);
        assert!(!overlaps(&b, &c));
    }

    #[test]
    fn test_capacity_error_when_pool_exhausted() {
        // [7000, 7020) fits exactly two blocks of 9.
        let allocator = pool(7000, 7020, 9);
        allocator.allocate(RunId::new()).unwrap();
        let second = allocator.allocate(RunId::new()).unwrap();
        assert_eq!(second.ports().end, 7018);

        let err = allocator.allocate(RunId::new()).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Capacity {
                needed: 9,
                start: 7000,
                end: 7020
            }
        ));
    }

    #[test]
    fn test_block_may_end_exactly_at_pool_end() {
        let allocator = pool(7000, 7018, 9);
        allocator.allocate(RunId::new()).unwrap();
        let last = allocator.allocate(RunId::new()).unwrap();
        assert_eq!(last.base, 7009);
        assert_eq!(last.ports().end, 7018);
    }

    #[test]
    fn test_fragmented_pool_skips_small_gaps() {
        let allocator = pool(8000, 8030, 9);
        let first = RunId::new();
        allocator.allocate(first).unwrap(); // 8000..8009
        allocator.allocate(RunId::new()).unwrap(); // 8009..8018
        allocator.allocate(RunId::new()).unwrap(); // 8018..8027

        allocator.release(first);
        // Only 8000..8009 and 8027..8030 are free; the tail gap is too small.
        let reused = allocator.allocate(RunId::new()).unwrap();
        assert_eq!(reused.base, 8000);
        assert!(allocator.allocate(RunId::new()).is_err());
    }

    #[test]
    fn test_release_unknown_run_is_noop() {
        let allocator = pool(6000, 6100, 9);
        assert!(allocator.release(RunId::new()).is_none());
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn test_allocate_is_idempotent_per_run() {
        let allocator = pool(6000, 6100, 9);
        let run_id = RunId::new();
        let first = allocator.allocate(run_id).unwrap();
        let again = allocator.allocate(run_id).unwrap();
        assert_eq!(first, again);
        assert_eq!(allocator.allocated_count(), 9);
    }

    #[test]
    fn test_role_ports_follow_offsets() {
        let allocator = pool(6000, 6100, 9);
        let allocation = allocator.allocate(RunId::new()).unwrap();

        assert_eq!(allocation.port(EndpointRole::EventBusFrontend), Some(6000));
        assert_eq!(allocation.port(EndpointRole::CreditReturn), Some(6008));
        assert_eq!(allocation.metrics_port(), 6001);
        assert_eq!(allocation.metrics_endpoint(), "tcp://127.0.0.1:6001");

        let narrow = pool(6000, 6100, 2).allocate(RunId::new()).unwrap();
        assert_eq!(narrow.port(EndpointRole::EventBusBackend), Some(6001));
        assert_eq!(narrow.port(EndpointRole::Records), None);
    }

    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let allocator = pool(6000, 6999, 9);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| allocator.allocate(RunId::new()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let allocations: Vec<PortAllocation> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        let mut seen = BTreeSet::new();
        for allocation in &allocations {
            for port in allocation.ports() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 80 * 9);
    }
}

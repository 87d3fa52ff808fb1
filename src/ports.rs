//! Per-workspace port range allocation.
//!
//! Process-local and not persisted: scripts receive `AMUX_PORT` and
//! `AMUX_PORT_RANGE` as environment hints, not durable leases, so a
//! restart handing out a fresh assignment stream is fine.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::paths;

#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    pub start: u16,
    pub stride: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: 6200,
            stride: 10,
        }
    }
}

struct AllocState {
    cursor: u16,
    assigned: HashMap<String, u16>,
}

/// Hands out non-overlapping `[base, base+stride)` ranges keyed by the
/// normalized workspace root, stable across lookups. Released ranges are
/// never reused, so a stale consumer can't collide with a new one.
pub struct PortAllocator {
    stride: u16,
    state: Mutex<AllocState>,
}

impl PortAllocator {
    pub fn new(config: PortConfig) -> Self {
        Self {
            stride: config.stride.max(1),
            state: Mutex::new(AllocState {
                cursor: config.start,
                assigned: HashMap::new(),
            }),
        }
    }

    fn key(root: &str) -> String {
        paths::normalize(root)
    }

    /// Return the existing base for `root`, assigning the next range on
    /// first sight.
    pub fn allocate(&self, root: &str) -> u16 {
        let key = Self::key(root);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&base) = state.assigned.get(&key) {
            return base;
        }
        let base = state.cursor;
        state.cursor = state.cursor.saturating_add(self.stride);
        state.assigned.insert(key, base);
        base
    }

    /// Look up without allocating.
    pub fn get(&self, root: &str) -> Option<u16> {
        let key = Self::key(root);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.assigned.get(&key).copied()
    }

    /// Inclusive range `(base, base + stride - 1)`, allocating on demand.
    pub fn range(&self, root: &str) -> (u16, u16) {
        let base = self.allocate(root);
        (base, base.saturating_add(self.stride - 1))
    }

    /// Forget the mapping for `root`. The freed range is not reused.
    pub fn release(&self, root: &str) {
        let key = Self::key(root);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.assigned.remove(&key);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocator() -> PortAllocator {
        PortAllocator::new(PortConfig {
            start: 6200,
            stride: 10,
        })
    }

    #[test]
    fn assigns_sequential_ranges_and_is_stable() {
        let ports = allocator();
        assert_eq!(ports.allocate("/a"), 6200);
        assert_eq!(ports.allocate("/b"), 6210);
        assert_eq!(ports.allocate("/a"), 6200);
        assert_eq!(ports.range("/a"), (6200, 6209));
    }

    #[test]
    fn get_does_not_allocate() {
        let ports = allocator();
        assert_eq!(ports.get("/a"), None);
        ports.allocate("/a");
        assert_eq!(ports.get("/a"), Some(6200));
    }

    #[test]
    fn released_ranges_are_not_reused() {
        let ports = allocator();
        ports.allocate("/a");
        ports.release("/a");
        assert_eq!(ports.get("/a"), None);
        assert_eq!(ports.allocate("/b"), 6210);
        assert_eq!(ports.allocate("/a"), 6220);
    }

    #[test]
    fn equivalent_roots_share_a_range() {
        let ports = allocator();
        let a = ports.allocate("/nonexistent-amux/a");
        let b = ports.allocate("/nonexistent-amux/a/.");
        assert_eq!(a, b);
    }

    #[test]
    fn range_allocates_on_demand() {
        let ports = allocator();
        assert_eq!(ports.range("/c"), (6200, 6209));
        assert_eq!(ports.get("/c"), Some(6200));
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let ports = Arc::new(allocator());
        let mut handles = Vec::new();
        for i in 0..8 {
            let ports = Arc::clone(&ports);
            handles.push(std::thread::spawn(move || {
                ports.allocate(&format!("/nonexistent-amux/ws-{i}"))
            }));
        }
        let bases: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(bases.len(), 8);
        for base in &bases {
            assert_eq!((base - 6200) % 10, 0);
        }
    }
}

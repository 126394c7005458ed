//! Optional hook for allocation and dispatch events.

use crate::StorageType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationEvent {
    pub size: usize,
    pub storage_type: StorageType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    pub name: String,
    pub grid_size: [usize; 3],
    pub work_group_size: [usize; 3],
}

/// Receives notifications from the memory manager and execution tasks. Every method defaults to
/// doing nothing.
pub trait ExecutionObserver {
    fn on_allocation(&self, _event: &AllocationEvent) {}
    fn on_dispatch(&self, _event: &DispatchEvent) {}
}

//! Allocation facade.
//!
//! Runtime entries allocate through this facade; the collector itself is an
//! external collaborator reached via `collect_garbage`. The facade keeps
//! allocation and collection counts so tests and tracing can observe
//! safepoint-relevant activity.

use lumen_runtime::{Array, ArrayRef, ClassRef, Context, ContextRef, FunctionRef, Instance, InstanceRef};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which generation a collection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Scavenge of the young generation.
    New,
    /// Full collection.
    Old,
}

/// Per-isolate allocation facade.
#[derive(Debug, Default)]
pub struct Heap {
    allocations: AtomicU64,
    scavenges: AtomicU64,
    full_collections: AtomicU64,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn note_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocate an instance of `class` with null fields.
    pub fn allocate_instance(&self, class: &ClassRef) -> InstanceRef {
        self.note_allocation();
        Instance::new(class.id(), class.num_fields())
    }

    /// Allocate a closure over `function` capturing `context`.
    pub fn allocate_closure(&self, function: FunctionRef, context: ContextRef) -> InstanceRef {
        self.note_allocation();
        Instance::new_closure(function, context)
    }

    /// Allocate a fixed-length array of null elements.
    pub fn allocate_array(&self, len: usize) -> ArrayRef {
        self.note_allocation();
        Array::new(len)
    }

    /// Allocate a context with `num_variables` slots.
    pub fn allocate_context(&self, num_variables: usize) -> ContextRef {
        self.note_allocation();
        Context::new(num_variables)
    }

    /// Hand control to the collector.
    pub fn collect_garbage(&self, kind: GcKind) {
        match kind {
            GcKind::New => self.scavenges.fetch_add(1, Ordering::Relaxed),
            GcKind::Old => self.full_collections.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn scavenge_count(&self) -> u64 {
        self.scavenges.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn full_collection_count(&self) -> u64 {
        self.full_collections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_runtime::{ClassDecl, ClassTable};

    #[test]
    fn test_instance_allocation_counts() {
        let table = ClassTable::bootstrap();
        let cls = table.register(ClassDecl {
            name: "Point".into(),
            num_fields: 2,
            ..Default::default()
        });

        let heap = Heap::new();
        let inst = heap.allocate_instance(&cls);
        assert_eq!(inst.cid(), cls.id());
        assert_eq!(inst.num_fields(), 2);
        assert_eq!(heap.allocation_count(), 1);
    }

    #[test]
    fn test_collection_counters() {
        let heap = Heap::new();
        heap.collect_garbage(GcKind::New);
        heap.collect_garbage(GcKind::New);
        heap.collect_garbage(GcKind::Old);
        assert_eq!(heap.scavenge_count(), 2);
        assert_eq!(heap.full_collection_count(), 1);
    }

    #[test]
    fn test_array_and_context_allocation() {
        let heap = Heap::new();
        assert_eq!(heap.allocate_array(3).len(), 3);
        assert_eq!(heap.allocate_context(2).num_variables(), 2);
        assert_eq!(heap.allocation_count(), 2);
    }
}

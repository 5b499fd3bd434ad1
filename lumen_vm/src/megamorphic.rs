//! The megamorphic cache.
//!
//! Call sites whose inline cache has grown polyvariant dispatch through a
//! shared, growable hash table instead. One cache exists per (target name,
//! arguments descriptor) pair and maps receiver class id to resolved
//! target. The table of caches is isolate-owned.

use lumen_core::ids::ClassId;
use lumen_core::Symbol;
use lumen_runtime::{ArgsDescRef, FunctionRef};
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Initial bucket count (power of two).
const INITIAL_CAPACITY: usize = 16;

/// Grow when occupancy would exceed 3/4.
const LOAD_NUMERATOR: usize = 3;
const LOAD_DENOMINATOR: usize = 4;

#[inline]
fn bucket_hash(cid: ClassId) -> usize {
    let mut hasher = FxHasher::default();
    cid.0.hash(&mut hasher);
    hasher.finish() as usize
}

// =============================================================================
// Megamorphic cache
// =============================================================================

/// A growable (receiver class id -> target) table for one name/descriptor
/// pair.
pub struct MegamorphicCache {
    target_name: Symbol,
    args_descriptor: ArgsDescRef,
    buckets: RwLock<Vec<Option<(ClassId, FunctionRef)>>>,
}

impl MegamorphicCache {
    #[must_use]
    pub fn new(target_name: Symbol, args_descriptor: ArgsDescRef) -> Arc<Self> {
        Arc::new(Self {
            target_name,
            args_descriptor,
            buckets: RwLock::new(vec![None; INITIAL_CAPACITY]),
        })
    }

    #[inline]
    #[must_use]
    pub fn target_name(&self) -> &Symbol {
        &self.target_name
    }

    #[inline]
    #[must_use]
    pub fn args_descriptor(&self) -> &ArgsDescRef {
        &self.args_descriptor
    }

    /// Number of filled entries.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.buckets.read().iter().filter(|b| b.is_some()).count()
    }

    /// Current bucket count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buckets.read().len()
    }

    /// Look up the target cached for a receiver class.
    #[must_use]
    pub fn lookup(&self, cid: ClassId) -> Option<FunctionRef> {
        let buckets = self.buckets.read();
        let mask = buckets.len() - 1;
        let mut index = bucket_hash(cid) & mask;
        loop {
            match &buckets[index] {
                None => return None,
                Some((key, target)) if *key == cid => return Some(target.clone()),
                Some(_) => index = (index + 1) & mask,
            }
        }
    }

    /// Grow the table if one more insertion would exceed the load factor.
    pub fn ensure_capacity(&self) {
        let mut buckets = self.buckets.write();
        let filled = buckets.iter().filter(|b| b.is_some()).count();
        if (filled + 1) * LOAD_DENOMINATOR <= buckets.len() * LOAD_NUMERATOR {
            return;
        }
        let mut grown: Vec<Option<(ClassId, FunctionRef)>> = vec![None; buckets.len() * 2];
        let mask = grown.len() - 1;
        for entry in buckets.drain(..) {
            if let Some((cid, target)) = entry {
                let mut index = bucket_hash(cid) & mask;
                while grown[index].is_some() {
                    index = (index + 1) & mask;
                }
                grown[index] = Some((cid, target));
            }
        }
        *buckets = grown;
    }

    /// Insert or overwrite the target for a receiver class. Call
    /// `ensure_capacity` first.
    pub fn insert(&self, cid: ClassId, target: FunctionRef) {
        let mut buckets = self.buckets.write();
        let mask = buckets.len() - 1;
        let mut index = bucket_hash(cid) & mask;
        loop {
            match &buckets[index] {
                None => {
                    buckets[index] = Some((cid, target));
                    return;
                }
                Some((key, _)) if *key == cid => {
                    buckets[index] = Some((cid, target));
                    return;
                }
                Some(_) => index = (index + 1) & mask,
            }
        }
    }
}

impl fmt::Debug for MegamorphicCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MegamorphicCache")
            .field("target_name", &self.target_name.as_str())
            .field("filled", &self.filled())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// Cache table
// =============================================================================

/// The isolate's table of megamorphic caches, one per (name, descriptor).
#[derive(Default)]
pub struct MegamorphicTable {
    caches: RwLock<Vec<Arc<MegamorphicCache>>>,
}

impl MegamorphicTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the cache for a name/descriptor pair, creating it on first use.
    pub fn lookup(&self, name: &Symbol, desc: &ArgsDescRef) -> Arc<MegamorphicCache> {
        {
            let caches = self.caches.read();
            if let Some(cache) = caches
                .iter()
                .find(|c| c.target_name() == name && *c.args_descriptor().as_ref() == **desc)
            {
                return cache.clone();
            }
        }
        let mut caches = self.caches.write();
        if let Some(cache) = caches
            .iter()
            .find(|c| c.target_name() == name && *c.args_descriptor().as_ref() == **desc)
        {
            return cache.clone();
        }
        let cache = MegamorphicCache::new(name.clone(), desc.clone());
        caches.push(cache.clone());
        cache
    }

    /// Number of distinct caches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }
}

impl fmt::Debug for MegamorphicTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MegamorphicTable")
            .field("caches", &self.len())
            .finish()
    }
}

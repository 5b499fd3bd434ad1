//! Guarded fields: per-field class-id and length feedback.
//!
//! Compiled code guards loads from a field on the class (and, for
//! length-bearing classes, the length) of the values previously stored to
//! it. The out-of-line feedback entry narrows the guard when the inline
//! fast path observes a mismatch: unknown widens to monomorphic, a second
//! class widens to polymorphic, and a second length drops the length guard.

use crate::value::Value;
use lumen_core::ids::ClassId;
use lumen_core::Symbol;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

pub type FieldRef = Arc<Field>;

/// Length guard sentinel: no store observed yet.
pub const GUARD_LENGTH_UNKNOWN: i64 = -2;
/// Length guard sentinel: stored values have no usable fixed length.
pub const GUARD_LENGTH_NONE: i64 = -1;

const GUARD_CID_UNKNOWN: u32 = 0;
const GUARD_CID_POLYMORPHIC: u32 = u32::MAX;

/// Snapshot of a field's guard state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldGuard {
    /// The field was never stored to.
    Unknown,
    /// All observed stores shared one class.
    Monomorphic(ClassId),
    /// Stores of more than one class were observed.
    Polymorphic,
}

/// A field with store-site feedback.
pub struct Field {
    name: Symbol,
    owner: ClassId,
    guarded_cid: AtomicU32,
    guarded_length: AtomicI64,
}

impl Field {
    #[must_use]
    pub fn new(name: Symbol, owner: ClassId) -> FieldRef {
        Arc::new(Self {
            name,
            owner,
            guarded_cid: AtomicU32::new(GUARD_CID_UNKNOWN),
            guarded_length: AtomicI64::new(GUARD_LENGTH_UNKNOWN),
        })
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> ClassId {
        self.owner
    }

    /// Current class-id guard.
    #[must_use]
    pub fn guard(&self) -> FieldGuard {
        match self.guarded_cid.load(Ordering::Acquire) {
            GUARD_CID_UNKNOWN => FieldGuard::Unknown,
            GUARD_CID_POLYMORPHIC => FieldGuard::Polymorphic,
            cid => FieldGuard::Monomorphic(ClassId(cid)),
        }
    }

    /// Current length guard: a concrete length, or one of the sentinels.
    #[inline]
    #[must_use]
    pub fn guarded_length(&self) -> i64 {
        self.guarded_length.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_monomorphic(&self) -> bool {
        matches!(self.guard(), FieldGuard::Monomorphic(_))
    }

    /// Narrow the guard with an observed store of `value`.
    pub fn update_guarded(&self, value: &Value) {
        let cid = value.class_id();
        let length = value.guard_length();

        match self.guard() {
            FieldGuard::Unknown => {
                self.guarded_cid.store(cid.0, Ordering::Release);
                self.guarded_length.store(length, Ordering::Release);
            }
            FieldGuard::Monomorphic(seen) if seen == cid => {
                // Same class; the length may still disagree.
                let guarded = self.guarded_length();
                if guarded != length {
                    self.guarded_length.store(GUARD_LENGTH_NONE, Ordering::Release);
                }
            }
            FieldGuard::Monomorphic(_) => {
                self.guarded_cid.store(GUARD_CID_POLYMORPHIC, Ordering::Release);
                self.guarded_length.store(GUARD_LENGTH_NONE, Ordering::Release);
            }
            FieldGuard::Polymorphic => {}
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name.as_str())
            .field("guard", &self.guard())
            .field("guarded_length", &self.guarded_length())
            .finish()
    }
}

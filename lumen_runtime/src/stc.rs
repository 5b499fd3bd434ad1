//! The subtype-test cache.
//!
//! An append-only list of `(instance class id, instance type args,
//! instantiator type args, result)` tuples attached to one type-test site.
//! Keys compare by *identity*: the type engine canonicalizes vectors before
//! touching the cache, so structurally equal vectors are pointer equal.
//! The engine enforces the entry cap and the no-lazy-keys rule; this type
//! only stores.

use crate::types::{opt_args_identical, TypeArgsRef};
use lumen_core::ids::ClassId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

pub type StcRef = Arc<SubtypeTestCache>;

/// One cached subtype test.
#[derive(Debug, Clone)]
pub struct StcCheck {
    pub instance_class_id: ClassId,
    pub instance_type_args: Option<TypeArgsRef>,
    pub instantiator_type_args: Option<TypeArgsRef>,
    pub result: bool,
}

/// Append-only cache of subtype-test outcomes for one call site.
pub struct SubtypeTestCache {
    checks: RwLock<Vec<StcCheck>>,
}

impl SubtypeTestCache {
    #[must_use]
    pub fn new() -> StcRef {
        Arc::new(Self {
            checks: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn number_of_checks(&self) -> usize {
        self.checks.read().len()
    }

    /// The i-th check, in insertion order.
    #[must_use]
    pub fn check_at(&self, index: usize) -> Option<StcCheck> {
        self.checks.read().get(index).cloned()
    }

    /// Find the cached result for an identity-matching key triple.
    #[must_use]
    pub fn find(
        &self,
        instance_class_id: ClassId,
        instance_type_args: Option<&TypeArgsRef>,
        instantiator_type_args: Option<&TypeArgsRef>,
    ) -> Option<bool> {
        self.checks
            .read()
            .iter()
            .find(|c| {
                c.instance_class_id == instance_class_id
                    && opt_args_identical(c.instance_type_args.as_ref(), instance_type_args)
                    && opt_args_identical(
                        c.instantiator_type_args.as_ref(),
                        instantiator_type_args,
                    )
            })
            .map(|c| c.result)
    }

    /// Append a check. The caller has already ruled out duplicates and
    /// enforced the cap.
    pub fn add_check(
        &self,
        instance_class_id: ClassId,
        instance_type_args: Option<TypeArgsRef>,
        instantiator_type_args: Option<TypeArgsRef>,
        result: bool,
    ) {
        debug_assert!(instance_type_args.as_ref().map_or(true, |a| !a.is_lazy()));
        debug_assert!(instantiator_type_args.as_ref().map_or(true, |a| !a.is_lazy()));
        self.checks.write().push(StcCheck {
            instance_class_id,
            instance_type_args,
            instantiator_type_args,
            result,
        });
    }
}

impl fmt::Debug for SubtypeTestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubtypeTestCache")
            .field("number_of_checks", &self.number_of_checks())
            .finish()
    }
}

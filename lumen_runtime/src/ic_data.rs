//! Per-call-site inline-cache records.
//!
//! An `IcData` belongs to one instance-call site. It remembers the call's
//! target name and argument shape, and accumulates *checks*: observed
//! class-id vectors mapped to the resolved target, in miss order. A site
//! testing one argument records receiver classes; operator sites test two
//! or three.

use crate::args_desc::ArgsDescRef;
use crate::function::FunctionRef;
use lumen_core::ids::ClassId;
use lumen_core::Symbol;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

pub type IcDataRef = Arc<IcData>;

/// Class-id vector of one check. Almost always one or two entries.
pub type CidVector = SmallVec<[ClassId; 2]>;

/// One recorded (class ids -> target) entry.
#[derive(Debug, Clone)]
pub struct IcCheck {
    pub class_ids: CidVector,
    pub target: FunctionRef,
    /// Per-target hit counter, maintained by the dispatch stubs.
    pub count: u32,
}

/// Inline-cache data for one call site.
pub struct IcData {
    target_name: Symbol,
    args_descriptor: ArgsDescRef,
    num_args_tested: usize,
    checks: RwLock<Vec<IcCheck>>,
}

impl IcData {
    /// Create IC data testing `num_args_tested` arguments (1 to 3).
    #[must_use]
    pub fn new(target_name: Symbol, args_descriptor: ArgsDescRef, num_args_tested: usize) -> IcDataRef {
        assert!((1..=3).contains(&num_args_tested));
        Arc::new(Self {
            target_name,
            args_descriptor,
            num_args_tested,
            checks: RwLock::new(Vec::new()),
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

    #[inline]
    #[must_use]
    pub fn num_args_tested(&self) -> usize {
        self.num_args_tested
    }

    #[must_use]
    pub fn number_of_checks(&self) -> usize {
        self.checks.read().len()
    }

    /// Record a receiver-class check. Only valid on 1-argument sites.
    pub fn add_receiver_check(&self, receiver_cid: ClassId, target: FunctionRef) {
        assert_eq!(self.num_args_tested, 1);
        let mut cids = CidVector::new();
        cids.push(receiver_cid);
        self.push_check(cids, target);
    }

    /// Record a check. The vector length must equal `num_args_tested`.
    pub fn add_check(&self, class_ids: CidVector, target: FunctionRef) {
        assert_eq!(class_ids.len(), self.num_args_tested);
        self.push_check(class_ids, target);
    }

    fn push_check(&self, class_ids: CidVector, target: FunctionRef) {
        self.checks.write().push(IcCheck {
            class_ids,
            target,
            count: 0,
        });
    }

    /// Target of the i-th check, in insertion order.
    #[must_use]
    pub fn target_at(&self, index: usize) -> Option<FunctionRef> {
        self.checks.read().get(index).map(|c| c.target.clone())
    }

    /// Target previously recorded for a receiver class, if any.
    #[must_use]
    pub fn target_for_receiver_class_id(&self, receiver_cid: ClassId) -> Option<FunctionRef> {
        self.checks
            .read()
            .iter()
            .find(|c| c.class_ids.first() == Some(&receiver_cid))
            .map(|c| c.target.clone())
    }

    /// Bump the hit counter of the check matching `class_ids`.
    pub fn record_hit(&self, class_ids: &[ClassId]) {
        let mut checks = self.checks.write();
        if let Some(check) = checks.iter_mut().find(|c| c.class_ids.as_slice() == class_ids) {
            check.count = check.count.saturating_add(1);
        }
    }

    /// Snapshot of all checks, in insertion order.
    #[must_use]
    pub fn checks(&self) -> Vec<IcCheck> {
        self.checks.read().clone()
    }
}

impl fmt::Debug for IcData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcData")
            .field("target_name", &self.target_name.as_str())
            .field("num_args_tested", &self.num_args_tested)
            .field("number_of_checks", &self.number_of_checks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args_desc::ArgsDescriptor;
    use crate::function::{Function, FunctionKind};
    use lumen_core::symbol;
    use smallvec::smallvec;

    fn target(name: &str) -> FunctionRef {
        Function::new(symbol::intern(name), ClassId(20), FunctionKind::Regular, 1)
    }

    fn one_arg_ic() -> IcDataRef {
        IcData::new(symbol::intern("frob"), ArgsDescriptor::positional(1), 1)
    }

    #[test]
    fn test_new_ic_is_empty() {
        let ic = one_arg_ic();
        assert_eq!(ic.number_of_checks(), 0);
        assert_eq!(ic.num_args_tested(), 1);
    }

    #[test]
    #[should_panic]
    fn test_zero_args_tested_rejected() {
        IcData::new(symbol::intern("x"), ArgsDescriptor::positional(1), 0);
    }

    #[test]
    fn test_receiver_check_shape() {
        let ic = one_arg_ic();
        let t = target("frob");
        ic.add_receiver_check(ClassId(21), t.clone());

        let checks = ic.checks();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].class_ids.as_slice(), &[ClassId(21)]);
        assert!(Arc::ptr_eq(&checks[0].target, &t));
    }

    #[test]
    #[should_panic]
    fn test_check_length_must_match() {
        let ic = one_arg_ic();
        ic.add_check(smallvec![ClassId(1), ClassId(2)], target("frob"));
    }

    #[test]
    fn test_two_arg_checks() {
        let ic = IcData::new(symbol::intern("+"), ArgsDescriptor::positional(2), 2);
        ic.add_check(smallvec![ClassId(3), ClassId(3)], target("+"));
        ic.add_check(smallvec![ClassId(3), ClassId(4)], target("+"));
        assert_eq!(ic.number_of_checks(), 2);
        for check in ic.checks() {
            assert_eq!(check.class_ids.len(), 2);
        }
    }

    #[test]
    fn test_target_for_receiver_class_id() {
        let ic = one_arg_ic();
        let a = target("a");
        let b = target("b");
        ic.add_receiver_check(ClassId(21), a.clone());
        ic.add_receiver_check(ClassId(22), b.clone());

        assert!(Arc::ptr_eq(
            &ic.target_for_receiver_class_id(ClassId(21)).unwrap(),
            &a
        ));
        assert!(Arc::ptr_eq(
            &ic.target_for_receiver_class_id(ClassId(22)).unwrap(),
            &b
        ));
        assert!(ic.target_for_receiver_class_id(ClassId(99)).is_none());
    }

    #[test]
    fn test_record_hit() {
        let ic = one_arg_ic();
        ic.add_receiver_check(ClassId(21), target("frob"));
        ic.record_hit(&[ClassId(21)]);
        ic.record_hit(&[ClassId(21)]);
        ic.record_hit(&[ClassId(99)]); // No matching check; ignored.

        assert_eq!(ic.checks()[0].count, 2);
    }
}

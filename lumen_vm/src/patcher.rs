//! Call-site rewriting over modeled instruction blobs.
//!
//! The assembler-level patcher is a collaborator with four operations:
//! rewrite a static call's target, insert a call (lazy-deopt scheduling),
//! and read back the current target of a site. The patcher front-end
//! entries (`entries::patching`) decide *what* to patch; this module is the
//! narrow mechanism.

use lumen_core::ids::Address;
use lumen_runtime::{CodeRef, FunctionRef};

/// Rewrite the static call at `pc` inside `caller_code` to enter
/// `new_target`.
pub fn patch_static_call_at(pc: Address, caller_code: &CodeRef, new_target: Address) {
    debug_assert!(caller_code.instructions().contains(pc));
    caller_code.instructions().set_call_target(pc, new_target);
}

/// Insert (or rewrite) a call at `pc` to `target`. Used to point a
/// deoptimizing frame's return site at the lazy-deopt trampoline.
pub fn insert_call_at(code: &CodeRef, pc: Address, target: Address) {
    code.instructions().set_call_target(pc, target);
}

/// The entry point the static call at `pc` currently targets.
#[must_use]
pub fn static_call_target_at(pc: Address, code: &CodeRef) -> Option<Address> {
    code.instructions().call_target_at(pc)
}

/// The function an unoptimized static call site resolves to.
#[must_use]
pub fn unoptimized_static_call_at(pc: Address, code: &CodeRef) -> Option<FunctionRef> {
    debug_assert!(!code.is_optimized());
    code.static_call_function_at(pc)
}

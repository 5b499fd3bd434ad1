//! Object model for the Lumen VM.
//!
//! Defines the managed entities the runtime-entry core operates on:
//! classes and the class table, functions and their code objects, tagged
//! values, type-argument vectors with canonicalization, per-call-site
//! inline-cache records, subtype-test caches, and guarded fields.
//!
//! Storage layout and garbage collection are out of scope; every entity is
//! reference counted and mutated through interior locks, matching the
//! single-mutator-per-isolate execution model.

pub mod args_desc;
pub mod class;
pub mod code;
pub mod field;
pub mod function;
pub mod ic_data;
pub mod instance;
pub mod stc;
pub mod types;
pub mod value;

pub use args_desc::{ArgsDescRef, ArgsDescriptor};
pub use class::{cids, Class, ClassDecl, ClassRef, ClassTable, DispatcherKind};
pub use code::{
    Code, CodeRef, DeoptDescriptor, DeoptInstr, DeoptReason, Instructions, MaterializationSpec,
};
pub use field::{Field, FieldGuard, FieldRef};
pub use function::{Function, FunctionKind, FunctionRef};
pub use ic_data::{IcCheck, IcData, IcDataRef};
pub use instance::{Array, ArrayRef, Context, ContextRef, Instance, InstanceRef};
pub use stc::{StcCheck, StcRef, SubtypeTestCache};
pub use types::{Type, TypeArgs, TypeArgsInterner, TypeArgsRef};
pub use value::Value;

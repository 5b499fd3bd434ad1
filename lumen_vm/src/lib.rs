//! Runtime-entry core of the Lumen VM.
//!
//! The narrow, hot set of services compiled code calls back into when it
//! cannot finish an operation inline:
//!
//! - Inline-cache miss handling and polymorphic dispatch, escalating to a
//!   megamorphic cache (`entries::ic_miss`, `megamorphic`)
//! - Type-test acceleration via the subtype-test cache, with
//!   canonicalization of type-argument vectors (`entries::typecheck`)
//! - Adaptive optimization, on-stack replacement, and three-phase lazy
//!   deoptimization (`entries::optimize`, `deopt`)
//! - Static-call-site patching (`entries::patching`, `patcher`)
//!
//! Control flow is call-in, return-out: generated code calls an entry with
//! arguments in a well-known array, the entry runs on the same mutator
//! thread, and generated code resumes on return. The core owns no
//! background work; the compiler, debugger, garbage collector, and managed
//! re-entry are collaborators behind the traits in `hooks`.

pub mod arguments;
pub mod deopt;
pub mod entries;
pub mod exceptions;
pub mod heap;
pub mod hooks;
pub mod isolate;
pub mod megamorphic;
pub mod patcher;
pub mod resolver;
pub mod stack;

pub use arguments::NativeArguments;
pub use exceptions::{EntryResult, Unwind};
pub use isolate::{Isolate, InterruptBits};
pub use stack::{ManagedFrameIterator, Frame, FrameId, FrameKind, FrameStack};

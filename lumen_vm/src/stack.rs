//! The managed frame stack and its walker.
//!
//! Frames are modeled records: program counter, stack pointer, owning code,
//! and the slot array holding locals and expression stack. The walker
//! iterates from the top of the stack downwards, yielding managed frames
//! only; stub, entry, and exit frames are skipped. It takes no locks other
//! than the read guard it holds and performs no heap allocation per step,
//! so it is safe to use during the GC-disabled deopt copy phase.

use lumen_core::ids::{Address, TokenPos};
use lumen_runtime::{CodeRef, Value};
use parking_lot::{RwLock, RwLockReadGuard};

/// Index of a frame in the stack; stable while the frame is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

/// What kind of frame this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A frame of managed code.
    Managed,
    /// A VM stub frame.
    Stub,
    /// The frame that entered managed execution.
    Entry,
    /// A frame that exited to native code.
    Exit,
}

/// One frame record.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub pc: Address,
    /// Stack pointer; the stack grows towards lower addresses.
    pub sp: u64,
    pub code: Option<CodeRef>,
    pub return_address: Address,
    /// Locals and expression stack, bottom to top.
    pub slots: Vec<Value>,
    pub token_pos: TokenPos,
}

impl Frame {
    /// A managed frame executing `code` at `pc`.
    #[must_use]
    pub fn managed(code: &CodeRef, pc: Address, sp: u64) -> Self {
        debug_assert!(code.instructions().contains(pc));
        Self {
            kind: FrameKind::Managed,
            pc,
            sp,
            code: Some(code.clone()),
            return_address: Address::ZERO,
            slots: Vec::new(),
            token_pos: TokenPos::NONE,
        }
    }

    #[must_use]
    pub fn stub(sp: u64) -> Self {
        Self::bare(FrameKind::Stub, sp)
    }

    #[must_use]
    pub fn entry(sp: u64) -> Self {
        Self::bare(FrameKind::Entry, sp)
    }

    #[must_use]
    pub fn exit(sp: u64) -> Self {
        Self::bare(FrameKind::Exit, sp)
    }

    fn bare(kind: FrameKind, sp: u64) -> Self {
        Self {
            kind,
            pc: Address::ZERO,
            sp,
            code: None,
            return_address: Address::ZERO,
            slots: Vec::new(),
            token_pos: TokenPos::NONE,
        }
    }

    #[must_use]
    pub fn with_slots(mut self, slots: Vec<Value>) -> Self {
        self.slots = slots;
        self
    }

    #[must_use]
    pub fn with_token_pos(mut self, token_pos: TokenPos) -> Self {
        self.token_pos = token_pos;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_managed_frame(&self) -> bool {
        self.kind == FrameKind::Managed
    }

    /// The code object this managed frame runs.
    #[must_use]
    pub fn lookup_code(&self) -> CodeRef {
        self.code.clone().expect("frame has no code object")
    }
}

/// The per-isolate stack of managed and VM frames.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: RwLock<Vec<Frame>>,
}

impl FrameStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Frame) -> FrameId {
        let mut frames = self.frames.write();
        frames.push(frame);
        FrameId(frames.len() - 1)
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.write().pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    /// Snapshot one frame.
    #[must_use]
    pub fn frame(&self, id: FrameId) -> Frame {
        self.frames.read()[id.0].clone()
    }

    /// Rewrite a frame's pc (OSR entry installation).
    pub fn set_pc(&self, id: FrameId, pc: Address) {
        self.frames.write()[id.0].pc = pc;
    }

    /// Rewrite a frame's return address (lazy-deopt scheduling).
    pub fn set_return_address(&self, id: FrameId, address: Address) {
        self.frames.write()[id.0].return_address = address;
    }

    /// Replace a frame wholesale (deopt fill phase).
    pub fn replace(&self, id: FrameId, frame: Frame) {
        self.frames.write()[id.0] = frame;
    }

    /// Patch one slot of a frame (deopt materialize phase).
    pub fn set_slot(&self, id: FrameId, index: usize, value: Value) {
        self.frames.write()[id.0].slots[index] = value;
    }

    /// The topmost managed frame, if any.
    #[must_use]
    pub fn top_managed_frame(&self) -> Option<(FrameId, Frame)> {
        let mut iterator = ManagedFrameIterator::new(self);
        iterator.next_frame()
    }

    /// The topmost frame that is neither a stub nor an exit frame.
    ///
    /// This is the walk the stale-static-call entry performs: past the
    /// patching stub and the exit frame to whatever called through them.
    #[must_use]
    pub fn first_non_stub_frame(&self) -> Option<(FrameId, Frame)> {
        let frames = self.frames.read();
        for index in (0..frames.len()).rev() {
            match frames[index].kind {
                FrameKind::Stub | FrameKind::Exit => continue,
                _ => return Some((FrameId(index), frames[index].clone())),
            }
        }
        None
    }
}

/// Forward iterator over managed frames, topmost first.
pub struct ManagedFrameIterator<'a> {
    guard: RwLockReadGuard<'a, Vec<Frame>>,
    /// Number of frames not yet visited (iteration runs top-down).
    remaining: usize,
}

impl<'a> ManagedFrameIterator<'a> {
    /// Start at the topmost frame.
    #[must_use]
    pub fn new(stack: &'a FrameStack) -> Self {
        let guard = stack.frames.read();
        let remaining = guard.len();
        Self { guard, remaining }
    }

    /// Start at a caller-supplied frame (deopt walks from the saved fp).
    #[must_use]
    pub fn starting_at(stack: &'a FrameStack, id: FrameId) -> Self {
        let guard = stack.frames.read();
        let remaining = (id.0 + 1).min(guard.len());
        Self { guard, remaining }
    }

    /// The next managed frame, walking towards the stack base.
    pub fn next_frame(&mut self) -> Option<(FrameId, Frame)> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let frame = &self.guard[self.remaining];
            if frame.is_managed_frame() {
                return Some((FrameId(self.remaining), frame.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_runtime::Code;

    fn managed_frame(sp: u64) -> Frame {
        let code = Code::new_unoptimized(64);
        Frame::managed(&code, code.entry_point(), sp)
    }

    #[test]
    fn test_push_pop() {
        let stack = FrameStack::new();
        assert!(stack.is_empty());
        let id = stack.push(managed_frame(0x1000));
        assert_eq!(id, FrameId(0));
        assert_eq!(stack.len(), 1);
        assert!(stack.pop().is_some());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_walker_skips_non_managed_frames() {
        let stack = FrameStack::new();
        stack.push(Frame::entry(0x4000));
        let bottom = stack.push(managed_frame(0x3000));
        stack.push(Frame::stub(0x2000));
        let top = stack.push(managed_frame(0x1000));

        let mut walker = ManagedFrameIterator::new(&stack);
        assert_eq!(walker.next_frame().unwrap().0, top);
        assert_eq!(walker.next_frame().unwrap().0, bottom);
        assert!(walker.next_frame().is_none());
    }

    #[test]
    fn test_walker_starting_at() {
        let stack = FrameStack::new();
        let bottom = stack.push(managed_frame(0x3000));
        let middle = stack.push(managed_frame(0x2000));
        stack.push(managed_frame(0x1000));

        let mut walker = ManagedFrameIterator::starting_at(&stack, middle);
        assert_eq!(walker.next_frame().unwrap().0, middle);
        assert_eq!(walker.next_frame().unwrap().0, bottom);
        assert!(walker.next_frame().is_none());
    }

    #[test]
    fn test_first_non_stub_frame_skips_stub_and_exit() {
        let stack = FrameStack::new();
        let managed = stack.push(managed_frame(0x3000));
        stack.push(Frame::exit(0x2000));
        stack.push(Frame::stub(0x1000));

        let (id, frame) = stack.first_non_stub_frame().unwrap();
        assert_eq!(id, managed);
        assert!(frame.is_managed_frame());
    }

    #[test]
    fn test_set_pc_and_return_address() {
        let stack = FrameStack::new();
        let code = Code::new_unoptimized(64);
        let id = stack.push(Frame::managed(&code, code.entry_point(), 0x1000));

        stack.set_pc(id, code.entry_point().offset(4));
        stack.set_return_address(id, Address(0xabc0));

        let frame = stack.frame(id);
        assert_eq!(frame.pc, code.entry_point().offset(4));
        assert_eq!(frame.return_address, Address(0xabc0));
    }

    #[test]
    fn test_replace_frame() {
        let stack = FrameStack::new();
        let id = stack.push(managed_frame(0x1000));
        let replacement = managed_frame(0x1000).with_slots(vec![Value::Smi(1)]);
        stack.replace(id, replacement);
        assert_eq!(stack.frame(id).slots.len(), 1);
    }
}

//! SSA form: values, blocks, and the function arena that owns them.
//!
//! Values and blocks are arena-allocated entities keyed by dense ids; value
//! argument lists are id references with explicitly maintained use counts.
//! Blocks hold forward edges; predecessor lists are stored redundantly and
//! kept reciprocal with the successor lists.

pub mod builder;
pub mod passes;
pub mod verify;

use crate::entity::{EntityRef, PrimaryMap, entity_impl};
use crate::isa::Reg;
use crate::srcloc::SourceLoc;
use crate::types::Type;
use smallvec::SmallVec;

/// An SSA value id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An SSA block id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "b");

/// SSA operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Placeholder for a read of a local whose definition is not yet known.
    /// All of these are resolved into phis or copies before verification;
    /// `aux` carries the local index.
    FwdRef,
    /// Join of the values flowing in from each predecessor, in predecessor
    /// order.
    Phi,
    /// Identity copy of `args[0]`.
    Copy,
    /// Capture of the physical argument register numbered `aux` at entry.
    Arg,
    /// Capture of the hidden return pointer register at entry.
    RetPtr,

    /// Integer constant in `aux`.
    ConstInt,
    /// Boolean constant in `aux`.
    ConstBool,
    /// Null pointer.
    ConstNil,
    /// Float constant; `aux` holds the bit pattern.
    ConstFloat,
    /// String literal; `aux` indexes the function string table. Eliminated
    /// by aggregate decomposition.
    ConstStr,
    /// Address of string literal `aux`. Survives to emission, where it
    /// becomes a data-section relocation.
    ConstStrPtr,

    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Shift left; constant shift amounts live in `aux` when `args` has one
    /// element.
    Shl,
    /// Shift right, arithmetic for signed operand types.
    Shr,
    /// Negation.
    Neg,
    /// Complement.
    Not,

    /// Equality comparison.
    Eq,
    /// Inequality comparison.
    Ne,
    /// Less-than.
    Lt,
    /// Less-or-equal.
    Le,
    /// Greater-than.
    Gt,
    /// Greater-or-equal.
    Ge,

    /// Load of this value's type from the address in `args[0]`.
    Load,
    /// Store `args[1]` to the address in `args[0]`.
    Store,
    /// Copy `aux` bytes from the address in `args[1]` to the address in
    /// `args[0]`.
    Move,

    /// Address of the stack slot for local `aux`.
    LocalAddr,
    /// Address of the global named by `sym`.
    GlobalAddr,
    /// Address of the function named by `sym`.
    FuncAddr,
    /// `args[0] + aux`.
    OffPtr,
    /// `args[0] + args[1]` where `args[1]` is a byte offset.
    AddPtr,

    /// Direct call of `sym`; `args` are the operands.
    Call,
    /// Indirect call; `args[0]` is the callee pointer.
    CallIndirect,
    /// Projection of result register `aux` of the call in `args[0]`.
    SelectN,

    /// Build a string from (ptr, len) in `args`.
    StringMake,
    /// Pointer component of the string in `args[0]`.
    StringPtr,
    /// Length component of the string in `args[0]`.
    StringLen,
    /// Build a slice from (ptr, len) in `args`.
    SliceMake,
    /// Pointer component of the slice in `args[0]`.
    SlicePtr,
    /// Length component of the slice in `args[0]`.
    SliceLen,

    /// `args[0] ? args[1] : args[2]`.
    Select,
    /// Integer conversion of `args[0]` to this value's type.
    Convert,

    /// Reload of a spilled value; inserted by the register allocator.
    LoadReg,
    /// Spill of `args[0]` to its stack home; inserted by the register
    /// allocator.
    StoreReg,
}

impl Op {
    /// Can this value be recomputed at a use instead of being kept in a
    /// register or spilled? Rematerializable values are permitted to carry
    /// no home after allocation.
    pub fn is_rematerializable(self) -> bool {
        matches!(
            self,
            Self::ConstInt
                | Self::ConstBool
                | Self::ConstNil
                | Self::ConstFloat
                | Self::ConstStrPtr
                | Self::LocalAddr
                | Self::GlobalAddr
                | Self::FuncAddr
        )
    }

    /// Does this op read or write memory? Used for scheduling edges.
    pub fn is_store(self) -> bool {
        matches!(self, Self::Store | Self::Move | Self::StoreReg)
    }

    /// Is this a call of either flavor?
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::CallIndirect)
    }
}

/// Where a value lives after register allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Home {
    /// A physical register.
    Reg(Reg),
    /// A frame-pointer-relative stack offset.
    Stack(i32),
}

/// The payload of one SSA value.
#[derive(Clone)]
pub struct ValueData {
    /// The operation.
    pub op: Op,
    /// Result type.
    pub ty: Type,
    /// Ordered arguments; edits go through `Func::add_arg` / `reset_args`.
    pub args: SmallVec<[Value; 4]>,
    /// 64-bit auxiliary.
    pub aux: i64,
    /// Symbol auxiliary for calls and global references.
    pub sym: Option<String>,
    /// The block this value belongs to.
    pub block: Block,
    /// Number of references from argument lists and control slots.
    pub uses: u32,
    /// Assigned location, if any.
    pub home: Option<Home>,
    /// Source position.
    pub loc: SourceLoc,
}

/// Block kinds; the kind determines the terminator shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// The function entry; transfers to its single successor.
    Entry,
    /// Transfers to its single successor.
    Plain,
    /// Two successors selected by the boolean control value: taken first,
    /// not-taken second.
    If,
    /// Function return; the control value, when present, is the returned
    /// value.
    Ret,
}

/// The payload of one SSA block.
#[derive(Clone)]
pub struct BlockData {
    /// The kind, which fixes the terminator shape.
    pub kind: BlockKind,
    /// Values in order. After scheduling this is the emission order.
    pub values: Vec<Value>,
    /// Successor blocks, at most two.
    pub succs: SmallVec<[Block; 2]>,
    /// Predecessor blocks. Kept reciprocal with `succs`.
    pub preds: SmallVec<[Block; 2]>,
    /// Control values: the condition for `If`, the returned value for `Ret`.
    pub ctrl: SmallVec<[Value; 2]>,
}

impl BlockData {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
            succs: SmallVec::new(),
            preds: SmallVec::new(),
            ctrl: SmallVec::new(),
        }
    }
}

/// A stack slot for a named local, laid out by the register allocator.
#[derive(Clone, Debug)]
pub struct LocalSlot {
    /// The local's name, for tracing.
    pub name: String,
    /// Byte size.
    pub size: u32,
    /// Frame-pointer-relative offset; assigned during frame layout.
    pub offset: i32,
}

/// An SSA function.
pub struct Func {
    /// Function name.
    pub name: String,
    /// All values.
    pub values: PrimaryMap<Value, ValueData>,
    /// All blocks.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// The entry block.
    pub entry: Block,
    /// Return type.
    pub ret_ty: Type,
    /// Stack slots for named locals, indexed by IR local number.
    pub slots: Vec<LocalSlot>,
    /// String literals, carried over from the IR function.
    pub strings: Vec<String>,
    /// Referenced globals, carried over from the IR function.
    pub globals: Vec<String>,
    /// Total frame size in bytes; assigned after allocation.
    pub frame_size: u32,
}

impl Func {
    /// Create a function with a fresh entry block.
    pub fn new(name: impl Into<String>, ret_ty: Type) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData::new(BlockKind::Entry));
        Self {
            name: name.into(),
            values: PrimaryMap::new(),
            blocks,
            entry,
            ret_ty,
            slots: Vec::new(),
            strings: Vec::new(),
            globals: Vec::new(),
            frame_size: 0,
        }
    }

    /// Create a new block of the given kind.
    pub fn add_block(&mut self, kind: BlockKind) -> Block {
        self.blocks.push(BlockData::new(kind))
    }

    /// Create a value in `block`, appending it to the block's value list and
    /// charging one use to every argument.
    pub fn add_value(
        &mut self,
        block: Block,
        op: Op,
        ty: Type,
        args: &[Value],
        aux: i64,
        loc: SourceLoc,
    ) -> Value {
        let v = self.values.push(ValueData {
            op,
            ty,
            args: SmallVec::from_slice(args),
            aux,
            sym: None,
            block,
            uses: 0,
            home: None,
            loc,
        });
        for &a in args {
            self.values[a].uses += 1;
        }
        self.blocks[block].values.push(v);
        v
    }

    /// Like `add_value`, with a symbol auxiliary.
    pub fn add_value_sym(
        &mut self,
        block: Block,
        op: Op,
        ty: Type,
        args: &[Value],
        aux: i64,
        sym: impl Into<String>,
        loc: SourceLoc,
    ) -> Value {
        let v = self.add_value(block, op, ty, args, aux, loc);
        self.values[v].sym = Some(sym.into());
        v
    }

    /// Drop all of `v`'s arguments, releasing their uses.
    pub fn reset_args(&mut self, v: Value) {
        let args = std::mem::take(&mut self.values[v].args);
        for a in args {
            debug_assert!(self.values[a].uses > 0);
            self.values[a].uses -= 1;
        }
    }

    /// Append `arg` to `v`'s argument list, charging a use.
    pub fn add_arg(&mut self, v: Value, arg: Value) {
        self.values[v].args.push(arg);
        self.values[arg].uses += 1;
    }

    /// Replace `v`'s arguments wholesale.
    pub fn set_args(&mut self, v: Value, new_args: &[Value]) {
        self.reset_args(v);
        for &a in new_args {
            self.add_arg(v, a);
        }
    }

    /// Add the reciprocal edge pair `from -> to`.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Set a control value on `block`, charging a use.
    pub fn set_ctrl(&mut self, block: Block, v: Value) {
        self.blocks[block].ctrl.push(v);
        self.values[v].uses += 1;
    }

    /// Clear the control values of `block`, releasing their uses.
    pub fn clear_ctrl(&mut self, block: Block) {
        let ctrl = std::mem::take(&mut self.blocks[block].ctrl);
        for v in ctrl {
            debug_assert!(self.values[v].uses > 0);
            self.values[v].uses -= 1;
        }
    }

    /// Rewrite every reference to `old` (argument lists and control slots)
    /// to `new`, transferring use counts.
    pub fn replace_uses(&mut self, old: Value, new: Value) {
        if old == new {
            return;
        }
        let value_ids: Vec<Value> = self.values.keys().collect();
        for v in value_ids {
            let n = self.values[v].args.iter().filter(|&&a| a == old).count();
            if n > 0 {
                for a in self.values[v].args.iter_mut() {
                    if *a == old {
                        *a = new;
                    }
                }
                self.values[old].uses -= n as u32;
                self.values[new].uses += n as u32;
            }
        }
        let block_ids: Vec<Block> = self.blocks.keys().collect();
        for b in block_ids {
            let n = self.blocks[b].ctrl.iter().filter(|&&c| c == old).count();
            if n > 0 {
                for c in self.blocks[b].ctrl.iter_mut() {
                    if *c == old {
                        *c = new;
                    }
                }
                self.values[old].uses -= n as u32;
                self.values[new].uses += n as u32;
            }
        }
    }

    /// Remove `v` from its block's value list. The value entry itself stays
    /// in the arena (ids are never reused) but becomes unreachable.
    pub fn detach(&mut self, v: Value) {
        let block = self.values[v].block;
        self.blocks[block].values.retain(|&x| x != v);
        self.reset_args(v);
    }

    /// Blocks in reverse postorder from the entry.
    pub fn rpo(&self) -> Vec<Block> {
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut seen = vec![false; self.blocks.len()];
        // Iterative DFS; the explicit stack carries (block, next-succ-index).
        let mut stack = vec![(self.entry, 0usize)];
        seen[self.entry.index()] = true;
        while let Some((b, i)) = stack.pop() {
            let succs = &self.blocks[b].succs;
            if i < succs.len() {
                let s = succs[i];
                stack.push((b, i + 1));
                if !seen[s.index()] {
                    seen[s.index()] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(b);
            }
        }
        post.reverse();
        post
    }

    /// The index of `pred` in `block`'s predecessor list.
    pub fn pred_index(&self, block: Block, pred: Block) -> Option<usize> {
        self.blocks[block].preds.iter().position(|&p| p == pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn use_counts_track_args_and_ctrl() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        let a = f.add_value(e, Op::ConstInt, types::I64, &[], 1, Default::default());
        let b = f.add_value(e, Op::ConstInt, types::I64, &[], 2, Default::default());
        let s = f.add_value(e, Op::Add, types::I64, &[a, b], 0, Default::default());
        assert_eq!(f.values[a].uses, 1);
        assert_eq!(f.values[b].uses, 1);
        f.blocks[e].kind = BlockKind::Ret;
        f.set_ctrl(e, s);
        assert_eq!(f.values[s].uses, 1);
        f.set_args(s, &[b, a]);
        assert_eq!(f.values[a].uses, 1);
        assert_eq!(f.values[b].uses, 1);
    }

    #[test]
    fn rpo_visits_entry_first() {
        let mut f = Func::new("t", types::VOID);
        let e = f.entry;
        let b1 = f.add_block(BlockKind::Plain);
        let b2 = f.add_block(BlockKind::Ret);
        f.add_edge(e, b1);
        f.add_edge(b1, b2);
        let order = f.rpo();
        assert_eq!(order, vec![e, b1, b2]);
    }

    #[test]
    fn replace_uses_moves_counts() {
        let mut f = Func::new("t", types::I64);
        let e = f.entry;
        let a = f.add_value(e, Op::ConstInt, types::I64, &[], 1, Default::default());
        let b = f.add_value(e, Op::ConstInt, types::I64, &[], 1, Default::default());
        let u = f.add_value(e, Op::Add, types::I64, &[a, a], 0, Default::default());
        assert_eq!(f.values[a].uses, 2);
        f.replace_uses(a, b);
        assert_eq!(f.values[a].uses, 0);
        assert_eq!(f.values[b].uses, 2);
        assert_eq!(f.values[u].args.as_slice(), &[b, b]);
    }
}

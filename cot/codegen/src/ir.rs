//! The named-local intermediate representation.
//!
//! This is the flat form the lowerer produces from the checked AST, before
//! SSA construction. A function is a linear array of nodes partitioned into
//! basic blocks, where each block is a contiguous node range ending in a
//! terminator. Reads and writes of locals are explicit `LoadLocal` /
//! `StoreLocal` nodes; there is no value numbering yet.

use crate::entity::{PrimaryMap, entity_impl};
use crate::srcloc::SourceLoc;
use crate::types::Type;
use smallvec::SmallVec;

/// Reference to an IR node by its position in the function's node array.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "n");

/// Reference to a basic block of the IR function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "b");

/// Reference to a named local slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Local(u32);
entity_impl!(Local, "loc");

/// IR operations.
///
/// Operand meanings are given next to each op; `aux` is the node's 64-bit
/// auxiliary and `sym` its string auxiliary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Integer constant; `aux` is the value.
    ConstInt,
    /// Boolean constant; `aux` is 0 or 1.
    ConstBool,
    /// Null pointer constant.
    ConstNil,
    /// Float constant; `aux` is the IEEE bit pattern.
    ConstFloat,
    /// String literal; `aux` indexes the function's string table.
    ConstStr,

    /// `args[0] + args[1]`.
    Add,
    /// `args[0] - args[1]`.
    Sub,
    /// `args[0] * args[1]`.
    Mul,
    /// `args[0] / args[1]`.
    Div,
    /// `args[0] % args[1]`.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Shift left.
    Shl,
    /// Shift right (arithmetic for signed types).
    Shr,
    /// Arithmetic negation.
    Neg,
    /// Bitwise / logical complement.
    Not,

    /// Comparison, equal.
    Eq,
    /// Comparison, not equal.
    Ne,
    /// Comparison, less than.
    Lt,
    /// Comparison, less or equal.
    Le,
    /// Comparison, greater than.
    Gt,
    /// Comparison, greater or equal.
    Ge,

    /// Load from the address in `args[0]`.
    Load,
    /// Store `args[1]` to the address in `args[0]`.
    Store,
    /// Read the named local `aux`.
    LoadLocal,
    /// Write `args[0]` to the named local `aux`.
    StoreLocal,
    /// Address of the named local `aux`.
    LocalAddr,
    /// Address of the global named by `sym`.
    GlobalAddr,
    /// Address of the function named by `sym`.
    FuncAddr,
    /// `args[0] + aux` as a pointer offset.
    OffPtr,
    /// `args[0] + args[1] * aux` (element stride in `aux`).
    IndexPtr,
    /// Load a struct field: address in `args[0]`, byte offset in `aux`.
    FieldLoad,
    /// Store `args[1]` to a struct field: address in `args[0]`, offset `aux`.
    FieldStore,

    /// Direct call of `sym` with `args` as operands.
    Call,
    /// Indirect call: callee pointer in `args[0]`, operands follow.
    CallIndirect,

    /// Build a slice from `args[0]` (ptr) and `args[1]` (len).
    SliceMake,
    /// Pointer component of the slice in `args[0]`.
    SlicePtr,
    /// Length component of the slice in `args[0]`.
    SliceLen,
    /// Build a string from `args[0]` (ptr) and `args[1]` (len).
    StringMake,
    /// Pointer component of the string in `args[0]`.
    StringPtr,
    /// Length component of the string in `args[0]`.
    StringLen,
    /// Concatenate two strings (runtime call).
    StringConcat,

    /// Ternary select: `args[0] ? args[1] : args[2]`.
    Select,
    /// Bulk copy of `aux` bytes from `args[1]` to `args[0]`.
    Move,
    /// Integer conversion of `args[0]` to this node's type.
    Convert,

    /// Block entry marker.
    Entry,
    /// Unconditional jump; target block packed in `aux`.
    Jump,
    /// Conditional branch on `args[0]`; then/else blocks packed in `aux`.
    Branch,
    /// Return, with an optional value in `args[0]`.
    Return,
}

impl Opcode {
    /// Is this op a block terminator?
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jump | Self::Branch | Self::Return)
    }
}

/// Pack a branch target pair into a node auxiliary.
pub fn pack_targets(then_blk: BlockId, else_blk: BlockId) -> i64 {
    (((then_blk.as_u32() as u64) << 32) | else_blk.as_u32() as u64) as i64
}

/// Unpack a branch target pair from a node auxiliary.
pub fn unpack_targets(aux: i64) -> (BlockId, BlockId) {
    let bits = aux as u64;
    (
        BlockId::from_u32((bits >> 32) as u32),
        BlockId::from_u32(bits as u32),
    )
}

/// One IR node.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// The operation.
    pub op: Opcode,
    /// Result type.
    pub ty: Type,
    /// Operand node references.
    pub args: SmallVec<[Node; 3]>,
    /// 64-bit auxiliary: constants, offsets, local indices, branch targets.
    pub aux: i64,
    /// String auxiliary: call targets and global symbol names.
    pub sym: Option<String>,
    /// Source position.
    pub loc: SourceLoc,
}

/// A named local slot of an IR function.
#[derive(Clone, Debug)]
pub struct LocalData {
    /// Declared name.
    pub name: String,
    /// Declared type.
    pub ty: Type,
    /// Byte size, cached from the registry at declaration.
    pub size: u32,
    /// Was this local created for a parameter?
    pub is_param: bool,
}

/// A basic block: a contiguous range of nodes.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// First node of the block.
    pub start: u32,
    /// One past the last node of the block.
    pub end: u32,
    /// Has the block been placed in the node array yet?
    pub filled: bool,
}

/// A function parameter.
#[derive(Clone, Debug)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    pub ty: Type,
    /// Byte size, cached from the registry.
    pub size: u32,
    /// The local slot holding the parameter.
    pub local: Local,
}

/// One IR function.
pub struct Function {
    /// Function name as it appears in symbols.
    pub name: String,
    /// Parameters in declaration order.
    pub params: Vec<Param>,
    /// Return type.
    pub ret_ty: Type,
    /// All locals, parameters first.
    pub locals: PrimaryMap<Local, LocalData>,
    /// The linear node array.
    pub nodes: PrimaryMap<Node, NodeData>,
    /// Blocks as ranges over `nodes`. Block 0 is the entry.
    pub blocks: PrimaryMap<BlockId, BlockData>,
    /// String literals referenced by this function, in intern order.
    pub strings: Vec<String>,
    /// Global variables referenced by this function.
    pub globals: Vec<String>,
    /// Extern declarations have no body and produce only an undefined symbol.
    pub is_extern: bool,
}

impl Function {
    /// Create an empty function.
    pub fn new(name: impl Into<String>, ret_ty: Type) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret_ty,
            locals: PrimaryMap::new(),
            nodes: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            strings: Vec::new(),
            globals: Vec::new(),
            is_extern: false,
        }
    }

    /// The nodes of `block`, in order.
    pub fn block_nodes(&self, block: BlockId) -> impl Iterator<Item = Node> + '_ {
        let data = &self.blocks[block];
        (data.start..data.end).map(|i| Node::from_u32(i))
    }

    /// The terminator node of `block`, if the block is non-empty.
    pub fn terminator(&self, block: BlockId) -> Option<Node> {
        let data = &self.blocks[block];
        if data.end > data.start {
            let last = Node::from_u32(data.end - 1);
            self.nodes[last].op.is_terminator().then_some(last)
        } else {
            None
        }
    }

    /// Intern a string literal in this function's table, returning its index.
    pub fn intern_string(&mut self, s: &str) -> i64 {
        if let Some(i) = self.strings.iter().position(|x| x == s) {
            return i as i64;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as i64
    }

    /// Record a referenced global.
    pub fn note_global(&mut self, name: &str) {
        if !self.globals.iter().any(|g| g == name) {
            self.globals.push(name.to_string());
        }
    }
}

/// Incremental builder for one IR function.
///
/// Blocks may be created ahead of time (for forward branches) and are filled
/// one at a time; every block occupies a contiguous node range.
pub struct Builder {
    /// The function being built.
    pub func: Function,
    current: Option<BlockId>,
    loc: SourceLoc,
}

impl Builder {
    /// Start building `func`. Creates and enters the entry block.
    pub fn new(name: impl Into<String>, ret_ty: Type) -> Self {
        let mut b = Self {
            func: Function::new(name, ret_ty),
            current: None,
            loc: SourceLoc::default(),
        };
        let entry = b.create_block();
        b.switch_to_block(entry);
        b
    }

    /// Set the source location recorded on subsequent nodes.
    pub fn set_loc(&mut self, loc: SourceLoc) {
        self.loc = loc;
    }

    /// Declare a local slot.
    pub fn declare_local(&mut self, name: &str, ty: Type, size: u32, is_param: bool) -> Local {
        self.func.locals.push(LocalData {
            name: name.to_string(),
            ty,
            size,
            is_param,
        })
    }

    /// Create a new, empty block that can be branched to before it is filled.
    pub fn create_block(&mut self) -> BlockId {
        self.func.blocks.push(BlockData::default())
    }

    /// Begin filling `block`. The previous block must have been terminated.
    pub fn switch_to_block(&mut self, block: BlockId) {
        debug_assert!(
            self.current.is_none(),
            "switched away from an unterminated block"
        );
        debug_assert!(!self.func.blocks[block].filled, "block filled twice");
        let start = self.func.nodes.len() as u32;
        let data = &mut self.func.blocks[block];
        data.start = start;
        data.end = start;
        data.filled = true;
        self.current = Some(block);
    }

    /// The block currently being filled, if any.
    pub fn current_block(&self) -> Option<BlockId> {
        self.current
    }

    /// Append a node to the current block.
    pub fn ins(
        &mut self,
        op: Opcode,
        ty: Type,
        args: &[Node],
        aux: i64,
        sym: Option<String>,
    ) -> Node {
        let block = self.current.expect("instruction outside of a block");
        let node = self.func.nodes.push(NodeData {
            op,
            ty,
            args: SmallVec::from_slice(args),
            aux,
            sym,
            loc: self.loc,
        });
        self.func.blocks[block].end = self.func.nodes.len() as u32;
        if op.is_terminator() {
            self.current = None;
        }
        node
    }

    /// Append a node with no symbol auxiliary.
    pub fn ins0(&mut self, op: Opcode, ty: Type, args: &[Node], aux: i64) -> Node {
        self.ins(op, ty, args, aux, None)
    }

    /// Finish the function. The current block, if any, must be terminated by
    /// the caller first.
    pub fn finish(self) -> Function {
        debug_assert!(self.current.is_none(), "finished with an open block");
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn blocks_are_contiguous() {
        let mut b = Builder::new("f", types::I64);
        let entry = b.current_block().unwrap();
        let exit = b.create_block();
        let c = b.ins0(Opcode::ConstInt, types::I64, &[], 42);
        b.ins0(Opcode::Jump, types::VOID, &[], exit.as_u32() as i64);
        b.switch_to_block(exit);
        b.ins0(Opcode::Return, types::VOID, &[c], 0);
        let f = b.finish();
        assert_eq!(f.block_nodes(entry).count(), 2);
        assert_eq!(f.block_nodes(exit).count(), 1);
        assert_eq!(f.terminator(exit).map(|n| f.nodes[n].op), Some(Opcode::Return));
    }

    #[test]
    fn string_interning_dedups() {
        let mut f = Function::new("g", types::VOID);
        let a = f.intern_string("hi");
        let b = f.intern_string("there");
        let c = f.intern_string("hi");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(f.strings.len(), 2);
    }
}

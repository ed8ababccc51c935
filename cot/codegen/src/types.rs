//! The type registry.
//!
//! Every type in a compilation unit is interned here exactly once and
//! referenced by a compact `Type` index. The registry is append-only: indices
//! are stable for the life of the compilation and the checker is the only
//! phase that adds entries. From the lowerer onward the registry is read-only.
//!
//! Struct layout is computed once, when the struct is declared. Field offsets
//! are stored in the registry and never recomputed.

use crate::entity::{EntityRef, PrimaryMap, entity_impl};
use hashbrown::HashMap;

/// A compact reference to an interned type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type(u32);
entity_impl!(Type, "ty");

/// The fixed primitive indices. These are pushed by `TypeRegistry::new` in
/// this exact order, so the constants below always hold.
pub const VOID: Type = Type(0);
pub const BOOL: Type = Type(1);
pub const I8: Type = Type(2);
pub const I16: Type = Type(3);
pub const I32: Type = Type(4);
pub const I64: Type = Type(5);
pub const U8: Type = Type(6);
pub const U16: Type = Type(7);
pub const U32: Type = Type(8);
pub const U64: Type = Type(9);
pub const F32: Type = Type(10);
pub const F64: Type = Type(11);
/// The 16-byte (ptr, len) string type.
pub const STR: Type = Type(12);
/// SSA pseudo-type: a memory state token.
pub const MEM: Type = Type(13);
/// SSA pseudo-type: condition flags.
pub const FLAGS: Type = Type(14);
/// SSA pseudo-type: an unexpanded multi-value.
pub const TUPLE: Type = Type(15);
/// SSA pseudo-type: the result bundle of a call.
pub const RESULTS: Type = Type(16);

const NUM_FIXED: usize = 17;

/// A struct field with its precomputed layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: Type,
    /// Byte offset from the start of the struct.
    pub offset: u32,
}

/// The payload describing one interned type.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeData {
    /// One of the fixed primitives, identified by its index.
    Primitive,
    /// Pointer to `elem`.
    Pointer {
        /// Pointee type.
        elem: Type,
    },
    /// Slice of `elem`: a (ptr, len) pair.
    Slice {
        /// Element type.
        elem: Type,
    },
    /// Fixed-size array.
    Array {
        /// Element type.
        elem: Type,
        /// Number of elements.
        len: u64,
    },
    /// A named struct with laid-out fields.
    Struct {
        /// Declared name.
        name: String,
        /// Fields in declaration order, offsets precomputed.
        fields: Vec<Field>,
        /// Total size including tail padding.
        size: u32,
        /// Alignment in bytes.
        align: u32,
    },
    /// A named enum. Variants carry no payload; the value is the tag.
    Enum {
        /// Declared name.
        name: String,
        /// Variant names, tag values are declaration order.
        variants: Vec<String>,
    },
    /// A function signature, used for function pointers.
    Func {
        /// Parameter types.
        params: Vec<Type>,
        /// Return type.
        ret: Type,
    },
}

/// Key used to intern constructed types so structurally identical requests
/// return the same index.
#[derive(Clone, PartialEq, Eq, Hash)]
enum InternKey {
    Pointer(Type),
    Slice(Type),
    Array(Type, u64),
    Func(Vec<Type>, Type),
}

/// The append-only registry of interned types.
pub struct TypeRegistry {
    types: PrimaryMap<Type, TypeData>,
    intern: HashMap<InternKey, Type>,
}

impl TypeRegistry {
    /// Create a registry seeded with the fixed primitives.
    pub fn new() -> Self {
        let mut types = PrimaryMap::new();
        for _ in 0..NUM_FIXED {
            types.push(TypeData::Primitive);
        }
        Self {
            types,
            intern: HashMap::new(),
        }
    }

    /// Number of interned types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Is the registry empty? It never is; the primitives are always present.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Look up the payload for `ty`.
    pub fn data(&self, ty: Type) -> &TypeData {
        &self.types[ty]
    }

    /// Intern a pointer to `elem`.
    pub fn pointer_to(&mut self, elem: Type) -> Type {
        self.intern_constructed(InternKey::Pointer(elem), TypeData::Pointer { elem })
    }

    /// Intern a slice of `elem`.
    pub fn slice_of(&mut self, elem: Type) -> Type {
        self.intern_constructed(InternKey::Slice(elem), TypeData::Slice { elem })
    }

    /// Intern an array of `len` elements of `elem`.
    pub fn array_of(&mut self, elem: Type, len: u64) -> Type {
        self.intern_constructed(InternKey::Array(elem, len), TypeData::Array { elem, len })
    }

    /// Intern a function signature.
    pub fn func_type(&mut self, params: Vec<Type>, ret: Type) -> Type {
        self.intern_constructed(
            InternKey::Func(params.clone(), ret),
            TypeData::Func { params, ret },
        )
    }

    fn intern_constructed(&mut self, key: InternKey, data: TypeData) -> Type {
        if let Some(&ty) = self.intern.get(&key) {
            return ty;
        }
        let ty = self.types.push(data);
        self.intern.insert(key, ty);
        ty
    }

    /// Declare a struct and lay out its fields. Offsets are computed here,
    /// once, and are final. Returns the new type index.
    ///
    /// Structs are nominal: two structs with identical fields get distinct
    /// indices, so there is no interning step.
    pub fn declare_struct(&mut self, name: impl Into<String>, fields: Vec<(String, Type)>) -> Type {
        let mut laid = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        let mut align = 1u32;
        for (fname, fty) in fields {
            let fa = self.align_of(fty).max(1);
            let fs = self.size_of(fty);
            offset = round_up(offset, fa);
            laid.push(Field {
                name: fname,
                ty: fty,
                offset,
            });
            offset += fs;
            align = align.max(fa);
        }
        let size = round_up(offset, align);
        self.types.push(TypeData::Struct {
            name: name.into(),
            fields: laid,
            size,
            align,
        })
    }

    /// Declare an enum. The runtime representation is an 8-byte tag.
    pub fn declare_enum(&mut self, name: impl Into<String>, variants: Vec<String>) -> Type {
        self.types.push(TypeData::Enum {
            name: name.into(),
            variants,
        })
    }

    /// Size of `ty` in bytes.
    pub fn size_of(&self, ty: Type) -> u32 {
        match ty {
            VOID | MEM | FLAGS | TUPLE | RESULTS => 0,
            BOOL | I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
            STR => 16,
            _ => match &self.types[ty] {
                TypeData::Pointer { .. } | TypeData::Func { .. } | TypeData::Enum { .. } => 8,
                TypeData::Slice { .. } => 16,
                TypeData::Array { elem, len } => {
                    let stride = round_up(self.size_of(*elem), self.align_of(*elem).max(1));
                    stride * (*len as u32)
                }
                TypeData::Struct { size, .. } => *size,
                TypeData::Primitive => unreachable!("primitive index out of range"),
            },
        }
    }

    /// Alignment of `ty` in bytes.
    pub fn align_of(&self, ty: Type) -> u32 {
        match ty {
            VOID | MEM | FLAGS | TUPLE | RESULTS => 1,
            STR => 8,
            _ if ty.index() < NUM_FIXED => self.size_of(ty),
            _ => match &self.types[ty] {
                TypeData::Pointer { .. }
                | TypeData::Func { .. }
                | TypeData::Enum { .. }
                | TypeData::Slice { .. } => 8,
                TypeData::Array { elem, .. } => self.align_of(*elem),
                TypeData::Struct { align, .. } => *align,
                TypeData::Primitive => unreachable!("primitive index out of range"),
            },
        }
    }

    /// Find a struct field by name. Returns the field's declaration index,
    /// byte offset, and type.
    pub fn field_of(&self, ty: Type, name: &str) -> Option<(usize, u32, Type)> {
        match &self.types[ty] {
            TypeData::Struct { fields, .. } => fields
                .iter()
                .enumerate()
                .find(|(_, f)| f.name == name)
                .map(|(i, f)| (i, f.offset, f.ty)),
            _ => None,
        }
    }

    /// The element type of a pointer, slice, or array.
    pub fn element_of(&self, ty: Type) -> Option<Type> {
        match &self.types[ty] {
            TypeData::Pointer { elem } | TypeData::Slice { elem } | TypeData::Array { elem, .. } => {
                Some(*elem)
            }
            _ => None,
        }
    }

    /// How many ABI registers a value of this type occupies when passed or
    /// returned: strings and slices take a (ptr, len) pair; anything that
    /// fits in 8 bytes takes one; up to 16 bytes two; larger aggregates are
    /// passed by reference in a single pointer register.
    pub fn abi_register_count(&self, ty: Type) -> u32 {
        if ty == VOID {
            return 0;
        }
        if ty == STR || matches!(self.types[ty], TypeData::Slice { .. }) {
            return 2;
        }
        match self.size_of(ty) {
            0 => 0,
            1..=8 => 1,
            9..=16 => 2,
            _ => 1,
        }
    }

    /// Is this an aggregate passed by reference (size > 16, not string/slice)?
    pub fn is_by_ref_aggregate(&self, ty: Type) -> bool {
        if ty == STR || matches!(self.types[ty], TypeData::Slice { .. }) {
            return false;
        }
        self.size_of(ty) > 16
    }

    /// A 9..16 byte aggregate that travels as two registers but is not a
    /// string or slice.
    pub fn is_two_reg_aggregate(&self, ty: Type) -> bool {
        if ty == STR || matches!(self.types[ty], TypeData::Slice { .. }) {
            return false;
        }
        let sz = self.size_of(ty);
        sz > 8 && sz <= 16
    }

    /// Is `ty` one of the signed integer types?
    pub fn is_signed_int(&self, ty: Type) -> bool {
        matches!(ty, I8 | I16 | I32 | I64)
    }

    /// Is `ty` any integer type (or bool / enum, which share the int paths)?
    pub fn is_integer(&self, ty: Type) -> bool {
        matches!(ty, BOOL | I8 | I16 | I32 | I64 | U8 | U16 | U32 | U64)
            || matches!(self.types[ty], TypeData::Enum { .. })
    }

    /// A printable name for diagnostics.
    pub fn display(&self, ty: Type) -> String {
        match ty {
            VOID => "void".into(),
            BOOL => "bool".into(),
            I8 => "i8".into(),
            I16 => "i16".into(),
            I32 => "i32".into(),
            I64 => "i64".into(),
            U8 => "u8".into(),
            U16 => "u16".into(),
            U32 => "u32".into(),
            U64 => "u64".into(),
            F32 => "f32".into(),
            F64 => "f64".into(),
            STR => "string".into(),
            MEM => "mem".into(),
            FLAGS => "flags".into(),
            TUPLE => "tuple".into(),
            RESULTS => "results".into(),
            _ => match &self.types[ty] {
                TypeData::Pointer { elem } => format!("*{}", self.display(*elem)),
                TypeData::Slice { elem } => format!("[]{}", self.display(*elem)),
                TypeData::Array { elem, len } => format!("[{}]{}", len, self.display(*elem)),
                TypeData::Struct { name, .. } | TypeData::Enum { name, .. } => name.clone(),
                TypeData::Func { params, ret } => {
                    let ps: Vec<_> = params.iter().map(|p| self.display(*p)).collect();
                    format!("fn({}) {}", ps.join(", "), self.display(*ret))
                }
                TypeData::Primitive => unreachable!(),
            },
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn round_up(n: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_sizes() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.size_of(VOID), 0);
        assert_eq!(reg.size_of(BOOL), 1);
        assert_eq!(reg.size_of(I64), 8);
        assert_eq!(reg.size_of(STR), 16);
        assert_eq!(reg.align_of(STR), 8);
    }

    #[test]
    fn constructed_types_intern() {
        let mut reg = TypeRegistry::new();
        let p1 = reg.pointer_to(I64);
        let p2 = reg.pointer_to(I64);
        assert_eq!(p1, p2);
        let s1 = reg.slice_of(U8);
        let s2 = reg.slice_of(U8);
        assert_eq!(s1, s2);
        assert_eq!(reg.size_of(s1), 16);
        assert_ne!(p1, s1);
    }

    #[test]
    fn struct_layout_is_final() {
        let mut reg = TypeRegistry::new();
        let st = reg.declare_struct(
            "P",
            vec![
                ("a".to_string(), I8),
                ("b".to_string(), I64),
                ("c".to_string(), I32),
            ],
        );
        let (ia, oa, ta) = reg.field_of(st, "a").unwrap();
        let (ib, ob, tb) = reg.field_of(st, "b").unwrap();
        let (ic, oc, tc) = reg.field_of(st, "c").unwrap();
        assert_eq!((ia, oa, ta), (0, 0, I8));
        assert_eq!((ib, ob, tb), (1, 8, I64));
        assert_eq!((ic, oc, tc), (2, 16, I32));
        assert_eq!(reg.size_of(st), 24);
        assert_eq!(reg.align_of(st), 8);
    }

    #[test]
    fn abi_register_counts() {
        let mut reg = TypeRegistry::new();
        assert_eq!(reg.abi_register_count(I64), 1);
        assert_eq!(reg.abi_register_count(STR), 2);
        let sl = reg.slice_of(I64);
        assert_eq!(reg.abi_register_count(sl), 2);
        let big = reg.declare_struct(
            "Big",
            vec![
                ("x".to_string(), I64),
                ("y".to_string(), I64),
                ("z".to_string(), I64),
            ],
        );
        assert_eq!(reg.abi_register_count(big), 1);
        assert!(reg.is_by_ref_aggregate(big));
        let pair = reg.declare_struct("Pair", vec![("x".to_string(), I64), ("y".to_string(), I64)]);
        assert_eq!(reg.abi_register_count(pair), 2);
        assert!(!reg.is_by_ref_aggregate(pair));
    }
}

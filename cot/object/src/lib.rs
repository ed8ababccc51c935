//! Relocatable object emission for the cot compiler.
//!
//! An `ObjectModule` accumulates the compiled functions, globals, and string
//! literals of one compilation unit, then serializes a Mach-O object
//! (AArch64, Darwin) or an ELF object (x86-64, Linux). The layouts are
//! written by hand, byte for byte, so they can be checked against the host
//! linker's expectations directly.

mod elf;
mod macho;

use cot_codegen::binemit::{CompiledFunc, RelocEntry};
use cot_codegen::isa::Arch;
use std::collections::HashMap;

/// Errors from object serialization.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    /// Section or symbol limits of the format were exceeded.
    #[error("object layout overflow: {0}")]
    Overflow(String),
    /// Writing the final buffer failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A result from the object writer.
pub type ObjectResult<T> = Result<T, ObjectError>;

/// A defined global variable: zero-initialized storage in the data section.
#[derive(Clone, Debug)]
pub struct Global {
    /// Undecorated name.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
}

/// A deduplicated string literal.
#[derive(Clone, Debug)]
pub struct Literal {
    /// The data-section symbol, `L.str.<n>`.
    pub symbol: String,
    /// The bytes, without a terminator.
    pub bytes: Vec<u8>,
}

/// Accumulates one compilation unit and writes the object file.
pub struct ObjectModule {
    arch: Arch,
    funcs: Vec<CompiledFunc>,
    globals: Vec<Global>,
    literals: Vec<Literal>,
    literal_index: HashMap<Vec<u8>, usize>,
}

impl ObjectModule {
    /// A fresh module for `arch`.
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            funcs: Vec::new(),
            globals: Vec::new(),
            literals: Vec::new(),
            literal_index: HashMap::new(),
        }
    }

    /// The target architecture.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Intern a string literal by content, returning its symbol name.
    pub fn intern_literal(&mut self, content: &str) -> String {
        let bytes = content.as_bytes().to_vec();
        if let Some(&i) = self.literal_index.get(&bytes) {
            return self.literals[i].symbol.clone();
        }
        let symbol = format!("L.str.{}", self.literals.len());
        self.literal_index.insert(bytes.clone(), self.literals.len());
        self.literals.push(Literal { symbol: symbol.clone(), bytes });
        symbol
    }

    /// Add a compiled function. Order becomes text-section order.
    pub fn add_function(&mut self, func: CompiledFunc) {
        self.funcs.push(func);
    }

    /// Add a zero-initialized global.
    pub fn add_global(&mut self, name: &str, size: u32) {
        self.globals.push(Global {
            name: name.to_string(),
            size,
        });
    }

    /// The names of symbols referenced but not defined here, for diagnostic
    /// use.
    pub fn undefined_symbols(&self) -> Vec<String> {
        let defined: Vec<&str> = self
            .funcs
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.globals.iter().map(|g| g.name.as_str()))
            .chain(self.literals.iter().map(|l| l.symbol.as_str()))
            .collect();
        let mut out = Vec::new();
        for f in &self.funcs {
            for r in &f.relocs {
                if !defined.contains(&r.name.as_str()) && !out.contains(&r.name) {
                    out.push(r.name.clone());
                }
            }
        }
        out
    }

    /// Serialize the accumulated unit into a complete object file.
    pub fn finish(&self) -> ObjectResult<Vec<u8>> {
        let layout = Layout::compute(self);
        log::debug!(
            "object layout: {} text bytes, {} data bytes, {} relocations",
            layout.text_size,
            layout.data_size,
            layout.text_relocs.len()
        );
        match self.arch {
            Arch::Aarch64 => macho::write(self, &layout),
            Arch::X64 => elf::write(self, &layout),
        }
    }
}

/// Section layout shared by both formats: function offsets in the text
/// section and symbol offsets in the data section.
pub(crate) struct Layout {
    /// Per-function text offsets, parallel to `ObjectModule::funcs`.
    pub func_offsets: Vec<u32>,
    /// Total text bytes, 4-aligned.
    pub text_size: u32,
    /// Per-global data offsets.
    pub global_offsets: Vec<u32>,
    /// Per-literal data offsets.
    pub literal_offsets: Vec<u32>,
    /// Total data bytes, 8-aligned.
    pub data_size: u32,
    /// Every text relocation with its section-relative offset.
    pub text_relocs: Vec<(u32, RelocEntry)>,
}

fn align_to(n: u32, a: u32) -> u32 {
    (n + a - 1) & !(a - 1)
}

impl Layout {
    fn compute(module: &ObjectModule) -> Self {
        let mut func_offsets = Vec::with_capacity(module.funcs.len());
        let mut text_relocs = Vec::new();
        let mut off = 0u32;
        for f in &module.funcs {
            off = align_to(off, 4);
            func_offsets.push(off);
            for r in &f.relocs {
                text_relocs.push((off + r.offset, r.clone()));
            }
            off += f.code.len() as u32;
        }
        let text_size = align_to(off, 4);

        let mut data = 0u32;
        let mut global_offsets = Vec::with_capacity(module.globals.len());
        for g in &module.globals {
            data = align_to(data, 8);
            global_offsets.push(data);
            data += g.size;
        }
        let mut literal_offsets = Vec::with_capacity(module.literals.len());
        for l in &module.literals {
            data = align_to(data, 8);
            literal_offsets.push(data);
            data += l.bytes.len() as u32;
        }
        let data_size = align_to(data, 8);

        Self {
            func_offsets,
            text_size,
            global_offsets,
            literal_offsets,
            data_size,
            text_relocs,
        }
    }
}

/// A little-endian byte buffer with alignment helpers, shared by both
/// writers.
#[derive(Default)]
pub(crate) struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.bytes.extend_from_slice(v);
    }

    /// A fixed-width, zero-padded name field (Mach-O segment and section
    /// names).
    pub fn name16(&mut self, name: &str) {
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name.as_bytes());
        self.bytes.extend_from_slice(&field);
    }

    /// Zero-pad to the next multiple of `a`. Padding bytes are always zero.
    pub fn align(&mut self, a: u32) {
        while self.len() % a != 0 {
            self.bytes.push(0);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_dedup_by_content() {
        let mut m = ObjectModule::new(Arch::Aarch64);
        let a = m.intern_literal("hello");
        let b = m.intern_literal("world");
        let c = m.intern_literal("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(m.literals.len(), 2);
        assert_eq!(a, "L.str.0");
    }

    #[test]
    fn layout_aligns_sections() {
        let mut m = ObjectModule::new(Arch::Aarch64);
        m.add_function(CompiledFunc {
            name: "f".into(),
            code: vec![0; 6],
            relocs: vec![],
        });
        m.add_function(CompiledFunc {
            name: "g".into(),
            code: vec![0; 4],
            relocs: vec![],
        });
        m.add_global("counter", 12);
        m.intern_literal("abc");
        let l = Layout::compute(&m);
        assert_eq!(l.func_offsets, vec![0, 8]);
        assert_eq!(l.text_size, 12);
        assert_eq!(l.global_offsets, vec![0]);
        assert_eq!(l.literal_offsets, vec![16]);
        assert_eq!(l.data_size, 24);
    }
}

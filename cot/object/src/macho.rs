//! Mach-O object serialization for AArch64 Darwin.
//!
//! Layout: header, load commands (one `LC_SEGMENT_64` with `__text` and
//! `__data`, one `LC_SYMTAB`), section contents, relocations, symbol table,
//! string table. Section addresses are absolute from the start of the text
//! section. Every padding interval is zero bytes.

use crate::{Buffer, Layout, ObjectModule, ObjectResult, align_to};
use cot_codegen::binemit::Reloc;
use std::collections::HashMap;

const MH_MAGIC_64: u32 = 0xFEED_FACF;
const CPU_TYPE_ARM64: u32 = 0x0100_000C;
const MH_OBJECT: u32 = 0x1;
const MH_SUBSECTIONS_VIA_SYMBOLS: u32 = 0x2000;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;

const N_UNDF: u8 = 0x0;
const N_SECT: u8 = 0xE;
const N_EXT: u8 = 0x1;

const ARM64_RELOC_UNSIGNED: u32 = 0;
const ARM64_RELOC_BRANCH26: u32 = 2;
const ARM64_RELOC_PAGE21: u32 = 3;
const ARM64_RELOC_PAGEOFF12: u32 = 4;

const HEADER_SIZE: u32 = 32;
const SEGMENT_CMD_SIZE: u32 = 72 + 2 * 80;
const SYMTAB_CMD_SIZE: u32 = 24;
const NLIST_SIZE: u32 = 16;
const RELOC_SIZE: u32 = 8;

/// One symbol-table row, before serialization.
struct Sym {
    /// Decorated name as it appears in the string table.
    name: String,
    n_type: u8,
    n_sect: u8,
    n_value: u64,
}

/// Darwin decorates C-visible symbols with a leading underscore; private
/// literal labels stay as they are.
fn decorate(name: &str) -> String {
    if name.starts_with("L.str.") {
        name.to_string()
    } else {
        format!("_{name}")
    }
}

pub(crate) fn write(module: &ObjectModule, layout: &Layout) -> ObjectResult<Vec<u8>> {
    // Symbol table order is fixed: local, defined external, undefined.
    // Relocations index into this order, so the index map comes first.
    let mut syms: Vec<Sym> = Vec::new();
    let mut index: HashMap<String, u32> = HashMap::new();

    for (i, lit) in module.literals.iter().enumerate() {
        index.insert(lit.symbol.clone(), syms.len() as u32);
        syms.push(Sym {
            name: decorate(&lit.symbol),
            n_type: N_SECT,
            n_sect: 2,
            n_value: (layout.text_size + layout.literal_offsets[i]) as u64,
        });
    }
    for (i, f) in module.funcs.iter().enumerate() {
        index.insert(f.name.clone(), syms.len() as u32);
        syms.push(Sym {
            name: decorate(&f.name),
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_value: layout.func_offsets[i] as u64,
        });
    }
    for (i, g) in module.globals.iter().enumerate() {
        index.insert(g.name.clone(), syms.len() as u32);
        syms.push(Sym {
            name: decorate(&g.name),
            n_type: N_SECT | N_EXT,
            n_sect: 2,
            n_value: (layout.text_size + layout.global_offsets[i]) as u64,
        });
    }
    // Any symbol a relocation names without a definition becomes an
    // undefined external.
    for (_, r) in &layout.text_relocs {
        if !index.contains_key(&r.name) {
            index.insert(r.name.clone(), syms.len() as u32);
            syms.push(Sym {
                name: decorate(&r.name),
                n_type: N_UNDF | N_EXT,
                n_sect: 0,
                n_value: 0,
            });
        }
    }

    // String table: leading NUL, then each name.
    let mut strtab: Vec<u8> = vec![0];
    let mut stroffs: Vec<u32> = Vec::with_capacity(syms.len());
    for s in &syms {
        stroffs.push(strtab.len() as u32);
        strtab.extend_from_slice(s.name.as_bytes());
        strtab.push(0);
    }

    // File offsets, in emission order.
    let contents_off = HEADER_SIZE + SEGMENT_CMD_SIZE + SYMTAB_CMD_SIZE;
    let text_off = align_to(contents_off, 4);
    let data_off = align_to(text_off + layout.text_size, 8);
    let reloc_off = align_to(data_off + layout.data_size, 8);
    let nreloc = layout.text_relocs.len() as u32;
    let sym_off = reloc_off + nreloc * RELOC_SIZE;
    let str_off = sym_off + syms.len() as u32 * NLIST_SIZE;

    let mut b = Buffer::new();

    // mach_header_64
    b.u32(MH_MAGIC_64);
    b.u32(CPU_TYPE_ARM64);
    b.u32(0); // cpusubtype ARM64_ALL
    b.u32(MH_OBJECT);
    b.u32(2); // ncmds
    b.u32(SEGMENT_CMD_SIZE + SYMTAB_CMD_SIZE);
    b.u32(MH_SUBSECTIONS_VIA_SYMBOLS);
    b.u32(0); // reserved

    // LC_SEGMENT_64
    b.u32(LC_SEGMENT_64);
    b.u32(SEGMENT_CMD_SIZE);
    b.name16("");
    b.u64(0); // vmaddr
    b.u64((layout.text_size + layout.data_size) as u64);
    b.u64(text_off as u64); // fileoff
    b.u64((layout.text_size + layout.data_size) as u64);
    b.u32(7); // maxprot rwx
    b.u32(7); // initprot
    b.u32(2); // nsects
    b.u32(0); // flags

    // __text
    b.name16("__text");
    b.name16("__TEXT");
    b.u64(0); // addr
    b.u64(layout.text_size as u64);
    b.u32(text_off);
    b.u32(2); // 4-byte alignment, log2
    b.u32(reloc_off);
    b.u32(nreloc);
    b.u32(0x8000_0400); // S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS
    b.u32(0);
    b.u32(0);
    b.u32(0);

    // __data
    b.name16("__data");
    b.name16("__DATA");
    b.u64(layout.text_size as u64); // addresses run on from the text
    b.u64(layout.data_size as u64);
    b.u32(data_off);
    b.u32(3); // 8-byte alignment, log2
    b.u32(0);
    b.u32(0);
    b.u32(0); // S_REGULAR
    b.u32(0);
    b.u32(0);
    b.u32(0);

    // LC_SYMTAB
    b.u32(LC_SYMTAB);
    b.u32(SYMTAB_CMD_SIZE);
    b.u32(sym_off);
    b.u32(syms.len() as u32);
    b.u32(str_off);
    b.u32(strtab.len() as u32);

    // Section contents.
    b.align(4);
    debug_assert_eq!(b.len(), text_off);
    for (i, f) in module.funcs.iter().enumerate() {
        while b.len() < text_off + layout.func_offsets[i] {
            b.u8(0);
        }
        b.bytes(&f.code);
    }
    while b.len() < text_off + layout.text_size {
        b.u8(0);
    }
    b.align(8);
    debug_assert_eq!(b.len(), data_off);
    for (i, g) in module.globals.iter().enumerate() {
        while b.len() < data_off + layout.global_offsets[i] {
            b.u8(0);
        }
        for _ in 0..g.size {
            b.u8(0);
        }
    }
    for (i, l) in module.literals.iter().enumerate() {
        while b.len() < data_off + layout.literal_offsets[i] {
            b.u8(0);
        }
        b.bytes(&l.bytes);
    }
    while b.len() < data_off + layout.data_size {
        b.u8(0);
    }

    // Relocations.
    b.align(8);
    debug_assert_eq!(b.len(), reloc_off);
    for (addr, r) in &layout.text_relocs {
        let symbolnum = index[&r.name];
        let (r_type, pcrel, length) = match r.kind {
            Reloc::Arm64Call26 => (ARM64_RELOC_BRANCH26, 1, 2),
            Reloc::Arm64Page21 => (ARM64_RELOC_PAGE21, 1, 2),
            Reloc::Arm64PageOff12 => (ARM64_RELOC_PAGEOFF12, 0, 2),
            Reloc::Abs8 => (ARM64_RELOC_UNSIGNED, 0, 3),
            Reloc::X64CallRel32 | Reloc::X64PcRel32 => {
                unreachable!("x86-64 relocation in a Mach-O object")
            }
        };
        b.i32(*addr as i32);
        b.u32(symbolnum | (pcrel << 24) | (length << 25) | (1 << 27) | (r_type << 28));
    }

    // Symbol table.
    debug_assert_eq!(b.len(), sym_off);
    for (s, &strx) in syms.iter().zip(&stroffs) {
        b.u32(strx);
        b.u8(s.n_type);
        b.u8(s.n_sect);
        b.u16(0); // n_desc
        b.u64(s.n_value);
    }

    // String table.
    debug_assert_eq!(b.len(), str_off);
    b.bytes(&strtab);

    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cot_codegen::binemit::{CompiledFunc, RelocEntry};
    use cot_codegen::isa::Arch;

    fn module_with_call_and_literal() -> ObjectModule {
        let mut m = ObjectModule::new(Arch::Aarch64);
        let sym = m.intern_literal("hello");
        assert_eq!(sym, "L.str.0");
        m.add_function(CompiledFunc {
            name: "main".into(),
            code: vec![0; 16],
            relocs: vec![RelocEntry {
                offset: 8,
                kind: Reloc::Arm64Call26,
                name: "callee".into(),
                addend: 0,
            }],
        });
        m
    }

    #[test]
    fn header_magic_and_cpu() {
        let m = module_with_call_and_literal();
        let bytes = m.finish().unwrap();
        assert_eq!(&bytes[0..4], &0xFEED_FACFu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x0100_000Cu32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes()); // MH_OBJECT
        assert_eq!(&bytes[24..28], &0x2000u32.to_le_bytes());
    }

    #[test]
    fn call_reloc_names_undefined_callee() {
        let m = module_with_call_and_literal();
        let bytes = m.finish().unwrap();
        // One text relocation, and the callee present in the string table
        // with the Darwin underscore.
        let needle = b"_callee\0";
        assert!(
            bytes.windows(needle.len()).any(|w| w == needle),
            "undefined callee symbol missing"
        );
        let lit = b"L.str.0\0";
        assert!(bytes.windows(lit.len()).any(|w| w == lit));
    }

    #[test]
    fn literal_bytes_land_in_data() {
        let m = module_with_call_and_literal();
        let bytes = m.finish().unwrap();
        assert!(
            bytes.windows(5).any(|w| w == b"hello"),
            "literal content missing from the data section"
        );
    }
}

//! ELF relocatable object serialization for x86-64 System V.
//!
//! Layout: ELF64 header, section contents, then the section header table.
//! No program headers; this is `ET_REL`. Sections: NULL, `.text`, `.data`,
//! `.symtab`, `.strtab`, `.rela.text`, `.shstrtab`.

use crate::{Buffer, Layout, ObjectModule, ObjectResult, align_to};
use cot_codegen::binemit::Reloc;
use std::collections::HashMap;

const ET_REL: u16 = 1;
const EM_X86_64: u16 = 0x3E;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;

const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_WRITE: u64 = 0x1;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;

const EHDR_SIZE: u32 = 64;
const SHDR_SIZE: u32 = 64;
const SYM_SIZE: u32 = 24;
const RELA_SIZE: u32 = 24;

// Section indices.
const SEC_TEXT: u16 = 1;
const SEC_DATA: u16 = 2;
const SEC_SYMTAB: u16 = 3;
const SEC_STRTAB: u16 = 4;
const SEC_RELA_TEXT: u16 = 5;
const SEC_SHSTRTAB: u16 = 6;
const NUM_SECTIONS: u32 = 7;

struct Sym {
    name: String,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

pub(crate) fn write(module: &ObjectModule, layout: &Layout) -> ObjectResult<Vec<u8>> {
    // Symbols: the null entry, locals (literals), then globals. sh_info of
    // .symtab records where the globals start.
    let mut syms: Vec<Sym> = vec![Sym {
        name: String::new(),
        info: 0,
        shndx: 0,
        value: 0,
        size: 0,
    }];
    let mut index: HashMap<String, u32> = HashMap::new();

    for (i, lit) in module.literals.iter().enumerate() {
        index.insert(lit.symbol.clone(), syms.len() as u32);
        syms.push(Sym {
            name: lit.symbol.clone(),
            info: (STB_LOCAL << 4) | STT_OBJECT,
            shndx: SEC_DATA,
            value: layout.literal_offsets[i] as u64,
            size: lit.bytes.len() as u64,
        });
    }
    let first_global = syms.len() as u32;
    for (i, f) in module.funcs.iter().enumerate() {
        index.insert(f.name.clone(), syms.len() as u32);
        syms.push(Sym {
            name: f.name.clone(),
            info: (STB_GLOBAL << 4) | STT_FUNC,
            shndx: SEC_TEXT,
            value: layout.func_offsets[i] as u64,
            size: f.code.len() as u64,
        });
    }
    for (i, g) in module.globals.iter().enumerate() {
        index.insert(g.name.clone(), syms.len() as u32);
        syms.push(Sym {
            name: g.name.clone(),
            info: (STB_GLOBAL << 4) | STT_OBJECT,
            shndx: SEC_DATA,
            value: layout.global_offsets[i] as u64,
            size: g.size as u64,
        });
    }
    for (_, r) in &layout.text_relocs {
        if !index.contains_key(&r.name) {
            index.insert(r.name.clone(), syms.len() as u32);
            syms.push(Sym {
                name: r.name.clone(),
                info: STB_GLOBAL << 4,
                shndx: 0,
                value: 0,
                size: 0,
            });
        }
    }

    let mut strtab: Vec<u8> = vec![0];
    let mut stroffs: Vec<u32> = Vec::with_capacity(syms.len());
    for s in &syms {
        if s.name.is_empty() {
            stroffs.push(0);
            continue;
        }
        stroffs.push(strtab.len() as u32);
        strtab.extend_from_slice(s.name.as_bytes());
        strtab.push(0);
    }

    let shstrtab: &[u8] = b"\0.text\0.data\0.symtab\0.strtab\0.rela.text\0.shstrtab\0";
    let shname = |s: &str| -> u32 {
        let needle: Vec<u8> = s.as_bytes().to_vec();
        shstrtab
            .windows(needle.len() + 1)
            .position(|w| &w[..needle.len()] == needle.as_slice() && w[needle.len()] == 0)
            .unwrap() as u32
    };

    // File layout.
    let text_off = align_to(EHDR_SIZE, 16);
    let data_off = align_to(text_off + layout.text_size, 8);
    let symtab_off = align_to(data_off + layout.data_size, 8);
    let symtab_size = syms.len() as u32 * SYM_SIZE;
    let strtab_off = symtab_off + symtab_size;
    let rela_off = align_to(strtab_off + strtab.len() as u32, 8);
    let rela_size = layout.text_relocs.len() as u32 * RELA_SIZE;
    let shstrtab_off = rela_off + rela_size;
    let shoff = align_to(shstrtab_off + shstrtab.len() as u32, 8);

    let mut b = Buffer::new();

    // ELF64 header.
    b.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    b.bytes(&[0; 8]);
    b.u16(ET_REL);
    b.u16(EM_X86_64);
    b.u32(1); // e_version
    b.u64(0); // e_entry
    b.u64(0); // e_phoff
    b.u64(shoff as u64);
    b.u32(0); // e_flags
    b.u16(EHDR_SIZE as u16);
    b.u16(0); // e_phentsize
    b.u16(0); // e_phnum
    b.u16(SHDR_SIZE as u16);
    b.u16(NUM_SECTIONS as u16);
    b.u16(SEC_SHSTRTAB);

    // Contents.
    b.align(16);
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

    b.align(8);
    debug_assert_eq!(b.len(), symtab_off);
    for (s, &strx) in syms.iter().zip(&stroffs) {
        b.u32(strx);
        b.u8(s.info);
        b.u8(0); // st_other
        b.u16(s.shndx);
        b.u64(s.value);
        b.u64(s.size);
    }

    debug_assert_eq!(b.len(), strtab_off);
    b.bytes(&strtab);

    b.align(8);
    debug_assert_eq!(b.len(), rela_off);
    for (addr, r) in &layout.text_relocs {
        let sym = index[&r.name] as u64;
        let r_type = match r.kind {
            Reloc::X64CallRel32 => R_X86_64_PLT32,
            Reloc::X64PcRel32 => R_X86_64_PC32,
            Reloc::Abs8 => R_X86_64_64,
            Reloc::Arm64Call26 | Reloc::Arm64Page21 | Reloc::Arm64PageOff12 => {
                unreachable!("AArch64 relocation in an ELF object")
            }
        };
        b.u64(*addr as u64);
        b.u64((sym << 32) | r_type as u64);
        b.i64(r.addend);
    }

    debug_assert_eq!(b.len(), shstrtab_off);
    b.bytes(shstrtab);

    b.align(8);
    debug_assert_eq!(b.len(), shoff);

    // Section header table.
    let shdr = |name: u32,
                    sh_type: u32,
                    flags: u64,
                    offset: u32,
                    size: u32,
                    link: u32,
                    info: u32,
                    align: u64,
                    entsize: u64,
                    b: &mut Buffer| {
        b.u32(name);
        b.u32(sh_type);
        b.u64(flags);
        b.u64(0); // sh_addr
        b.u64(offset as u64);
        b.u64(size as u64);
        b.u32(link);
        b.u32(info);
        b.u64(align);
        b.u64(entsize);
    };

    shdr(0, 0, 0, 0, 0, 0, 0, 0, 0, &mut b);
    shdr(
        shname(".text"),
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        text_off,
        layout.text_size,
        0,
        0,
        16,
        0,
        &mut b,
    );
    shdr(
        shname(".data"),
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        data_off,
        layout.data_size,
        0,
        0,
        8,
        0,
        &mut b,
    );
    shdr(
        shname(".symtab"),
        SHT_SYMTAB,
        0,
        symtab_off,
        symtab_size,
        SEC_STRTAB as u32,
        first_global,
        8,
        SYM_SIZE as u64,
        &mut b,
    );
    shdr(
        shname(".strtab"),
        SHT_STRTAB,
        0,
        strtab_off,
        strtab.len() as u32,
        0,
        0,
        1,
        0,
        &mut b,
    );
    shdr(
        shname(".rela.text"),
        SHT_RELA,
        0,
        rela_off,
        rela_size,
        SEC_SYMTAB as u32,
        SEC_TEXT as u32,
        8,
        RELA_SIZE as u64,
        &mut b,
    );
    shdr(
        shname(".shstrtab"),
        SHT_STRTAB,
        0,
        shstrtab_off,
        shstrtab.len() as u32,
        0,
        0,
        1,
        0,
        &mut b,
    );

    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cot_codegen::binemit::{CompiledFunc, RelocEntry};
    use cot_codegen::isa::Arch;

    fn module() -> ObjectModule {
        let mut m = ObjectModule::new(Arch::X64);
        m.intern_literal("hi");
        m.add_function(CompiledFunc {
            name: "main".into(),
            code: vec![0xC3],
            relocs: vec![RelocEntry {
                offset: 0,
                kind: Reloc::X64CallRel32,
                name: "puts".into(),
                addend: -4,
            }],
        });
        m.add_global("counter", 8);
        m
    }

    #[test]
    fn header_is_valid_elf64_rel() {
        let bytes = module().finish().unwrap();
        assert_eq!(&bytes[0..4], b"\x7FELF");
        assert_eq!(bytes[4], 2); // 64-bit
        assert_eq!(bytes[5], 1); // little-endian
        assert_eq!(u16::from_le_bytes(bytes[16..18].try_into().unwrap()), 1); // ET_REL
        assert_eq!(
            u16::from_le_bytes(bytes[18..20].try_into().unwrap()),
            0x3E
        );
    }

    #[test]
    fn undefined_and_defined_symbols_present() {
        let bytes = module().finish().unwrap();
        for needle in [b"main\0".as_slice(), b"puts\0", b"counter\0", b"L.str.0\0"] {
            assert!(
                bytes.windows(needle.len()).any(|w| w == needle),
                "missing symbol name"
            );
        }
    }

    #[test]
    fn section_offsets_are_monotone() {
        let bytes = module().finish().unwrap();
        let shoff = u64::from_le_bytes(bytes[40..48].try_into().unwrap()) as usize;
        let shnum = u16::from_le_bytes(bytes[60..62].try_into().unwrap()) as usize;
        let mut last = 0u64;
        for i in 1..shnum {
            let off = u64::from_le_bytes(
                bytes[shoff + i * 64 + 24..shoff + i * 64 + 32]
                    .try_into()
                    .unwrap(),
            );
            assert!(off >= last, "section offsets must not go backwards");
            last = off;
        }
    }
}

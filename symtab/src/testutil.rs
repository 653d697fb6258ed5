//! Hand-assembled ELF and pclntab images for tests.

use std::path::Path;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use object::elf::{
    SHN_XINDEX, SHT_DYNSYM, SHT_NOBITS, SHT_NOTE, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL,
    STT_FUNC, STT_OBJECT,
};

use crate::elf::container::{Class, Endian};

struct Out {
    buf: Vec<u8>,
    endian: Endian,
    class: Class,
}

impl Out {
    fn new(endian: Endian, class: Class) -> Self {
        Out {
            buf: Vec::new(),
            endian,
            class,
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        match self.endian {
            Endian::Little => self.buf.write_u16::<LittleEndian>(v).unwrap(),
            Endian::Big => self.buf.write_u16::<BigEndian>(v).unwrap(),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.endian {
            Endian::Little => self.buf.write_u32::<LittleEndian>(v).unwrap(),
            Endian::Big => self.buf.write_u32::<BigEndian>(v).unwrap(),
        }
    }

    fn u64(&mut self, v: u64) {
        match self.endian {
            Endian::Little => self.buf.write_u64::<LittleEndian>(v).unwrap(),
            Endian::Big => self.buf.write_u64::<BigEndian>(v).unwrap(),
        }
    }

    fn word(&mut self, v: u64) {
        match self.class {
            Class::Elf32 => self.u32(v as u32),
            Class::Elf64 => self.u64(v),
        }
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn pad_to(&mut self, len: usize) {
        assert!(self.buf.len() <= len, "layout overlap");
        self.buf.resize(len, 0);
    }
}

fn align(v: usize, to: usize) -> usize {
    (v + to - 1) / to * to
}

#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub addr: u64,
    pub data: Vec<u8>,
    pub size: Option<u64>,
    pub link: Option<String>,
    pub entsize: u64,
}

impl Section {
    pub fn progbits(name: &str, addr: u64, data: Vec<u8>) -> Self {
        Section {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            addr,
            data,
            size: None,
            link: None,
            entsize: 0,
        }
    }

    pub fn nobits(name: &str, addr: u64, size: u64) -> Self {
        Section {
            sh_type: SHT_NOBITS,
            size: Some(size),
            ..Section::progbits(name, addr, Vec::new())
        }
    }

    /// A single ELF note. Fields are little endian regardless of the image.
    pub fn note(name: &str, owner: &str, n_type: u32, desc: &[u8]) -> Self {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(owner.len() as u32 + 1).unwrap();
        data.write_u32::<LittleEndian>(desc.len() as u32).unwrap();
        data.write_u32::<LittleEndian>(n_type).unwrap();
        data.extend_from_slice(owner.as_bytes());
        data.push(0);
        data.resize(align(data.len(), 4), 0);
        data.extend_from_slice(desc);
        data.resize(align(data.len(), 4), 0);
        Section {
            sh_type: SHT_NOTE,
            ..Section::progbits(name, 0, data)
        }
    }

    /// `.gnu_debuglink`: file name, padding, CRC32.
    pub fn debuglink(file: &str) -> Self {
        let mut data = file.as_bytes().to_vec();
        data.push(0);
        data.resize(align(data.len(), 4), 0);
        data.write_u32::<LittleEndian>(0xdeadbeef).unwrap();
        Section::progbits(".gnu_debuglink", 0, data)
    }
}

#[derive(Clone, Debug)]
pub struct Sym {
    pub name: String,
    pub value: u64,
    pub info: u8,
    pub name_off: Option<u32>,
}

impl Sym {
    pub fn func(name: &str, value: u64) -> Self {
        Sym {
            name: name.to_string(),
            value,
            info: (STB_GLOBAL << 4) | STT_FUNC,
            name_off: None,
        }
    }

    pub fn object(name: &str, value: u64) -> Self {
        Sym {
            info: (STB_GLOBAL << 4) | STT_OBJECT,
            ..Sym::func(name, value)
        }
    }
}

struct SymbolSpec {
    name: String,
    strtab: String,
    sh_type: u32,
    syms: Vec<Sym>,
}

struct Segment {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
}

pub struct ElfBuilder {
    e_type: u16,
    class: Class,
    endian: Endian,
    extended_numbering: bool,
    sections: Vec<Section>,
    symbols: Vec<SymbolSpec>,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(e_type: u16) -> Self {
        ElfBuilder {
            e_type,
            class: Class::Elf64,
            endian: Endian::Little,
            extended_numbering: false,
            sections: Vec::new(),
            symbols: Vec::new(),
            segments: Vec::new(),
        }
    }

    pub fn class(mut self, class: Class) -> Self {
        self.class = class;
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn extended_numbering(mut self) -> Self {
        self.extended_numbering = true;
        self
    }

    pub fn section(&mut self, section: Section) -> &mut Self {
        self.sections.push(section);
        self
    }

    pub fn symtab(&mut self, syms: Vec<Sym>) -> &mut Self {
        self.symbols.push(SymbolSpec {
            name: ".symtab".to_string(),
            strtab: ".strtab".to_string(),
            sh_type: SHT_SYMTAB,
            syms,
        });
        self
    }

    pub fn dynsym(&mut self, syms: Vec<Sym>) -> &mut Self {
        self.symbols.push(SymbolSpec {
            name: ".dynsym".to_string(),
            strtab: ".dynstr".to_string(),
            sh_type: SHT_DYNSYM,
            syms,
        });
        self
    }

    pub fn segment(&mut self, p_type: u32, flags: u32, offset: u64, vaddr: u64) -> &mut Self {
        self.segments.push(Segment {
            p_type,
            flags,
            offset,
            vaddr,
        });
        self
    }

    pub fn write(&self, path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(path, self.build()).unwrap();
    }

    pub fn build(&self) -> Vec<u8> {
        let is64 = self.class == Class::Elf64;
        let (ehsize, phentsize, shentsize, symsize) = if is64 {
            (64usize, 56usize, 64usize, 24usize)
        } else {
            (52, 32, 40, 16)
        };

        let mut sections = self.sections.clone();
        for def in &self.symbols {
            let mut strtab = vec![0u8];
            let mut table = Out::new(self.endian, self.class);
            table.bytes(&vec![0u8; symsize]);
            for sym in &def.syms {
                let name_off = sym.name_off.unwrap_or(strtab.len() as u32);
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
                if is64 {
                    table.u32(name_off);
                    table.u8(sym.info);
                    table.u8(0);
                    table.u16(1);
                    table.u64(sym.value);
                    table.u64(0x10);
                } else {
                    table.u32(name_off);
                    table.u32(sym.value as u32);
                    table.u32(0x10);
                    table.u8(sym.info);
                    table.u8(0);
                    table.u16(1);
                }
            }
            sections.push(Section {
                sh_type: SHT_STRTAB,
                ..Section::progbits(&def.strtab, 0, strtab)
            });
            sections.push(Section {
                sh_type: def.sh_type,
                link: Some(def.strtab.clone()),
                entsize: symsize as u64,
                ..Section::progbits(&def.name, 0, table.buf)
            });
        }

        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in &sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(s.name.as_bytes());
            shstrtab.push(0);
        }
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        sections.push(Section {
            sh_type: SHT_STRTAB,
            ..Section::progbits(".shstrtab", 0, shstrtab)
        });

        // section 0 is the null section
        let index_of = |name: &str| -> u32 {
            sections
                .iter()
                .position(|s| s.name == name)
                .map(|i| i as u32 + 1)
                .unwrap_or(0)
        };
        let shnum = sections.len() + 1;
        let shstrndx = shnum - 1;

        let mut offsets = Vec::new();
        let mut cursor = ehsize + phentsize * self.segments.len();
        for s in &sections {
            cursor = align(cursor, 8);
            offsets.push(cursor);
            if s.sh_type != SHT_NOBITS {
                cursor += s.data.len();
            }
        }
        let shoff = align(cursor, 8);

        let mut out = Out::new(self.endian, self.class);
        out.bytes(&[0x7f, b'E', b'L', b'F']);
        out.u8(if is64 { 2 } else { 1 });
        out.u8(if self.endian == Endian::Little { 1 } else { 2 });
        out.u8(1);
        out.pad_to(16);
        out.u16(self.e_type);
        out.u16(62);
        out.u32(1);
        out.word(0);
        out.word(if self.segments.is_empty() { 0 } else { ehsize as u64 });
        out.word(shoff as u64);
        out.u32(0);
        out.u16(ehsize as u16);
        out.u16(phentsize as u16);
        out.u16(self.segments.len() as u16);
        out.u16(shentsize as u16);
        if self.extended_numbering {
            out.u16(0);
            out.u16(SHN_XINDEX);
        } else {
            out.u16(shnum as u16);
            out.u16(shstrndx as u16);
        }

        for seg in &self.segments {
            if is64 {
                out.u32(seg.p_type);
                out.u32(seg.flags);
                out.u64(seg.offset);
                out.u64(seg.vaddr);
                out.u64(seg.vaddr);
                out.u64(0x1000);
                out.u64(0x1000);
                out.u64(0x1000);
            } else {
                out.u32(seg.p_type);
                out.u32(seg.offset as u32);
                out.u32(seg.vaddr as u32);
                out.u32(seg.vaddr as u32);
                out.u32(0x1000);
                out.u32(0x1000);
                out.u32(seg.flags);
                out.u32(0x1000);
            }
        }

        for (s, &off) in sections.iter().zip(&offsets) {
            if s.sh_type != SHT_NOBITS {
                out.pad_to(off);
                out.bytes(&s.data);
            }
        }
        out.pad_to(shoff);

        let mut shdr = |out: &mut Out,
                        name: u32,
                        sh_type: u32,
                        addr: u64,
                        offset: u64,
                        size: u64,
                        link: u32,
                        entsize: u64| {
            out.u32(name);
            out.u32(sh_type);
            out.word(0);
            out.word(addr);
            out.word(offset);
            out.word(size);
            out.u32(link);
            out.u32(0);
            out.word(8);
            out.word(entsize);
        };
        if self.extended_numbering {
            shdr(&mut out, 0, 0, 0, 0, shnum as u64, shstrndx as u32, 0);
        } else {
            shdr(&mut out, 0, 0, 0, 0, 0, 0, 0);
        }
        for ((s, &off), &name) in sections.iter().zip(&offsets).zip(&name_offsets) {
            let size = s.size.unwrap_or(s.data.len() as u64);
            let link = s.link.as_deref().map(index_of).unwrap_or(0);
            shdr(&mut out, name, s.sh_type, s.addr, off as u64, size, link, s.entsize);
        }
        out.buf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoVersion {
    Go12,
    Go116,
    Go118,
    Go120,
}

impl GoVersion {
    fn magic(self) -> u32 {
        match self {
            GoVersion::Go12 => 0xfffffffb,
            GoVersion::Go116 => 0xfffffffa,
            GoVersion::Go118 => 0xfffffff0,
            GoVersion::Go120 => 0xfffffff1,
        }
    }
}

/// Builds a `.gopclntab` holding only what symbolization reads: the header,
/// the function table, the `_func` records and the function names.
pub struct PclntabBuilder {
    pub version: GoVersion,
    pub ptr_size: u8,
    pub endian: Endian,
    pub text_start: u64,
    pub funcs: Vec<(String, u64)>,
    pub end: u64,
}

impl PclntabBuilder {
    pub fn new(version: GoVersion, text_start: u64, funcs: &[(&str, u64)], end: u64) -> Self {
        PclntabBuilder {
            version,
            ptr_size: 8,
            endian: Endian::Little,
            text_start,
            funcs: funcs.iter().map(|(n, pc)| (n.to_string(), *pc)).collect(),
            end,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let ptr = self.ptr_size as usize;
        let class = if ptr == 4 { Class::Elf32 } else { Class::Elf64 };
        let n = self.funcs.len();

        let mut names = Vec::new();
        let mut name_offs = Vec::new();
        for (name, _) in &self.funcs {
            name_offs.push(names.len() as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        let mut out = Out::new(self.endian, class);
        out.u32(self.version.magic());
        out.u8(0);
        out.u8(0);
        out.u8(1);
        out.u8(self.ptr_size);

        match self.version {
            GoVersion::Go12 => {
                let functab = 8 + ptr;
                let funcs = functab + (n + 1) * 2 * ptr;
                let func_size = ptr + 8;
                let names_at = funcs + n * func_size;
                out.word(n as u64);
                for (i, (_, pc)) in self.funcs.iter().enumerate() {
                    out.word(*pc);
                    out.word((funcs + i * func_size) as u64);
                }
                out.word(self.end);
                out.word(0);
                for (i, (_, pc)) in self.funcs.iter().enumerate() {
                    out.word(*pc);
                    out.u32(names_at as u32 + name_offs[i]);
                    out.u32(0);
                }
                out.bytes(&names);
            }
            GoVersion::Go116 => {
                let names_at = 8 + 7 * ptr;
                let pcln = align(names_at + names.len(), 8);
                let pairs = (n + 1) * 2 * ptr;
                let func_size = ptr + 8;
                for w in [n, 0, names_at, 0, 0, 0, pcln] {
                    out.word(w as u64);
                }
                out.bytes(&names);
                out.pad_to(pcln);
                for (i, (_, pc)) in self.funcs.iter().enumerate() {
                    out.word(*pc);
                    out.word((pairs + i * func_size) as u64);
                }
                out.word(self.end);
                out.word(0);
                for (i, (_, pc)) in self.funcs.iter().enumerate() {
                    out.word(*pc);
                    out.u32(name_offs[i]);
                    out.u32(0);
                }
            }
            GoVersion::Go118 | GoVersion::Go120 => {
                let names_at = 8 + 8 * ptr;
                let pcln = align(names_at + names.len(), 8);
                let pairs = (n + 1) * 8;
                for w in [n as u64, 0, self.text_start, names_at as u64, 0, 0, 0, pcln as u64] {
                    out.word(w);
                }
                out.bytes(&names);
                out.pad_to(pcln);
                for (i, (_, pc)) in self.funcs.iter().enumerate() {
                    out.u32((pc - self.text_start) as u32);
                    out.u32((pairs + i * 8) as u32);
                }
                out.u32((self.end - self.text_start) as u32);
                out.u32(0);
                for (i, (_, pc)) in self.funcs.iter().enumerate() {
                    out.u32((pc - self.text_start) as u32);
                    out.u32(name_offs[i]);
                }
            }
        }
        out.buf
    }
}

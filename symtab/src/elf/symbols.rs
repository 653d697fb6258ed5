use std::cell::RefCell;
use std::io;
use std::ops::Range;
use std::rc::Rc;

use log::debug;
use object::elf::{SHT_DYNSYM, SHT_STRTAB, SHT_SYMTAB, STT_FUNC};

use crate::address_index::AddressIndex;
use crate::elf::container::{BinaryContainer, Class, FieldReader, SectionHeader};
use crate::error::{Result, SymtabError};

// bit 31 of a name key selects the string table, the rest is the offset into it
const NAME_TABLE_BIT: u32 = 31;
const NAME_OFFSET_MASK: u32 = 0x7fff_ffff;

const SYMTAB: usize = 0;
const DYNSYM: usize = 1;

#[derive(Clone, Debug)]
pub struct SymbolOptions {
    /// Demangle Rust symbol names
    pub demangle: bool,
}

impl Default for SymbolOptions {
    fn default() -> Self {
        SymbolOptions { demangle: true }
    }
}

/// Which symbol sections to index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolSections {
    All,
    SymtabOnly,
    DynsymOnly,
}

impl SymbolSections {
    fn wants(self, table: usize) -> bool {
        match self {
            SymbolSections::All => true,
            SymbolSections::SymtabOnly => table == SYMTAB,
            SymbolSections::DynsymOnly => table == DYNSYM,
        }
    }
}

/// Function symbols from `.symtab` and `.dynsym`, sorted by address.
///
/// Names are not materialized up front: each entry keeps a 32 bit key naming
/// the string table and the offset in it, and names are read on lookup.
pub struct ElfSymbolTable {
    container: Rc<RefCell<BinaryContainer>>,
    index: AddressIndex,
    names: Vec<u32>,
    string_tables: [Option<SectionHeader>; 2],
    demangle: bool,
}

impl ElfSymbolTable {
    /// Indexes function symbols. Addresses inside `skip` are left out; that is
    /// where the Go runtime table already has names.
    pub fn new(
        container: Rc<RefCell<BinaryContainer>>,
        sections: SymbolSections,
        skip: Option<Range<u64>>,
        options: &SymbolOptions,
    ) -> Result<Self> {
        let mut symbols: Vec<(u64, u32)> = Vec::new();
        let mut string_tables = [None, None];
        {
            let mut c = container.borrow_mut();
            for (table, sh_type) in [(SYMTAB, SHT_SYMTAB), (DYNSYM, SHT_DYNSYM)] {
                if !sections.wants(table) {
                    continue;
                }
                let section = c.sections()?.iter().find(|s| s.sh_type == sh_type).cloned();
                let Some(section) = section else {
                    continue;
                };
                let strtab =
                    read_symbols(&mut c, &section, table as u32, skip.as_ref(), &mut symbols)?;
                string_tables[table] = Some(strtab);
            }
        }
        if symbols.is_empty() {
            return Err(SymtabError::NoSymbols);
        }

        symbols.sort_unstable();
        let mut index = AddressIndex::new(symbols.len());
        let mut names = Vec::with_capacity(symbols.len());
        for (i, &(value, key)) in symbols.iter().enumerate() {
            index.set(i, value);
            names.push(key);
        }
        debug!(
            "indexed {} symbols from {}",
            names.len(),
            container.borrow().name()
        );

        Ok(ElfSymbolTable {
            container,
            index,
            names,
            string_tables,
            demangle: options.demangle,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn resolve(&self, addr: u64) -> Option<String> {
        let i = self.index.find_index(addr)?;
        let key = self.names[i];
        let table = (key >> NAME_TABLE_BIT) as usize;
        let strtab = self.string_tables[table].as_ref()?;
        let offset = strtab.offset + (key & NAME_OFFSET_MASK) as u64;

        let name = match self.container.borrow_mut().read_cstring(offset) {
            Ok(name) => name,
            Err(e) => {
                debug!("failed to read symbol name at 0x{:x}: {}", offset, e);
                return None;
            }
        };
        if name.is_empty() {
            return None;
        }
        if self.demangle {
            return Some(demangle(name));
        }
        Some(name)
    }

    pub fn is_dead(&self) -> bool {
        self.container.borrow().is_dead()
    }

    pub fn cleanup(&mut self) {
        self.container.borrow_mut().release();
    }
}

fn read_symbols(
    c: &mut BinaryContainer,
    section: &SectionHeader,
    table: u32,
    skip: Option<&Range<u64>>,
    out: &mut Vec<(u64, u32)>,
) -> Result<SectionHeader> {
    let class = c.header().class;
    let entsize = match class {
        Class::Elf32 => 16u64,
        Class::Elf64 => 24u64,
    };
    if section.size % entsize != 0 {
        return Err(SymtabError::malformed(
            c.name(),
            format!("{} size {} is not a multiple of {}", section.name, section.size, entsize),
        ));
    }
    let strtab = match c.section_at(section.link as usize)? {
        Some(s) if s.sh_type == SHT_STRTAB && !s.is_nobits() => s,
        _ => {
            return Err(SymtabError::malformed(
                c.name(),
                format!("{} links to invalid string table {}", section.name, section.link),
            ))
        }
    };

    let data = c.section_data(section)?;
    // the first entry is the null symbol
    for raw in data.chunks_exact(entsize as usize).skip(1) {
        let (name, info, value) = parse_symbol(&mut c.fields(raw), class)
            .map_err(|e| SymtabError::malformed(c.name(), e.to_string()))?;

        if value == 0 || info & 0xf != STT_FUNC {
            continue;
        }
        if skip.is_some_and(|r| r.contains(&value)) {
            continue;
        }
        if name >= NAME_OFFSET_MASK {
            return Err(SymtabError::malformed(
                c.name(),
                format!("symbol name offset 0x{:x} out of range", name),
            ));
        }
        out.push((value, name | (table << NAME_TABLE_BIT)));
    }
    Ok(strtab)
}

// (st_name, st_info, st_value)
fn parse_symbol(r: &mut FieldReader, class: Class) -> io::Result<(u32, u8, u64)> {
    match class {
        Class::Elf64 => {
            let name = r.u32()?;
            let info = r.u8()?;
            let _other = r.u8()?;
            let _shndx = r.u16()?;
            Ok((name, info, r.u64()?))
        }
        Class::Elf32 => {
            let name = r.u32()?;
            let value = r.u32()? as u64;
            let _size = r.u32()?;
            Ok((name, r.u8()?, value))
        }
    }
}

fn demangle(name: String) -> String {
    match rustc_demangle::try_demangle(&name) {
        Ok(d) => format!("{:#}", d),
        Err(_) => name,
    }
}

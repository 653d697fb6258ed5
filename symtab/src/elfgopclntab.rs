// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

// This implements Go 1.2+ .pclntab symbol parsing as defined
// in http://golang.org/s/go12symtab. Only function entry points and names
// are read; line tables are not decoded.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;

use crate::address_index::AddressIndex;
use crate::elf::container::{BinaryContainer, Endian, SectionHeader};
use crate::error::{Result, SymtabError};

// pclntab bytes are pulled through a window of this size
const READ_WINDOW: usize = 64 * 1024;

const HEADER_SIZE: usize = 16;

// internally used gopclntab version
const GO_INVALID: u8 = 0;
const GO1_2: u8 = 2;
const GO1_16: u8 = 16;
const GO1_18: u8 = 18;
const GO1_20: u8 = 20;

pub fn go_magic_to_version(magic: u32) -> u8 {
    match magic {
        0xfffffffb => GO1_2,  // Go 1.2
        0xfffffffa => GO1_16, // Go 1.16
        0xfffffff0 => GO1_18, // Go 1.18
        0xfffffff1 => GO1_20, // Go 1.20
        _ => GO_INVALID,
    }
}

// Reads little pieces of .gopclntab without loading the whole section.
struct PclntabReader {
    container: Rc<RefCell<BinaryContainer>>,
    section_offset: u64,
    section_size: u64,
    window: Vec<u8>,
    window_at: u64,
    endian: Endian,
    ptr_size: u8,
}

impl PclntabReader {
    fn new(container: Rc<RefCell<BinaryContainer>>, section: &SectionHeader) -> Self {
        PclntabReader {
            container,
            section_offset: section.offset,
            section_size: section.size,
            window: Vec::new(),
            window_at: 0,
            endian: Endian::Little,
            ptr_size: 8,
        }
    }

    // bytes returns `len` bytes at offset `at` relative to the section start
    fn bytes(&mut self, at: u64, len: usize) -> Result<&[u8]> {
        let end = at
            .checked_add(len as u64)
            .filter(|&end| end <= self.section_size)
            .ok_or_else(|| {
                SymtabError::GoParseFailed(format!(
                    "read of {} bytes at 0x{:x} is outside .gopclntab (size 0x{:x})",
                    len, at, self.section_size
                ))
            })?;
        let cached = at >= self.window_at && end <= self.window_at + self.window.len() as u64;
        if !cached {
            let want = (self.section_size - at).min(READ_WINDOW as u64).max(len as u64);
            self.window.resize(want as usize, 0);
            let read = self
                .container
                .borrow_mut()
                .read_exact_at(&mut self.window, self.section_offset + at);
            if let Err(e) = read {
                self.window.clear();
                return Err(e);
            }
            self.window_at = at;
        }
        let start = (at - self.window_at) as usize;
        Ok(&self.window[start..start + len])
    }

    fn u32_at(&mut self, at: u64) -> Result<u32> {
        let endian = self.endian;
        let b = self.bytes(at, 4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        })
    }

    // uintptr returns the pointer-sized value encoded at `at`
    fn uintptr_at(&mut self, at: u64) -> Result<u64> {
        self.field_at(at, self.ptr_size)
    }

    fn field_at(&mut self, at: u64, size: u8) -> Result<u64> {
        if size == 4 {
            return self.u32_at(at).map(u64::from);
        }
        let endian = self.endian;
        let b = self.bytes(at, 8)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PclntabHeader {
    version: u8,
    endian: Endian,
    quantum: u8,
    ptr_size: u8,
}

// Check header: 4-byte magic, two zeros, pc quantum, pointer size.
fn parse_header(header: &[u8]) -> Option<PclntabHeader> {
    if header.len() < HEADER_SIZE || header[4] != 0 || header[5] != 0 {
        return None;
    }
    let quantum = header[6];
    let ptr_size = header[7];
    if !matches!(quantum, 1 | 2 | 4) || !matches!(ptr_size, 4 | 8) {
        return None;
    }
    let le = go_magic_to_version(LittleEndian::read_u32(header));
    let be = go_magic_to_version(BigEndian::read_u32(header));
    let (version, endian) = if le != GO_INVALID {
        (le, Endian::Little)
    } else if be != GO_INVALID {
        (be, Endian::Big)
    } else {
        return None;
    };
    Some(PclntabHeader {
        version,
        endian,
        quantum,
        ptr_size,
    })
}

fn checked_add(a: u64, b: u64, what: &str) -> Result<u64> {
    a.checked_add(b).ok_or_else(|| {
        SymtabError::GoParseFailed(format!("{} overflows: 0x{:x} + 0x{:x}", what, a, b))
    })
}

/// Function table decoded from a Go binary's `.gopclntab`.
pub struct GoRuntimeTable {
    container: Rc<RefCell<BinaryContainer>>,
    index: AddressIndex,
    name_offsets: Vec<u32>,
    end: u64,
    // absolute file offset of funcnametab
    funcnametab: u64,
    version: u8,
}

impl GoRuntimeTable {
    pub fn new(container: Rc<RefCell<BinaryContainer>>) -> Result<Self> {
        let (text, pclntab) = {
            let mut c = container.borrow_mut();
            (c.section(".text")?, c.section(".gopclntab")?)
        };
        let (Some(text), Some(pclntab)) = (text, pclntab) else {
            return Err(SymtabError::NoSymbols);
        };
        if pclntab.is_nobits() || text.is_nobits() {
            return Err(SymtabError::NoSymbols);
        }

        let mut functab_reader = PclntabReader::new(container.clone(), &pclntab);
        let header = match functab_reader.bytes(0, HEADER_SIZE) {
            Ok(b) => parse_header(b),
            Err(_) => None,
        };
        let Some(header) = header else {
            return Err(SymtabError::GoTooOld);
        };
        functab_reader.endian = header.endian;
        functab_reader.ptr_size = header.ptr_size;
        let mut func_reader = PclntabReader::new(container.clone(), &pclntab);
        func_reader.endian = header.endian;
        func_reader.ptr_size = header.ptr_size;

        let ptr = header.ptr_size as u64;
        let offset = |r: &mut PclntabReader, word: u64| r.uintptr_at(8 + word * ptr);
        let r = &mut functab_reader;

        let (nfunc, text_start, funcnametab, funcdata, functab) = match header.version {
            GO1_18 | GO1_20 => {
                let nfunc = offset(r, 0)?;
                let runtime_text = offset(r, 2)?;
                let funcnametab = offset(r, 3)?;
                let functab = offset(r, 7)?;
                let text_start = if runtime_text != 0 {
                    runtime_text
                } else {
                    text.addr
                };
                (nfunc, text_start, funcnametab, functab, functab)
            }
            GO1_16 => {
                let nfunc = offset(r, 0)?;
                let funcnametab = offset(r, 2)?;
                let functab = offset(r, 6)?;
                (nfunc, text.addr, funcnametab, functab, functab)
            }
            _ => {
                let nfunc = r.uintptr_at(8)?;
                (nfunc, text.addr, 0, 0, 8 + ptr)
            }
        };

        let relative = header.version >= GO1_18;
        let text_end = checked_add(text.addr, text.size, ".text end")?;
        if relative && (text_start < text.addr || text_start >= text_end) {
            return Err(SymtabError::malformed(
                container.borrow().name(),
                format!(
                    "runtime.text 0x{:x} outside .text [0x{:x}, 0x{:x})",
                    text_start, text.addr, text_end
                ),
            ));
        }
        if nfunc == 0 {
            return Err(SymtabError::GoSymbolsNotFound);
        }

        // functab entries are (entry, funcoff) pairs of this size
        let field = if relative { 4u8 } else { header.ptr_size };
        let sz = field as u64;
        let functab_len = nfunc
            .checked_mul(2 * sz)
            .and_then(|n| n.checked_add(sz))
            .and_then(|n| n.checked_add(functab));
        if functab_len.map_or(true, |n| n > pclntab.size) {
            return Err(SymtabError::GoParseFailed(format!(
                "{} functions do not fit in .gopclntab",
                nfunc
            )));
        }
        let nfunc = nfunc as usize;
        let entry_base = if relative { text_start } else { 0 };

        let mut index = AddressIndex::new(nfunc);
        let mut name_offsets = Vec::with_capacity(nfunc);
        // functab offsets below are bounded by functab_len, the values read are not
        for i in 0..nfunc as u64 {
            let entry = functab_reader.field_at(functab + 2 * i * sz, field)?;
            let funcoff = functab_reader.field_at(functab + (2 * i + 1) * sz, field)?;
            // _func starts with the entry (uint32 since 1.18), then nameOff
            let func = checked_add(funcdata, funcoff, "funcoff")
                .and_then(|at| checked_add(at, sz, "funcoff"))?;
            let name_off = func_reader.u32_at(func)?;
            index.set(i as usize, checked_add(entry_base, entry, "function entry")?);
            name_offsets.push(name_off);
        }
        let end_off = functab_reader.field_at(functab + 2 * nfunc as u64 * sz, field)?;
        let end = checked_add(entry_base, end_off, "function table end")?;
        if end == 0 {
            return Err(SymtabError::GoSymbolsNotFound);
        }

        debug!(
            "parsed .gopclntab go1.{} quantum {}: {} functions, end 0x{:x}",
            header.version, header.quantum, nfunc, end
        );

        Ok(GoRuntimeTable {
            container,
            index,
            name_offsets,
            end,
            funcnametab: checked_add(pclntab.offset, funcnametab, "funcnametab")?,
            version: header.version,
        })
    }

    pub fn len(&self) -> usize {
        self.name_offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name_offsets.is_empty()
    }

    /// Address range covered by Go functions, `[first entry, end)`.
    pub fn range(&self) -> Range<u64> {
        self.index.first().unwrap_or(self.end)..self.end
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn resolve(&self, pc: u64) -> Option<String> {
        if pc >= self.end {
            return None;
        }
        let i = self.index.find_index(pc)?;
        let offset = self.funcnametab.checked_add(self.name_offsets[i] as u64)?;
        match self.container.borrow_mut().read_cstring(offset) {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                debug!("failed to read go function name at 0x{:x}: {}", offset, e);
                None
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        self.container.borrow().is_dead()
    }

    pub fn cleanup(&mut self) {
        self.container.borrow_mut().release();
    }
}

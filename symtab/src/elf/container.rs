use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use log::debug;
use object::elf::{
    ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, ELFMAG, ET_EXEC, SHN_XINDEX, SHT_NOBITS,
};

use crate::error::{Result, SymtabError};

// strings are read in chunks of this size, at most STRING_MAX_CHUNKS of them
const STRING_CHUNK: usize = 128;
const STRING_MAX_CHUNKS: usize = 10;

// e_ident indices
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const ELF64_HEADER_SIZE: usize = 64;
const ELF32_HEADER_SIZE: usize = 52;

/// Random access reads over the bytes of one binary.
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at end of input.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Drops any OS handle. The next read reopens it.
    fn release(&mut self) {}

    /// True once the source can no longer be reopened.
    fn is_dead(&self) -> bool {
        false
    }
}

/// A file read with `pread`, reopened lazily after `release`.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    dead: bool,
}

impl FileSource {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(FileSource {
            path,
            file: Some(file),
            dead: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&mut self) -> io::Result<&File> {
        if self.dead {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is gone", self.path.display()),
            ));
        }
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    debug!("reopen of {} failed: {}", self.path.display(), e);
                    // anything but a missing file (EMFILE, EACCES, ...) may clear up
                    if e.kind() == io::ErrorKind::NotFound {
                        self.dead = true;
                    }
                    return Err(e);
                }
            }
        }
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

impl ByteSource for FileSource {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = self.ensure_open()?;
        file.read_at(buf, offset)
    }

    fn release(&mut self) {
        self.file = None;
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}

impl ByteSource for Vec<u8> {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    Elf32,
    Elf64,
}

/// Field-at-a-time decoder over a byte slice.
pub struct FieldReader<'a> {
    cursor: Cursor<&'a [u8]>,
    endian: Endian,
    class: Class,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8], endian: Endian, class: Class) -> Self {
        FieldReader {
            cursor: Cursor::new(data),
            endian,
            class,
        }
    }

    pub fn u8(&mut self) -> io::Result<u8> {
        self.cursor.read_u8()
    }

    pub fn u16(&mut self) -> io::Result<u16> {
        match self.endian {
            Endian::Little => self.cursor.read_u16::<LittleEndian>(),
            Endian::Big => self.cursor.read_u16::<BigEndian>(),
        }
    }

    pub fn u32(&mut self) -> io::Result<u32> {
        match self.endian {
            Endian::Little => self.cursor.read_u32::<LittleEndian>(),
            Endian::Big => self.cursor.read_u32::<BigEndian>(),
        }
    }

    pub fn u64(&mut self) -> io::Result<u64> {
        match self.endian {
            Endian::Little => self.cursor.read_u64::<LittleEndian>(),
            Endian::Big => self.cursor.read_u64::<BigEndian>(),
        }
    }

    /// Address or offset sized word: 4 bytes for ELF32, 8 for ELF64.
    pub fn word(&mut self) -> io::Result<u64> {
        match self.class {
            Class::Elf32 => self.u32().map(u64::from),
            Class::Elf64 => self.u64(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileHeader {
    pub class: Class,
    pub endian: Endian,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub entsize: u64,
}

impl SectionHeader {
    pub fn is_nobits(&self) -> bool {
        self.sh_type == SHT_NOBITS
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

/// Lazily parsed ELF file.
///
/// Only the file header is decoded up front. Section and program headers are
/// read on first use, string table lookups are cached by absolute file offset.
pub struct BinaryContainer {
    name: String,
    source: Box<dyn ByteSource>,
    header: FileHeader,
    sections: Option<Vec<SectionHeader>>,
    programs: Option<Vec<ProgramHeader>>,
    strings: HashMap<u64, String>,
}

impl BinaryContainer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = FileSource::open(path).map_err(|e| SymtabError::io(path, e))?;
        Self::new(path.display().to_string(), Box::new(source))
    }

    /// Parses an ELF image held in memory, e.g. a decompressed `.gnu_debugdata`.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        Self::new(name.into(), Box::new(data))
    }

    pub fn new(name: String, mut source: Box<dyn ByteSource>) -> Result<Self> {
        let header = read_file_header(&name, source.as_mut())?;
        Ok(BinaryContainer {
            name,
            source,
            header,
            sections: None,
            programs: None,
            strings: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn is_exec(&self) -> bool {
        self.header.e_type == ET_EXEC
    }

    pub fn is_dead(&self) -> bool {
        self.source.is_dead()
    }

    /// Closes the file handle and forgets cached strings. Reads after this
    /// reopen the file.
    pub fn release(&mut self) {
        self.source.release();
        self.strings.clear();
    }

    pub fn fields<'b>(&self, data: &'b [u8]) -> FieldReader<'b> {
        FieldReader::new(data, self.header.endian, self.header.class)
    }

    /// Reads as many bytes as are available at `offset`, up to `buf.len()`.
    pub fn read_some(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .source
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let n = self.read_some(buf, offset)?;
        if n < buf.len() {
            return Err(SymtabError::malformed(
                &self.name,
                format!("short read at 0x{:x}: {} of {} bytes", offset, n, buf.len()),
            ));
        }
        Ok(())
    }

    pub fn sections(&mut self) -> Result<&[SectionHeader]> {
        if self.sections.is_none() {
            let sections = self.read_sections()?;
            self.sections = Some(sections);
        }
        Ok(self.sections.as_deref().unwrap_or_default())
    }

    pub fn section(&mut self, name: &str) -> Result<Option<SectionHeader>> {
        Ok(self.sections()?.iter().find(|s| s.name == name).cloned())
    }

    pub fn section_at(&mut self, index: usize) -> Result<Option<SectionHeader>> {
        Ok(self.sections()?.get(index).cloned())
    }

    pub fn program_headers(&mut self) -> Result<&[ProgramHeader]> {
        if self.programs.is_none() {
            let programs = self.read_program_headers()?;
            self.programs = Some(programs);
        }
        Ok(self.programs.as_deref().unwrap_or_default())
    }

    pub fn section_data(&mut self, section: &SectionHeader) -> Result<Vec<u8>> {
        if section.is_nobits() {
            return Err(SymtabError::malformed(
                &self.name,
                format!("section {} has no data", section.name),
            ));
        }
        let len = usize::try_from(section.size)
            .map_err(|_| SymtabError::malformed(&self.name, "section too large"))?;
        let mut data = vec![0u8; len];
        self.read_exact_at(&mut data, section.offset)?;
        Ok(data)
    }

    /// Reads a NUL terminated string at an absolute file offset.
    pub fn read_cstring(&mut self, offset: u64) -> Result<String> {
        if let Some(s) = self.strings.get(&offset) {
            return Ok(s.clone());
        }
        let mut bytes = Vec::with_capacity(STRING_CHUNK);
        let mut chunk = [0u8; STRING_CHUNK];
        for i in 0..STRING_MAX_CHUNKS {
            let at = offset + (i * STRING_CHUNK) as u64;
            let n = self.read_some(&mut chunk, at)?;
            if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                let s = String::from_utf8_lossy(&bytes).into_owned();
                self.strings.insert(offset, s.clone());
                return Ok(s);
            }
            bytes.extend_from_slice(&chunk[..n]);
            if n < STRING_CHUNK {
                break;
            }
        }
        Err(SymtabError::malformed(
            &self.name,
            format!("unterminated string at 0x{:x}", offset),
        ))
    }

    fn io_error(&self, e: io::Error) -> SymtabError {
        if self.source.is_dead() {
            SymtabError::FileDead(self.name.clone())
        } else {
            SymtabError::io(&self.name, e)
        }
    }

    fn read_sections(&mut self) -> Result<Vec<SectionHeader>> {
        let h = self.header.clone();
        if h.e_shoff == 0 {
            return Ok(Vec::new());
        }
        let entsize = match h.class {
            Class::Elf32 => 40,
            Class::Elf64 => 64,
        };
        if (h.e_shentsize as usize) < entsize {
            return Err(SymtabError::malformed(
                &self.name,
                format!("invalid e_shentsize {}", h.e_shentsize),
            ));
        }

        let mut first = vec![0u8; entsize];
        self.read_exact_at(&mut first, h.e_shoff)?;
        let first = self.parse_section(&first)?;

        // extended numbering keeps the real counts in section 0
        let shnum = if h.e_shnum == 0 {
            first.size as usize
        } else {
            h.e_shnum as usize
        };
        let shstrndx = if h.e_shstrndx == SHN_XINDEX {
            first.link as usize
        } else {
            h.e_shstrndx as usize
        };

        let stride = h.e_shentsize as u64;
        let mut raw = vec![0u8; entsize];
        let mut sections = Vec::with_capacity(shnum);
        let mut name_offsets = Vec::with_capacity(shnum);
        for i in 0..shnum {
            self.read_exact_at(&mut raw, h.e_shoff + i as u64 * stride)?;
            let section = self.parse_section(&raw)?;
            name_offsets.push(self.fields(&raw).u32().map_err(|e| self.io_error(e))?);
            sections.push(section);
        }

        if let Some(strtab) = sections.get(shstrndx).cloned() {
            if !strtab.is_nobits() {
                for (section, &name_off) in sections.iter_mut().zip(&name_offsets) {
                    if name_off as u64 >= strtab.size {
                        continue;
                    }
                    section.name = self.read_cstring(strtab.offset + name_off as u64)?;
                }
            }
        }
        Ok(sections)
    }

    fn parse_section(&self, raw: &[u8]) -> Result<SectionHeader> {
        parse_section(&mut self.fields(raw)).map_err(|e| self.io_error(e))
    }

    fn read_program_headers(&mut self) -> Result<Vec<ProgramHeader>> {
        let h = self.header.clone();
        if h.e_phoff == 0 || h.e_phnum == 0 {
            return Ok(Vec::new());
        }
        let entsize = match h.class {
            Class::Elf32 => 32,
            Class::Elf64 => 56,
        };
        if (h.e_phentsize as usize) < entsize {
            return Err(SymtabError::malformed(
                &self.name,
                format!("invalid e_phentsize {}", h.e_phentsize),
            ));
        }
        let mut raw = vec![0u8; entsize];
        let mut programs = Vec::with_capacity(h.e_phnum as usize);
        for i in 0..h.e_phnum as u64 {
            self.read_exact_at(&mut raw, h.e_phoff + i * h.e_phentsize as u64)?;
            let mut r = self.fields(&raw);
            let parsed = match h.class {
                Class::Elf64 => parse_program64(&mut r),
                Class::Elf32 => parse_program32(&mut r),
            };
            programs.push(parsed.map_err(|e| self.io_error(e))?);
        }
        Ok(programs)
    }
}

fn parse_section(r: &mut FieldReader) -> io::Result<SectionHeader> {
    let _name = r.u32()?;
    let sh_type = r.u32()?;
    let flags = r.word()?;
    let addr = r.word()?;
    let offset = r.word()?;
    let size = r.word()?;
    let link = r.u32()?;
    let info = r.u32()?;
    let _align = r.word()?;
    let entsize = r.word()?;
    Ok(SectionHeader {
        name: String::new(),
        sh_type,
        flags,
        addr,
        offset,
        size,
        link,
        info,
        entsize,
    })
}

fn parse_program64(r: &mut FieldReader) -> io::Result<ProgramHeader> {
    let p_type = r.u32()?;
    let flags = r.u32()?;
    let offset = r.u64()?;
    let vaddr = r.u64()?;
    let _paddr = r.u64()?;
    let filesz = r.u64()?;
    let memsz = r.u64()?;
    Ok(ProgramHeader {
        p_type,
        flags,
        offset,
        vaddr,
        filesz,
        memsz,
    })
}

fn parse_program32(r: &mut FieldReader) -> io::Result<ProgramHeader> {
    let p_type = r.u32()?;
    let offset = r.u32()? as u64;
    let vaddr = r.u32()? as u64;
    let _paddr = r.u32()?;
    let filesz = r.u32()? as u64;
    let memsz = r.u32()? as u64;
    let flags = r.u32()?;
    Ok(ProgramHeader {
        p_type,
        flags,
        offset,
        vaddr,
        filesz,
        memsz,
    })
}

fn read_file_header(name: &str, source: &mut dyn ByteSource) -> Result<FileHeader> {
    let mut raw = [0u8; ELF64_HEADER_SIZE];
    let mut filled = 0;
    while filled < raw.len() {
        let n = source
            .read_at(&mut raw[filled..], filled as u64)
            .map_err(|e| SymtabError::io(name, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < 16 || raw[..4] != ELFMAG {
        return Err(SymtabError::NotElf(name.to_string()));
    }
    let class = match raw[EI_CLASS] {
        ELFCLASS32 => Class::Elf32,
        ELFCLASS64 => Class::Elf64,
        other => {
            return Err(SymtabError::malformed(name, format!("unknown ELF class {}", other)))
        }
    };
    let endian = match raw[EI_DATA] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        other => {
            let reason = format!("unknown ELF data encoding {}", other);
            return Err(SymtabError::malformed(name, reason));
        }
    };
    let need = match class {
        Class::Elf32 => ELF32_HEADER_SIZE,
        Class::Elf64 => ELF64_HEADER_SIZE,
    };
    if filled < need {
        return Err(SymtabError::malformed(name, "truncated ELF header"));
    }

    let mut r = FieldReader::new(&raw[16..need], endian, class);
    parse_file_header(&mut r, class, endian)
        .map_err(|e| SymtabError::malformed(name, e.to_string()))
}

fn parse_file_header(
    r: &mut FieldReader,
    class: Class,
    endian: Endian,
) -> io::Result<FileHeader> {
    let e_type = r.u16()?;
    let e_machine = r.u16()?;
    let _version = r.u32()?;
    let _entry = r.word()?;
    let e_phoff = r.word()?;
    let e_shoff = r.word()?;
    let _flags = r.u32()?;
    let _ehsize = r.u16()?;
    Ok(FileHeader {
        class,
        endian,
        e_type,
        e_machine,
        e_phoff,
        e_shoff,
        e_phentsize: r.u16()?,
        e_phnum: r.u16()?,
        e_shentsize: r.u16()?,
        e_shnum: r.u16()?,
        e_shstrndx: r.u16()?,
    })
}

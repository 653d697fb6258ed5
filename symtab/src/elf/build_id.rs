use std::fmt;

use serde::Serialize;

use crate::elf::container::BinaryContainer;
use crate::error::{Result, SymtabError};

const GNU_NOTE: &str = ".note.gnu.build-id";
const GO_NOTE: &str = ".note.go.buildid";

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize)]
pub enum BuildIdKind {
    #[default]
    Gnu,
    Go,
}

/// Content derived identity of a binary. The empty id means "no build ID".
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, Serialize)]
pub struct BuildId {
    pub id: String,
    pub kind: BuildIdKind,
}

impl BuildId {
    pub fn gnu(id: impl Into<String>) -> Self {
        BuildId {
            id: id.into(),
            kind: BuildIdKind::Gnu,
        }
    }

    pub fn go(id: impl Into<String>) -> Self {
        BuildId {
            id: id.into(),
            kind: BuildIdKind::Go,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub fn is_gnu(&self) -> bool {
        self.kind == BuildIdKind::Gnu
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BuildIdKind::Gnu => write!(f, "gnu:{}", self.id),
            BuildIdKind::Go => write!(f, "go:{}", self.id),
        }
    }
}

/// Reads the GNU build ID, falling back to the Go one.
///
/// Returns `NoBuildIdSection` when the binary carries neither note. A note that
/// is present but malformed is an error.
pub fn read_build_id(c: &mut BinaryContainer) -> Result<BuildId> {
    match gnu_build_id(c) {
        Ok(id) => return Ok(id),
        Err(SymtabError::NoBuildIdSection) => {}
        Err(e) => return Err(e),
    }
    go_build_id(c)
}

pub fn gnu_build_id(c: &mut BinaryContainer) -> Result<BuildId> {
    let section = c.section(GNU_NOTE)?.ok_or(SymtabError::NoBuildIdSection)?;
    let data = c.section_data(&section)?;
    if data.len() < 16 || &data[12..15] != b"GNU" {
        return Err(SymtabError::malformed(c.name(), format!("invalid {}", GNU_NOTE)));
    }
    let raw = &data[16..];
    if raw.len() != 20 && raw.len() != 8 {
        return Err(SymtabError::malformed(
            c.name(),
            format!("wrong build ID length {}", raw.len()),
        ));
    }
    Ok(BuildId::gnu(hex::encode(raw)))
}

pub fn go_build_id(c: &mut BinaryContainer) -> Result<BuildId> {
    let section = c.section(GO_NOTE)?.ok_or(SymtabError::NoBuildIdSection)?;
    let data = c.section_data(&section)?;
    if data.len() < 17 {
        return Err(SymtabError::malformed(c.name(), format!("invalid {}", GO_NOTE)));
    }
    let desc = &data[16..];
    let end = desc.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let id = String::from_utf8_lossy(&desc[..end]).into_owned();
    if id == "redacted" {
        return Err(SymtabError::malformed(c.name(), format!("redacted {}", GO_NOTE)));
    }
    if id.len() < 40 || id.matches('/').count() < 2 {
        return Err(SymtabError::malformed(
            c.name(),
            format!("wrong {} {:?}", GO_NOTE, id),
        ));
    }
    Ok(BuildId::go(id))
}

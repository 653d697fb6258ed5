//! Structured error types for symbol table loading
//!
//! Every failure ends up as the sticky error state of one table incarnation, so
//! the variants mirror the ways a binary can be unusable rather than call sites.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = SymtabError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SymtabError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not an ELF file")]
    NotElf(String),

    #[error("malformed ELF {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("no symbols")]
    NoSymbols,

    #[error("build ID section not found")]
    NoBuildIdSection,

    #[error("elf base not found")]
    ElfBaseNotFound,

    #[error("gopclntab is too old or has an unknown header")]
    GoTooOld,

    #[error("gopclntab parse failed: {0}")]
    GoParseFailed(String),

    #[error("gopclntab has no functions")]
    GoSymbolsNotFound,

    #[error("backing file {0} is gone")]
    FileDead(String),

    #[error("failed to unpack .gnu_debugdata: {0}")]
    MiniDebugInfo(String),

    #[error("s: {symbols} g: {go}")]
    NoUsableTable {
        symbols: Box<SymtabError>,
        go: Box<SymtabError>,
    },
}

impl SymtabError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SymtabError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SymtabError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the file or process disappeared while we were looking at it.
    /// Expected under process churn, so callers keep it out of error logs.
    pub fn is_not_found(&self) -> bool {
        match self {
            SymtabError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            SymtabError::FileDead(_) => true,
            _ => false,
        }
    }

    /// Stable label per error type, for callers that count failures.
    pub fn kind(&self) -> &'static str {
        match self {
            SymtabError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                "not_found"
            }
            SymtabError::Io { .. } => "io",
            SymtabError::NotElf(_) => "not_elf",
            SymtabError::Malformed { .. } => "malformed",
            SymtabError::NoSymbols => "no_symbols",
            SymtabError::NoBuildIdSection => "no_build_id",
            SymtabError::ElfBaseNotFound => "base_not_found",
            SymtabError::GoTooOld => "go_too_old",
            SymtabError::GoParseFailed(_) => "go_parse_failed",
            SymtabError::GoSymbolsNotFound => "go_symbols_not_found",
            SymtabError::FileDead(_) => "file_dead",
            SymtabError::MiniDebugInfo(_) => "mini_debug_info",
            SymtabError::NoUsableTable { .. } => "no_usable_table",
        }
    }
}

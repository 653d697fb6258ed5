//! Plain types shared between the sample collector and the symbolizer.

use std::fmt;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Fill pattern left in uninitialised stack slots by MSVC-style debug allocators.
pub const STACK_SENTINEL_CC: u64 = 0xcccc_cccc_cccc_cccc;

/// `nop` sled pattern, seen when an unwinder walks off the end of a stack.
pub const STACK_SENTINEL_NOP: u64 = 0x9090_9090_9090_9090;

/// Synthetic name reported for the stack sentinels.
pub const END_OF_STACK: &str = "end_of_stack";

/// Module reported for addresses that do not belong to any mapping.
pub const UNKNOWN_MODULE: &str = "[unknown]";

/// Process ID as seen by the sampling side
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PidKey(pub u32);

impl fmt::Display for PidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PidKey {
    fn from(pid: u32) -> Self {
        PidKey(pid)
    }
}

/// One raw sample coming out of the collector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampledAddress {
    pub pid: PidKey,
    pub addr: u64,
}

/// A resolved address
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Symbol {
    /// Offset of the address inside its module (address minus load base)
    pub start: u64,
    /// Function name, empty when the address could not be resolved
    pub name: String,
    /// Path of the mapped file as seen by the process
    pub module: String,
}

impl Symbol {
    pub fn end_of_stack() -> Self {
        Symbol {
            start: 0,
            name: END_OF_STACK.to_string(),
            module: UNKNOWN_MODULE.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.module.is_empty()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.name.is_empty(), self.module.is_empty()) {
            (false, false) => write!(f, "{} ({}+0x{:x})", self.name, self.module, self.start),
            (false, true) => write!(f, "{}", self.name),
            (true, false) => write!(f, "[{}+0x{:x}]", self.module, self.start),
            (true, true) => write!(f, "[unknown]"),
        }
    }
}

/// Returns true for addresses that mark a corrupted or exhausted stack.
pub fn is_stack_sentinel(addr: u64) -> bool {
    addr == STACK_SENTINEL_CC || addr == STACK_SENTINEL_NOP
}

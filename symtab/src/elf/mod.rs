//! ELF parsing: the container, symbol tables, build IDs and debug file lookup.

pub mod build_id;
pub mod container;
pub mod debug_file;
pub mod symbols;

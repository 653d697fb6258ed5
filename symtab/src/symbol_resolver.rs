use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::elf::symbols::ElfSymbolTable;
use crate::elfgopclntab::GoRuntimeTable;
use crate::gcache::Resource;

/// Address to function name lookup for one binary
pub enum SymbolResolver {
    ElfSymbols(ElfSymbolTable),
    GoRuntime(GoRuntimeTable),
    /// Asks `primary` first and `fallback` only where `primary` has nothing
    Fallback {
        primary: Box<SymbolResolver>,
        fallback: Box<SymbolResolver>,
    },
    NoOp,
}

impl SymbolResolver {
    pub fn fallback(primary: SymbolResolver, fallback: SymbolResolver) -> Self {
        SymbolResolver::Fallback {
            primary: Box::new(primary),
            fallback: Box::new(fallback),
        }
    }

    pub fn resolve(&self, addr: u64) -> Option<String> {
        match self {
            SymbolResolver::ElfSymbols(t) => t.resolve(addr),
            SymbolResolver::GoRuntime(t) => t.resolve(addr),
            SymbolResolver::Fallback { primary, fallback } => primary
                .resolve(addr)
                .or_else(|| fallback.resolve(addr)),
            SymbolResolver::NoOp => None,
        }
    }

    /// True once the backing file is gone for good.
    pub fn is_dead(&self) -> bool {
        match self {
            SymbolResolver::ElfSymbols(t) => t.is_dead(),
            SymbolResolver::GoRuntime(t) => t.is_dead(),
            SymbolResolver::Fallback { primary, fallback } => {
                primary.is_dead() || fallback.is_dead()
            }
            SymbolResolver::NoOp => false,
        }
    }

    /// Releases file handles. Lookups after this reopen the file.
    pub fn cleanup(&mut self) {
        match self {
            SymbolResolver::ElfSymbols(t) => t.cleanup(),
            SymbolResolver::GoRuntime(t) => t.cleanup(),
            SymbolResolver::Fallback { primary, fallback } => {
                primary.cleanup();
                fallback.cleanup();
            }
            SymbolResolver::NoOp => {}
        }
    }

    /// Number of indexed functions.
    pub fn size(&self) -> usize {
        match self {
            SymbolResolver::ElfSymbols(t) => t.len(),
            SymbolResolver::GoRuntime(t) => t.len(),
            SymbolResolver::Fallback { primary, fallback } => primary.size() + fallback.size(),
            SymbolResolver::NoOp => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SymbolResolver::ElfSymbols(_) => "elf",
            SymbolResolver::GoRuntime(_) => "go",
            SymbolResolver::Fallback { .. } => "fallback",
            SymbolResolver::NoOp => "noop",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolverDebugInfo {
    pub kind: &'static str,
    pub size: usize,
    pub dead: bool,
    pub owners: usize,
}

/// A resolver shared by every table that maps the same binary.
#[derive(Clone)]
pub struct SharedResolver(Rc<RefCell<SymbolResolver>>);

impl SharedResolver {
    pub fn new(resolver: SymbolResolver) -> Self {
        SharedResolver(Rc::new(RefCell::new(resolver)))
    }

    pub fn noop() -> Self {
        Self::new(SymbolResolver::NoOp)
    }

    pub fn resolve(&self, addr: u64) -> Option<String> {
        self.0.borrow().resolve(addr)
    }

    pub fn is_dead(&self) -> bool {
        self.0.borrow().is_dead()
    }

    pub fn size(&self) -> usize {
        self.0.borrow().size()
    }

    pub fn ptr_eq(&self, other: &SharedResolver) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn debug_info(&self) -> ResolverDebugInfo {
        let r = self.0.borrow();
        ResolverDebugInfo {
            kind: r.kind(),
            size: r.size(),
            dead: r.is_dead(),
            owners: Rc::strong_count(&self.0),
        }
    }
}

impl Resource for SharedResolver {
    fn refresh(&mut self) {}

    fn cleanup(&mut self) {
        self.0.borrow_mut().cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::container::BinaryContainer;
    use crate::elf::symbols::{SymbolOptions, SymbolSections};
    use crate::testutil::{ElfBuilder, GoVersion, PclntabBuilder, Section, Sym};
    use object::elf::ET_EXEC;

    fn go_binary() -> Rc<RefCell<BinaryContainer>> {
        let mut b = ElfBuilder::new(ET_EXEC);
        b.section(Section {
            size: Some(0x1000),
            ..Section::progbits(".text", 0x401000, Vec::new())
        });
        let pclntab = PclntabBuilder::new(
            GoVersion::Go120,
            0x401000,
            &[("main.main", 0x401100), ("main.loop", 0x401200)],
            0x401300,
        );
        b.section(Section::progbits(".gopclntab", 0, pclntab.build()));
        b.symtab(vec![
            Sym::func("_start", 0x401000),
            Sym::func("main.main", 0x401100),
            Sym::func("x_cgo_init", 0x401800),
        ]);
        Rc::new(RefCell::new(BinaryContainer::from_bytes("go", b.build()).unwrap()))
    }

    #[test]
    fn test_fallback_prefers_primary() {
        let c = go_binary();
        let go = GoRuntimeTable::new(c.clone()).unwrap();
        let elf = ElfSymbolTable::new(
            c,
            SymbolSections::All,
            Some(go.range()),
            &SymbolOptions::default(),
        )
        .unwrap();
        assert_eq!(elf.len(), 2);

        let r = SymbolResolver::fallback(
            SymbolResolver::GoRuntime(go),
            SymbolResolver::ElfSymbols(elf),
        );
        assert_eq!(r.kind(), "fallback");
        assert_eq!(r.size(), 4);
        assert_eq!(r.resolve(0x401210).as_deref(), Some("main.loop"));
        assert_eq!(r.resolve(0x401010).as_deref(), Some("_start"));
        assert_eq!(r.resolve(0x401900).as_deref(), Some("x_cgo_init"));
        assert!(!r.is_dead());
    }

    #[test]
    fn test_shared_resolver() {
        let a = SharedResolver::noop();
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&SharedResolver::noop()));
        assert_eq!(a.resolve(0x1000), None);
        assert_eq!(a.debug_info().owners, 2);
        assert_eq!(a.debug_info().kind, "noop");
    }
}

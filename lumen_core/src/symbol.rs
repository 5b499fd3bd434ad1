//! Identity-interned symbols for method names and descriptor keys.
//!
//! The dispatch machinery compares method names on every cache probe, so
//! names are interned once and compared by pointer afterwards. Two `Symbol`s
//! are equal iff they came from the same table and spell the same string.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A handle to an interned name.
///
/// Cheap to clone, O(1) to compare and hash (both by pointer).
#[derive(Clone)]
pub struct Symbol {
    inner: Arc<str>,
}

impl Symbol {
    #[inline]
    fn new(inner: Arc<str>) -> Self {
        Self { inner }
    }

    /// The symbol's text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    fn ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }
}

impl PartialEq for Symbol {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr().hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Symbol {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Thread-safe symbol table.
pub struct SymbolTable {
    symbols: RwLock<FxHashMap<Arc<str>, Symbol>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(FxHashMap::default()),
        }
    }

    /// Intern a name, returning its unique handle.
    pub fn intern(&self, s: &str) -> Symbol {
        {
            let symbols = self.symbols.read();
            if let Some(sym) = symbols.get(s) {
                return sym.clone();
            }
        }

        let mut symbols = self.symbols.write();
        // Re-check: another thread may have interned between the locks.
        if let Some(sym) = symbols.get(s) {
            return sym.clone();
        }
        let arc: Arc<str> = s.into();
        let sym = Symbol::new(arc.clone());
        symbols.insert(arc, sym.clone());
        sym
    }

    /// Number of distinct interned names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("count", &self.len())
            .finish()
    }
}

/// The process-wide symbol table.
pub static SYMBOLS: std::sync::LazyLock<SymbolTable> = std::sync::LazyLock::new(SymbolTable::new);

/// Intern a name in the process-wide table.
#[inline]
pub fn intern(s: &str) -> Symbol {
    SYMBOLS.intern(s)
}

/// The empty symbol, used for blank error fields.
#[inline]
pub fn empty() -> Symbol {
    intern("")
}

/// Derive the getter name for a member: `f` -> `get:f`.
///
/// The IC fallback path probes for a getter with the call's name before
/// falling back to noSuchMethod dispatch.
#[inline]
pub fn getter_name(name: &Symbol) -> Symbol {
    intern(&format!("get:{}", name.as_str()))
}

/// The name closures are invoked under.
#[inline]
pub fn call_name() -> Symbol {
    intern("call")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_same_handle() {
        let table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "foo");
    }

    #[test]
    fn test_different_names_differ() {
        let table = SymbolTable::new();
        assert_ne!(table.intern("foo"), table.intern("bar"));
    }

    #[test]
    fn test_len_deduplicates() {
        let table = SymbolTable::new();
        table.intern("a");
        table.intern("b");
        table.intern("a");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_hash_follows_identity() {
        use std::collections::HashMap;
        let table = SymbolTable::new();
        let mut map = HashMap::new();
        map.insert(table.intern("key"), 1);
        assert_eq!(map.get(&table.intern("key")), Some(&1));
    }

    #[test]
    fn test_getter_name() {
        let f = intern("f");
        assert_eq!(getter_name(&f).as_str(), "get:f");
        // Interned: deriving twice yields the identical symbol.
        assert_eq!(getter_name(&f), getter_name(&f));
    }

    #[test]
    fn test_global_table_identity() {
        assert_eq!(intern("global"), intern("global"));
    }

    #[test]
    fn test_concurrent_intern() {
        use std::thread;

        let table = Arc::new(SymbolTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.intern("shared"))
            })
            .collect();

        let first = table.intern("shared");
        for handle in handles {
            assert_eq!(handle.join().unwrap(), first);
        }
        assert_eq!(table.len(), 1);
    }
}

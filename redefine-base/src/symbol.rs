use std::{
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use indexmap::IndexSet;
use parking_lot::Mutex;

/// An interned, immutable byte string in the modified utf8 that class files use.
/// Two symbols from the same [`SymbolTable`] are equal exactly when they are the same
/// allocation, so comparison and hashing never look at the bytes.
#[derive(Clone)]
pub struct Symbol(Arc<[u8]>);
impl Symbol {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert to a rust string, replacing anything that isn't valid java cesu8
    #[must_use]
    pub fn as_lossy_str(&self) -> Cow<'_, str> {
        match cesu8::from_java_cesu8(&self.0) {
            Ok(text) => text,
            Err(_) => String::from_utf8_lossy(&self.0),
        }
    }
}
impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Symbol {}
impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(Arc::as_ptr(&self.0).cast::<u8>() as usize);
    }
}
impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_lossy_str())
    }
}
impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_lossy_str())
    }
}

/// Interns names and signatures. Symbols live as long as the table; nothing is ever removed.
#[derive(Default)]
pub struct SymbolTable {
    symbols: Mutex<IndexSet<Arc<[u8]>>>,
}
impl SymbolTable {
    #[must_use]
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn intern(&self, bytes: &[u8]) -> Symbol {
        let mut symbols = self.symbols.lock();
        if let Some(existing) = symbols.get(bytes) {
            return Symbol(Arc::clone(existing));
        }

        let symbol: Arc<[u8]> = Arc::from(bytes);
        symbols.insert(Arc::clone(&symbol));
        Symbol(symbol)
    }

    /// Intern a rust string, encoding it in the class file's modified utf8
    pub fn intern_str(&self, text: &str) -> Symbol {
        self.intern(&cesu8::to_java_cesu8(text))
    }

    /// Look up a symbol without creating it
    #[must_use]
    pub fn lookup(&self, bytes: &[u8]) -> Option<Symbol> {
        self.symbols
            .lock()
            .get(bytes)
            .map(|sym| Symbol(Arc::clone(sym)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::SymbolTable;

    #[test]
    fn test_interning_identity() {
        let table = SymbolTable::new();
        let a = table.intern_str("java/lang/Object");
        let b = table.intern(b"java/lang/Object");
        let c = table.intern_str("java/lang/String");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(a.to_string(), "java/lang/Object");
        assert_eq!(table.lookup(b"java/lang/String"), Some(c));
        assert_eq!(table.lookup(b"missing"), None);
    }

    #[test]
    fn test_modified_utf8_nul() {
        let table = SymbolTable::new();
        let sym = table.intern_str("a\0b");
        // Nul is encoded as two bytes in modified utf8
        assert_eq!(sym.as_bytes(), &[b'a', 0xC0, 0x80, b'b']);
        assert_eq!(sym.as_lossy_str(), "a\0b");
    }
}

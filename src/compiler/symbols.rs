use std::collections::HashMap;

const ITER_PREFIX: &str = "__iter_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Operand-stack depth right after the loop's register save.
    pub depth: usize,
    /// Foreach nesting level that declared the iterator (1 = outermost).
    pub scope: usize,
}

/// Foreach iterators visible at the current compile position.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: HashMap<String, Vec<Symbol>>,
    saves: Vec<usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Enter a foreach whose register save left the stack at `depth`.
    /// Returns the new scope number.
    pub fn open_scope(&mut self, depth: usize) -> usize {
        self.saves.push(depth);
        self.saves.len()
    }

    pub fn close_scope(&mut self) {
        let scope = self.saves.len();
        assert!(scope > 0, "close_scope without open scope");
        self.names.retain(|_, stack| {
            stack.retain(|s| s.scope != scope);
            !stack.is_empty()
        });
        self.saves.pop();
    }

    pub fn scope(&self) -> usize {
        self.saves.len()
    }

    pub fn define(&mut self, name: &str) {
        let scope = self.scope();
        assert!(scope > 0, "iterator defined outside a foreach");
        let depth = self.saves[scope - 1];
        self.names.entry(format!("{ITER_PREFIX}{name}")).or_default().push(Symbol { depth, scope });
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.names.get(&format!("{ITER_PREFIX}{name}")).and_then(|s| s.last().copied())
    }

    /// Stack depth right after the register save of scope `scope`.
    pub fn saved_depth(&self, scope: usize) -> Option<usize> {
        scope.checked_sub(1).and_then(|i| self.saves.get(i).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_lookup() {
        let mut table = SymbolTable::new();
        assert_eq!(table.scope(), 0);
        assert_eq!(table.open_scope(4), 1);
        table.define("row");
        assert_eq!(table.lookup("row"), Some(Symbol { depth: 4, scope: 1 }));
        assert_eq!(table.lookup("col"), None);
    }

    #[test]
    fn inner_scope_shadows_and_unwinds() {
        let mut table = SymbolTable::new();
        table.open_scope(4);
        table.define("x");
        table.open_scope(9);
        table.define("x");
        assert_eq!(table.lookup("x"), Some(Symbol { depth: 9, scope: 2 }));
        table.close_scope();
        assert_eq!(table.lookup("x"), Some(Symbol { depth: 4, scope: 1 }));
        table.close_scope();
        assert_eq!(table.lookup("x"), None);
    }

    #[test]
    fn sibling_scopes_do_not_leak() {
        let mut table = SymbolTable::new();
        table.open_scope(4);
        table.define("a");
        table.close_scope();
        table.open_scope(4);
        table.define("b");
        assert_eq!(table.lookup("a"), None);
        assert!(table.lookup("b").is_some());
    }

    #[test]
    fn saved_depths_by_scope() {
        let mut table = SymbolTable::new();
        table.open_scope(5);
        table.open_scope(12);
        assert_eq!(table.saved_depth(1), Some(5));
        assert_eq!(table.saved_depth(2), Some(12));
        assert_eq!(table.saved_depth(0), None);
        assert_eq!(table.saved_depth(3), None);
    }

    #[test]
    #[should_panic(expected = "close_scope without open scope")]
    fn unbalanced_close_panics() {
        SymbolTable::new().close_scope();
    }
}

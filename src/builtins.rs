//! Default builtin predicates and the standard order on terms.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::{cell::Cell, index::Database, mem::Mem};

const DEFAULTS: [(&str, u8); 9] = [
    ("=", 2),
    ("==", 2),
    ("\\==", 2),
    ("@<", 2),
    ("@>", 2),
    ("atom", 1),
    ("var", 1),
    ("is_list", 1),
    ("fail", 0),
];

pub(crate) fn default_names() -> HashSet<(String, u8)> {
    DEFAULTS
        .iter()
        .map(|&(name, arity)| (name.to_owned(), arity))
        .collect()
}

pub(crate) fn register_defaults(db: &mut Database) {
    db.register_builtin("=", 2, |vm, args| Ok(vm.unify_cells(args[0], args[1])));
    db.register_builtin("==", 2, |vm, args| {
        Ok(compare(vm.mem(), args[0], args[1]) == Ordering::Equal)
    });
    db.register_builtin("\\==", 2, |vm, args| {
        Ok(compare(vm.mem(), args[0], args[1]) != Ordering::Equal)
    });
    db.register_builtin("@<", 2, |vm, args| {
        Ok(compare(vm.mem(), args[0], args[1]) == Ordering::Less)
    });
    db.register_builtin("@>", 2, |vm, args| {
        Ok(compare(vm.mem(), args[0], args[1]) == Ordering::Greater)
    });
    db.register_builtin("atom", 1, |vm, args| {
        Ok(matches!(vm.mem().walk(args[0]), Cell::Sym(_)))
    });
    db.register_builtin("var", 1, |vm, args| {
        Ok(matches!(vm.mem().walk(args[0]), Cell::Ref(_)))
    });
    db.register_builtin("is_list", 1, |vm, args| Ok(is_list(vm.mem(), args[0])));
    db.register_builtin("fail", 0, |_vm, _args| Ok(false));
}

/// Comparison on cyclic terms is unspecified; stop descending here.
const MAX_CMP_DEPTH: usize = 256;

/// Standard order: unbound refs (by age) before atoms (by name) before
/// structs (by arity, then name, then arguments).
pub fn compare(mem: &Mem, a: Cell, b: Cell) -> Ordering {
    compare_depth(mem, a, b, 0)
}

fn rank(cell: Cell) -> u8 {
    match cell {
        Cell::Ref(_) => 0,
        Cell::Sym(_) => 1,
        Cell::Rcd(_) => 2,
    }
}

fn compare_depth(mem: &Mem, a: Cell, b: Cell, depth: usize) -> Ordering {
    if depth > MAX_CMP_DEPTH {
        return Ordering::Equal;
    }
    let a = mem.walk(a);
    let b = mem.walk(b);
    match (a, b) {
        (Cell::Ref(r1), Cell::Ref(r2)) => r1.cmp(&r2),
        (Cell::Sym(s1), Cell::Sym(s2)) => {
            mem.symbols().resolve(s1).cmp(mem.symbols().resolve(s2))
        }
        (Cell::Rcd(id1), Cell::Rcd(id2)) => {
            let f1 = mem.rcd(id1).functor;
            let f2 = mem.rcd(id2).functor;
            f1.arity
                .cmp(&f2.arity)
                .then_with(|| mem.symbols().resolve(f1.sym).cmp(mem.symbols().resolve(f2.sym)))
                .then_with(|| {
                    for i in 0..f1.arity as usize {
                        let ord = compare_depth(
                            mem,
                            mem.rcd(id1).slots[i],
                            mem.rcd(id2).slots[i],
                            depth + 1,
                        );
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                })
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A proper list: a `./2` chain ending in `[]`. Partial lists are not lists.
pub fn is_list(mem: &Mem, cell: Cell) -> bool {
    let mut cell = cell;
    let mut steps = 0usize;
    loop {
        match mem.walk(cell) {
            Cell::Sym(sym) => return mem.symbols().resolve(sym) == "[]",
            Cell::Rcd(id) => {
                let rcd = mem.rcd(id);
                if rcd.functor.arity != 2 || mem.symbols().resolve(rcd.functor.sym) != "." {
                    return false;
                }
                cell = rcd.slots[1];
            }
            Cell::Ref(_) => return false,
        }
        steps += 1;
        if steps > mem.rcds.len() + 1 {
            // Cyclic tail.
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::mem::SymbolTable;

    #[test]
    fn standard_order_ranks_kinds() {
        let mut mem = Mem::new(SymbolTable::new());
        let x = mem.fresh_ref();
        let a = Cell::Sym(mem.intern("a"));
        let f1 = mem.syms.intern_functor("f", 1);
        let rcd = mem.fresh_rcd(f1);
        mem.rcd_mut(rcd).slots.push(a);
        let s = Cell::Rcd(rcd);

        assert_eq!(compare(&mem, x, a), Ordering::Less);
        assert_eq!(compare(&mem, a, s), Ordering::Less);
        assert_eq!(compare(&mem, s, x), Ordering::Greater);
    }

    #[test]
    fn standard_order_on_structs() {
        let mut mem = Mem::new(SymbolTable::new());
        let a = Cell::Sym(mem.intern("a"));
        let b = Cell::Sym(mem.intern("b"));

        let f1 = mem.syms.intern_functor("f", 1);
        let g1 = mem.syms.intern_functor("g", 1);
        let fa = mem.fresh_rcd(f1);
        mem.rcd_mut(fa).slots.push(a);
        let fb = mem.fresh_rcd(f1);
        mem.rcd_mut(fb).slots.push(b);
        let ga = mem.fresh_rcd(g1);
        mem.rcd_mut(ga).slots.push(a);

        assert_eq!(compare(&mem, Cell::Rcd(fa), Cell::Rcd(fb)), Ordering::Less);
        assert_eq!(compare(&mem, Cell::Rcd(fa), Cell::Rcd(ga)), Ordering::Less);
        assert_eq!(compare(&mem, Cell::Rcd(fa), Cell::Rcd(fa)), Ordering::Equal);
    }

    #[test]
    fn proper_and_partial_lists() {
        let mut mem = Mem::new(SymbolTable::new());
        let nil = Cell::Sym(mem.intern("[]"));
        let a = Cell::Sym(mem.intern("a"));
        let cons = mem.syms.intern_functor(".", 2);

        let inner = mem.fresh_rcd(cons);
        mem.rcd_mut(inner).slots.extend([a, nil]);
        let outer = mem.fresh_rcd(cons);
        let tail = Cell::Rcd(inner);
        mem.rcd_mut(outer).slots.extend([a, tail]);

        assert!(is_list(&mem, nil));
        assert!(is_list(&mem, Cell::Rcd(outer)));
        assert!(!is_list(&mem, a));

        let partial = mem.fresh_rcd(cons);
        let hole = mem.fresh_ref();
        mem.rcd_mut(partial).slots.extend([a, hole]);
        assert!(!is_list(&mem, Cell::Rcd(partial)));
    }
}

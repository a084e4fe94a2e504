use std::collections::HashMap;
use std::fmt;

use crate::{
    cell::{Cell, Functor},
    defs::{RcdId, RefId, Sym},
};

/// Interned symbol texts. The database builds one at compile time; each
/// machine starts from a clone of it and may append runtime symbols.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    texts: Vec<String>,
    ids: HashMap<String, Sym>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, text: impl AsRef<str>) -> Sym {
        let text = text.as_ref();
        if let Some(&sym) = self.ids.get(text) {
            sym
        } else {
            let sym = Sym::new(self.texts.len());
            self.texts.push(text.to_owned());
            self.ids.insert(text.to_owned(), sym);
            sym
        }
    }

    pub fn intern_functor(&mut self, name: impl AsRef<str>, arity: u8) -> Functor {
        Functor {
            sym: self.intern(name),
            arity,
        }
    }

    pub fn lookup(&self, text: &str) -> Option<Sym> {
        self.ids.get(text).copied()
    }

    pub fn resolve(&self, sym: Sym) -> &str {
        &self.texts[sym.usize()]
    }

    pub fn display_functor(&self, f: Functor) -> String {
        format!("{}/{}", self.resolve(f.sym), f.arity)
    }
}

/// A struct record under construction or already complete. Slots are pushed
/// one by one while the machine is in write mode; the arity invariant holds
/// again by the time the machine returns to run mode.
#[derive(Debug, Clone)]
pub struct Rcd {
    pub functor: Functor,
    pub slots: Vec<Cell>,
}

/// Arena of runtime values: the ref table, the struct records and the symbol
/// texts. Backtracking restores it by truncating to saved watermarks, so
/// nothing here holds a pointer into anything else.
#[derive(Debug, Clone)]
pub struct Mem {
    pub(crate) syms: SymbolTable,
    pub(crate) refs: Vec<Option<Cell>>,
    pub(crate) rcds: Vec<Rcd>,
    pub(crate) var_names: HashMap<RefId, Sym>,
}

/// Printers stop descending at this depth; unification without an occurs
/// check can build cyclic ref chains.
const MAX_DISPLAY_DEPTH: usize = 64;

impl Mem {
    pub fn new(syms: SymbolTable) -> Self {
        Self {
            syms,
            refs: Vec::new(),
            rcds: Vec::new(),
            var_names: HashMap::new(),
        }
    }

    pub fn intern(&mut self, text: impl AsRef<str>) -> Sym {
        self.syms.intern(text)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.syms
    }

    /// Create a fresh unbound ref.
    pub fn fresh_ref(&mut self) -> Cell {
        let id = RefId::new(self.refs.len());
        self.refs.push(None);
        Cell::Ref(id)
    }

    /// Create a fresh unbound ref remembering a source-level name for
    /// display.
    pub fn fresh_named_ref(&mut self, name: &str) -> Cell {
        let sym = self.intern(name);
        let cell = self.fresh_ref();
        if let Cell::Ref(id) = cell {
            self.var_names.insert(id, sym);
        }
        cell
    }

    /// Allocate an empty struct record; slots are filled in write mode.
    pub fn fresh_rcd(&mut self, functor: Functor) -> RcdId {
        let id = RcdId::new(self.rcds.len());
        self.rcds.push(Rcd {
            functor,
            slots: Vec::with_capacity(functor.arity as usize),
        });
        id
    }

    pub fn rcd(&self, id: RcdId) -> &Rcd {
        &self.rcds[id.usize()]
    }

    pub fn rcd_mut(&mut self, id: RcdId) -> &mut Rcd {
        &mut self.rcds[id.usize()]
    }

    /// Binding of a ref, or `None` when unbound. An id past the table end
    /// (possible in an environment slot after arena truncation, before the
    /// slot is rewritten) also reads as unbound.
    pub fn ref_value(&self, id: RefId) -> Option<Cell> {
        self.refs.get(id.usize()).copied().flatten()
    }

    pub fn set_ref(&mut self, id: RefId, value: Option<Cell>) {
        self.refs[id.usize()] = value;
    }

    /// Follow bound refs until a non-ref or an unbound ref. Cycle-tolerant:
    /// gives up after one lap around the ref table.
    pub fn walk(&self, cell: Cell) -> Cell {
        let mut cell = cell;
        let mut hops = 0usize;
        while let Cell::Ref(id) = cell {
            match self.ref_value(id) {
                Some(next) => {
                    cell = next;
                    hops += 1;
                    if hops > self.refs.len() {
                        return cell;
                    }
                }
                None => return cell,
            }
        }
        cell
    }

    pub fn display_name_of(&self, id: RefId) -> String {
        match self.var_names.get(&id) {
            Some(&sym) => self.syms.resolve(sym).to_owned(),
            None => format!("{id}"),
        }
    }

    pub fn display_cell(&self, cell: Cell) -> DisplayCell<'_> {
        DisplayCell { cell, mem: self }
    }
}

pub struct DisplayCell<'a> {
    cell: Cell,
    mem: &'a Mem,
}

impl DisplayCell<'_> {
    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, cell: Cell, depth: usize) -> fmt::Result {
        if depth > MAX_DISPLAY_DEPTH {
            return write!(f, "...");
        }
        match self.mem.walk(cell) {
            Cell::Sym(sym) => write!(f, "{}", self.mem.syms.resolve(sym)),
            Cell::Ref(id) => write!(f, "{}", self.mem.display_name_of(id)),
            Cell::Rcd(id) => {
                let rcd = self.mem.rcd(id);
                write!(f, "{}(", self.mem.syms.resolve(rcd.functor.sym))?;
                for (i, &slot) in rcd.slots.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_depth(f, slot, depth + 1)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for DisplayCell<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, self.cell, 0)
    }
}

#[test]
fn display_nested_record() {
    let mut mem = Mem::new(SymbolTable::new());
    let h2 = mem.syms.intern_functor("h", 2);
    let f1 = mem.syms.intern_functor("f", 1);
    let p3 = mem.syms.intern_functor("p", 3);

    let x = mem.fresh_ref();
    let y = mem.fresh_ref();

    let h = mem.fresh_rcd(h2);
    mem.rcd_mut(h).slots.extend([x, y]);
    let fr = mem.fresh_rcd(f1);
    mem.rcd_mut(fr).slots.push(y);
    let p = mem.fresh_rcd(p3);
    mem.rcd_mut(p).slots.extend([x, Cell::Rcd(h), Cell::Rcd(fr)]);

    assert_eq!(mem.display_cell(Cell::Rcd(p)).to_string(), "p(_0, h(_0, _1), f(_1))");
}

#[test]
fn walk_follows_chains_and_stops_on_unbound() {
    let mut mem = Mem::new(SymbolTable::new());
    let a = mem.intern("a");

    let r0 = mem.fresh_ref();
    let r1 = mem.fresh_ref();
    let r2 = mem.fresh_ref();
    let (id0, id1, id2) = match (r0, r1, r2) {
        (Cell::Ref(a), Cell::Ref(b), Cell::Ref(c)) => (a, b, c),
        _ => unreachable!(),
    };

    mem.set_ref(id0, Some(Cell::Ref(id1)));
    assert_eq!(mem.walk(r0), Cell::Ref(id1));

    mem.set_ref(id1, Some(Cell::Ref(id2)));
    mem.set_ref(id2, Some(Cell::Sym(a)));
    assert_eq!(mem.walk(r0), Cell::Sym(a));
}

#[test]
fn display_caps_cyclic_terms() {
    let mut mem = Mem::new(SymbolTable::new());
    let f1 = mem.syms.intern_functor("f", 1);

    // X = f(X) without occurs check.
    let x = mem.fresh_ref();
    let rcd = mem.fresh_rcd(f1);
    mem.rcd_mut(rcd).slots.push(x);
    if let Cell::Ref(id) = x {
        mem.set_ref(id, Some(Cell::Rcd(rcd)));
    }

    let shown = mem.display_cell(Cell::Rcd(rcd)).to_string();
    assert!(shown.contains("..."));
}

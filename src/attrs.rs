//! Attributed variables: per-ref attribute storage and the unification
//! frames that suspend attribute checks until the next instruction boundary.

use indexmap::IndexMap;

use crate::{
    cell::Cell,
    defs::{RefId, Sym},
};

/// Attributes attached to unbound refs, keyed by (ref, package). Insertion
/// order is preserved; hooks run in it.
#[derive(Debug, Clone, Default)]
pub struct AttrTable {
    entries: IndexMap<(RefId, Sym), Cell>,
}

impl AttrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, id: RefId, pkg: Sym, value: Cell) -> Option<Cell> {
        self.entries.insert((id, pkg), value)
    }

    pub fn get(&self, id: RefId, pkg: Sym) -> Option<Cell> {
        self.entries.get(&(id, pkg)).copied()
    }

    pub fn del(&mut self, id: RefId, pkg: Sym) -> Option<Cell> {
        self.entries.shift_remove(&(id, pkg))
    }

    pub fn has_any(&self, id: RefId) -> bool {
        self.entries.keys().any(|&(r, _)| r == id)
    }

    /// Attributes of one ref, in insertion order.
    pub fn of_ref(&self, id: RefId) -> Vec<(Sym, Cell)> {
        self.entries
            .iter()
            .filter(|((r, _), _)| *r == id)
            .map(|(&(_, pkg), &value)| (pkg, value))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RefId, Sym, Cell)> + '_ {
        self.entries.iter().map(|(&(id, pkg), &value)| (id, pkg, value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A suspended attribute check, queued when an attributed ref gets bound.
/// The machine drains these between instructions through the per-package
/// hooks.
#[derive(Debug, Clone)]
pub struct UnifFrame {
    pub attributed_ref: RefId,
    pub binding_value: Cell,
    /// The ref's attributes at binding time, in insertion order.
    pub attributes: Vec<(Sym, Cell)>,
    /// Bindings made while handling this frame, rendered. Empty while the
    /// frame is still queued; hook bindings also land in the machine's
    /// global binding log.
    pub bindings: Vec<(String, String)>,
}

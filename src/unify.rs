//! Structural unification over the cell arena, with conditional trailing
//! and the attributed-ref hook.

use std::collections::VecDeque;

use crate::{
    attrs::{AttrTable, UnifFrame},
    cell::Cell,
    defs::{EnvId, RefId},
    mem::Mem,
};

/// One undo record in a choice point's trail.
#[derive(Debug, Clone, PartialEq)]
pub enum TrailEntry {
    /// Unbind this ref.
    Bind(RefId),
    /// Restore an environment slot overwritten after the choice point.
    EnvSlot {
        env: EnvId,
        slot: usize,
        old: Option<Cell>,
    },
}

/// Borrowed machine state needed to unify and bind. Refs with ids below
/// `watermark` predate the newest choice point and must be trailed; younger
/// refs are reclaimed by arena truncation on backtrack. Each binding is
/// appended to `log` rendered at bind time, before later bindings change
/// what the value looks like.
pub struct Unifier<'a> {
    pub mem: &'a mut Mem,
    pub attrs: &'a AttrTable,
    pub watermark: usize,
    pub trail: &'a mut Vec<TrailEntry>,
    pub log: &'a mut Vec<(String, String)>,
    pub frames: &'a mut VecDeque<UnifFrame>,
}

impl Unifier<'_> {
    /// Bind an unbound ref, with trail and attribute bookkeeping.
    pub fn bind(&mut self, id: RefId, value: Cell) {
        tracing::trace!(
            "binding `{}` to `{}`",
            self.mem.display_name_of(id),
            self.mem.display_cell(value),
        );
        if !self.attrs.is_empty() && self.attrs.has_any(id) {
            self.frames.push_back(UnifFrame {
                attributed_ref: id,
                binding_value: value,
                attributes: self.attrs.of_ref(id),
                bindings: Vec::new(),
            });
        }
        self.log.push((
            self.mem.display_name_of(id),
            self.mem.display_cell(value).to_string(),
        ));
        self.mem.set_ref(id, Some(value));
        if id.usize() < self.watermark {
            self.trail.push(TrailEntry::Bind(id));
        }
    }

    pub fn unify(&mut self, t1: Cell, t2: Cell) -> bool {
        let t1 = self.mem.walk(t1);
        let t2 = self.mem.walk(t2);

        match (t1, t2) {
            (Cell::Sym(s1), Cell::Sym(s2)) => s1 == s2,
            // Two unbound refs: the younger points at the older, so the
            // binding survives exactly as long as the older ref does.
            (Cell::Ref(r1), Cell::Ref(r2)) => {
                if r1 == r2 {
                    return true;
                }
                if r1 < r2 {
                    self.bind(r2, Cell::Ref(r1));
                } else {
                    self.bind(r1, Cell::Ref(r2));
                }
                true
            }
            (Cell::Ref(r), concrete) => {
                self.bind(r, concrete);
                true
            }
            (concrete, Cell::Ref(r)) => {
                self.bind(r, concrete);
                true
            }
            (Cell::Rcd(id1), Cell::Rcd(id2)) => {
                let f1 = self.mem.rcd(id1).functor;
                let f2 = self.mem.rcd(id2).functor;
                if f1 != f2 {
                    tracing::trace!(
                        "functor mismatch: {} vs {}",
                        self.mem.syms.display_functor(f1),
                        self.mem.syms.display_functor(f2),
                    );
                    return false;
                }
                for i in 0..f1.arity as usize {
                    let s1 = self.mem.rcd(id1).slots[i];
                    let s2 = self.mem.rcd(id2).slots[i];
                    if !self.unify(s1, s2) {
                        return false;
                    }
                }
                true
            }
            (Cell::Sym(_), Cell::Rcd(_)) | (Cell::Rcd(_), Cell::Sym(_)) => false,
        }
    }
}

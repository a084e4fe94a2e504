//! Instruction dispatch: one match arm per instruction, mutating the
//! machine state and deciding where control goes next.

use crate::{
    cell::{Cell, Functor},
    instr::{Instr, InstrAddr, Operand, Reg, Slot},
};

use super::{ComplexArg, Error, Flow, Mode, Result, Vm};

impl Vm {
    pub(crate) fn dispatch(&mut self, instr: &Instr, addr: InstrAddr) -> Result<Flow> {
        match instr {
            // --- get family -------------------------------------------
            Instr::GetVariable(reg, slot) => {
                let cell = self.get_reg(*reg)?;
                self.set_slot(*slot, cell)?;
                self.advance(addr)
            }
            Instr::GetValue(reg, slot) => {
                let a = self.get_slot(*slot)?;
                let b = self.get_reg(*reg)?;
                if self.unify_cells(a, b) {
                    self.advance(addr)
                } else {
                    self.backtrack()
                }
            }
            Instr::GetAtom(reg, sym) => {
                let cell = self.get_reg(*reg)?;
                if self.unify_cells(cell, Cell::Sym(*sym)) {
                    self.advance(addr)
                } else {
                    self.backtrack()
                }
            }
            Instr::GetStruct(reg, functor) => self.get_struct(*reg, *functor, addr),
            Instr::GetPair(reg) => {
                let cons = self.cons_functor();
                self.get_struct(*reg, cons, addr)
            }

            // --- unify family -----------------------------------------
            Instr::UnifyVariable(slot) => {
                let cell = match self.mode {
                    Mode::Read => self.read_slot()?,
                    _ => {
                        let fresh = self.fresh_ref_for(*slot);
                        self.write_slot(fresh)?;
                        fresh
                    }
                };
                self.set_slot(*slot, cell)?;
                self.bump_complex();
                self.advance(addr)
            }
            Instr::UnifyValue(slot) => {
                let ours = self.get_slot(*slot)?;
                match self.mode {
                    Mode::Read => {
                        let theirs = self.read_slot()?;
                        if !self.unify_cells(ours, theirs) {
                            return self.backtrack();
                        }
                    }
                    _ => self.write_slot(ours)?,
                }
                self.bump_complex();
                self.advance(addr)
            }
            Instr::UnifyAtom(sym) => {
                match self.mode {
                    Mode::Read => {
                        let theirs = self.read_slot()?;
                        if !self.unify_cells(theirs, Cell::Sym(*sym)) {
                            return self.backtrack();
                        }
                    }
                    _ => self.write_slot(Cell::Sym(*sym))?,
                }
                self.bump_complex();
                self.advance(addr)
            }
            Instr::UnifyVoid(n) => {
                for _ in 0..*n {
                    match self.mode {
                        Mode::Read => {}
                        _ => {
                            let fresh = self.mem.fresh_ref();
                            self.write_slot(fresh)?;
                        }
                    }
                    self.bump_complex();
                }
                self.advance(addr)
            }

            // --- put family -------------------------------------------
            Instr::PutVariable(reg, slot) => {
                let fresh = self.fresh_ref_for(*slot);
                self.set_reg(*reg, fresh);
                self.set_slot(*slot, fresh)?;
                self.advance(addr)
            }
            Instr::PutValue(reg, slot) => {
                let cell = self.get_slot(*slot)?;
                self.set_reg(*reg, cell);
                self.advance(addr)
            }
            Instr::PutAtom(reg, sym) => {
                self.set_reg(*reg, Cell::Sym(*sym));
                self.advance(addr)
            }
            Instr::PutStruct(reg, functor) => {
                let id = self.mem.fresh_rcd(*functor);
                self.set_reg(*reg, Cell::Rcd(id));
                self.mode = Mode::Write;
                self.complex = Some(ComplexArg { rcd: id, index: 0 });
                self.advance(addr)
            }
            Instr::PutPair(reg) => {
                let cons = self.cons_functor();
                let id = self.mem.fresh_rcd(cons);
                self.set_reg(*reg, Cell::Rcd(id));
                self.mode = Mode::Write;
                self.complex = Some(ComplexArg { rcd: id, index: 0 });
                self.advance(addr)
            }

            // --- control ----------------------------------------------
            Instr::Call(functor) => self.do_call(*functor, false),
            Instr::Execute(functor) => self.do_call(*functor, true),
            Instr::Proceed => {
                self.mode = Mode::Run;
                self.complex = None;
                match self.continuation {
                    Some(cont) => {
                        self.code_ptr = Some(cont);
                        Ok(Flow::Continue)
                    }
                    None => Ok(Flow::Answer(self.answer())),
                }
            }
            Instr::Allocate(n) => {
                let depth = self.env_top.map_or(0, |env| self.envs[env].depth) + 1;
                if let Some(limit) = self.depth_limit {
                    if depth > limit {
                        return Err(Error::DepthLimitExceeded { limit });
                    }
                }
                let env = super::Env {
                    prev: self.env_top,
                    continuation: self.continuation,
                    slots: vec![None; *n as usize],
                    depth,
                };
                self.envs.push(env);
                self.env_top = Some(self.envs.len() - 1);
                if self.query_env.is_none() && addr.functor == self.query_functor {
                    self.query_env = self.env_top;
                }
                self.stats.peak_env_depth = self.stats.peak_env_depth.max(depth);
                self.advance(addr)
            }
            Instr::Deallocate => {
                let env = self.env_top.ok_or(Error::NoEnvironment)?;
                self.continuation = self.envs[env].continuation;
                self.env_top = self.envs[env].prev;
                self.advance(addr)
            }

            // --- choice points, code-level form -----------------------
            Instr::TryMeElse(lbl) => {
                let alt = self.resolve_label(addr, *lbl)?;
                self.push_choice(addr.functor, vec![alt], 0, true);
                self.advance(addr)
            }
            Instr::RetryMeElse(lbl) => {
                let alt = self.resolve_label(addr, *lbl)?;
                let ci = self.choice_top.ok_or(Error::NoChoicePoint)?;
                self.choices[ci].alternatives = vec![alt];
                self.choices[ci].next_alt = 0;
                self.advance(addr)
            }
            Instr::TrustMe => {
                let ci = self.choice_top.ok_or(Error::NoChoicePoint)?;
                self.choice_top = self.choices[ci].prev;
                self.choices.truncate(ci);
                self.advance(addr)
            }
            Instr::Try(lbl) => {
                let block = self.resolve_label(addr, *lbl)?;
                self.push_choice(addr.functor, vec![addr.next()], 0, true);
                self.code_ptr = Some(block);
                Ok(Flow::Continue)
            }
            Instr::Retry(lbl) => {
                let block = self.resolve_label(addr, *lbl)?;
                let ci = self.choice_top.ok_or(Error::NoChoicePoint)?;
                self.choices[ci].alternatives = vec![addr.next()];
                self.choices[ci].next_alt = 0;
                self.code_ptr = Some(block);
                Ok(Flow::Continue)
            }
            Instr::Trust(lbl) => {
                let block = self.resolve_label(addr, *lbl)?;
                let ci = self.choice_top.ok_or(Error::NoChoicePoint)?;
                self.choice_top = self.choices[ci].prev;
                self.choices.truncate(ci);
                self.code_ptr = Some(block);
                Ok(Flow::Continue)
            }
            Instr::Jump(lbl) => {
                let target = self.resolve_label(addr, *lbl)?;
                self.code_ptr = Some(target);
                Ok(Flow::Continue)
            }
            Instr::Label(_) => self.advance(addr),

            // --- indexing ---------------------------------------------
            Instr::SwitchOnTerm(sw) => {
                let cell = self.mem.walk(self.get_reg(Reg(0))?);
                let lbl = match cell {
                    Cell::Ref(_) => sw.if_var,
                    Cell::Sym(_) => sw.if_const,
                    Cell::Rcd(id) => {
                        let functor = self.mem.rcd(id).functor;
                        if functor == self.cons_functor_if_interned() {
                            sw.if_list
                        } else {
                            sw.if_struct
                        }
                    }
                };
                let target = self.resolve_label(addr, lbl)?;
                self.code_ptr = Some(target);
                Ok(Flow::Continue)
            }
            Instr::SwitchOnConstant(table) => {
                match self.mem.walk(self.get_reg(Reg(0))?) {
                    Cell::Sym(sym) => match table.get(&sym) {
                        Some(&lbl) => {
                            let target = self.resolve_label(addr, lbl)?;
                            self.code_ptr = Some(target);
                            Ok(Flow::Continue)
                        }
                        None => self.backtrack(),
                    },
                    _ => self.backtrack(),
                }
            }
            Instr::SwitchOnStruct(table) => {
                match self.mem.walk(self.get_reg(Reg(0))?) {
                    Cell::Rcd(id) => {
                        let functor = self.mem.rcd(id).functor;
                        match table.get(&functor) {
                            Some(&lbl) => {
                                let target = self.resolve_label(addr, lbl)?;
                                self.code_ptr = Some(target);
                                Ok(Flow::Continue)
                            }
                            None => self.backtrack(),
                        }
                    }
                    _ => self.backtrack(),
                }
            }

            // --- builtins and meta-calls ------------------------------
            Instr::Builtin { name, args } => {
                let functor = Functor { sym: *name, arity: args.len() as u8 };
                let Some(handler) = self.db.builtin(functor) else {
                    return Err(Error::UndefinedBuiltin(
                        self.mem.syms.display_functor(functor),
                    ));
                };
                let mut cells = Vec::with_capacity(args.len());
                for arg in args {
                    let cell = self.operand(arg)?;
                    cells.push(self.mem.walk(cell));
                }
                if handler(self, &cells)? {
                    self.advance(addr)
                } else {
                    self.backtrack()
                }
            }
            Instr::InlineUnify(a, b) => {
                let a = self.operand(a)?;
                let b = self.operand(b)?;
                if self.unify_cells(a, b) {
                    self.advance(addr)
                } else {
                    self.backtrack()
                }
            }
            Instr::CallMeta { goal, params } => self.meta_call(*goal, params, false),
            Instr::ExecuteMeta { goal, params } => self.meta_call(*goal, params, true),

            // --- attributed refs --------------------------------------
            Instr::PutAttr { pkg, addr: slot, attr } => {
                match self.mem.walk(self.get_slot(*slot)?) {
                    Cell::Ref(id) => {
                        let value = self.operand(attr)?;
                        self.attrs.put(id, *pkg, value);
                        self.advance(addr)
                    }
                    _ => self.backtrack(),
                }
            }
            Instr::GetAttr { pkg, addr: slot, attr } => {
                match self.mem.walk(self.get_slot(*slot)?) {
                    Cell::Ref(id) => match self.attrs.get(id, *pkg) {
                        Some(value) => {
                            let out = self.operand(attr)?;
                            if self.unify_cells(out, value) {
                                self.advance(addr)
                            } else {
                                self.backtrack()
                            }
                        }
                        None => self.backtrack(),
                    },
                    _ => self.backtrack(),
                }
            }
            Instr::DelAttr { pkg, addr: slot } => {
                if let Cell::Ref(id) = self.mem.walk(self.get_slot(*slot)?) {
                    self.attrs.del(id, *pkg);
                }
                self.advance(addr)
            }
            Instr::ImportPkg(pkg) => {
                if self.packages.contains_key(pkg) {
                    self.advance(addr)
                } else if self.strict {
                    Err(Error::UnknownAttrPackage(
                        self.mem.syms.resolve(*pkg).to_owned(),
                    ))
                } else {
                    tracing::warn!(
                        "import of unregistered attribute package {}",
                        self.mem.syms.resolve(*pkg)
                    );
                    self.advance(addr)
                }
            }
        }
    }

    fn advance(&mut self, addr: InstrAddr) -> Result<Flow> {
        self.code_ptr = Some(addr.next());
        Ok(Flow::Continue)
    }

    fn get_struct(&mut self, reg: Reg, functor: Functor, addr: InstrAddr) -> Result<Flow> {
        match self.mem.walk(self.get_reg(reg)?) {
            Cell::Rcd(id) => {
                if self.mem.rcd(id).functor == functor {
                    self.mode = Mode::Read;
                    self.complex = Some(ComplexArg { rcd: id, index: 0 });
                    self.advance(addr)
                } else {
                    self.backtrack()
                }
            }
            cell @ Cell::Ref(_) => {
                let id = self.mem.fresh_rcd(functor);
                // Binds the ref to the new empty struct; slots fill in
                // write mode.
                self.unify_cells(cell, Cell::Rcd(id));
                self.mode = Mode::Write;
                self.complex = Some(ComplexArg { rcd: id, index: 0 });
                self.advance(addr)
            }
            Cell::Sym(_) => self.backtrack(),
        }
    }

    /// Current struct slot in read mode.
    fn read_slot(&self) -> Result<Cell> {
        let complex = self.complex.ok_or(Error::NoStructInProgress)?;
        self.mem
            .rcd(complex.rcd)
            .slots
            .get(complex.index)
            .copied()
            .ok_or(Error::NoStructInProgress)
    }

    /// Append to the struct being built in write mode.
    fn write_slot(&mut self, cell: Cell) -> Result<()> {
        let complex = self.complex.ok_or(Error::NoStructInProgress)?;
        self.mem.rcd_mut(complex.rcd).slots.push(cell);
        Ok(())
    }

    fn bump_complex(&mut self) {
        if let Some(complex) = &mut self.complex {
            complex.index += 1;
        }
    }

    fn meta_call(&mut self, goal: Slot, params: &[Operand], tail: bool) -> Result<Flow> {
        let mut cells = Vec::with_capacity(params.len());
        for param in params {
            cells.push(self.operand(param)?);
        }
        match self.mem.walk(self.get_slot(goal)?) {
            Cell::Ref(_) => Err(Error::UnboundMetaGoal),
            Cell::Sym(sym) => {
                let functor = Functor { sym, arity: cells.len() as u8 };
                for (i, cell) in cells.into_iter().enumerate() {
                    self.set_reg(Reg(i as u8), cell);
                }
                self.do_call(functor, tail)
            }
            Cell::Rcd(id) => {
                let rcd_functor = self.mem.rcd(id).functor;
                let base = rcd_functor.arity as usize;
                let total = base + cells.len();
                if total > u8::MAX as usize {
                    return Err(Error::MetaGoalNotCallable(
                        self.mem.syms.display_functor(rcd_functor),
                    ));
                }
                let slots = self.mem.rcd(id).slots.clone();
                for (i, cell) in slots.into_iter().enumerate() {
                    self.set_reg(Reg(i as u8), cell);
                }
                for (i, cell) in cells.into_iter().enumerate() {
                    self.set_reg(Reg((base + i) as u8), cell);
                }
                let functor = Functor { sym: rcd_functor.sym, arity: total as u8 };
                self.do_call(functor, tail)
            }
        }
    }

    fn cons_functor(&mut self) -> Functor {
        Functor { sym: self.mem.intern("."), arity: 2 }
    }

    /// The cons functor if `.` is interned; a never-matching functor
    /// otherwise, so list dispatch simply misses.
    fn cons_functor_if_interned(&self) -> Functor {
        match self.mem.syms.lookup(".") {
            Some(sym) => Functor { sym, arity: 2 },
            None => Functor { sym: crate::defs::Sym::new(u32::MAX as usize), arity: 2 },
        }
    }
}

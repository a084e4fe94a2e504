//! The register-machine interpreter: state, call/return/backtrack protocol,
//! and the answer iterator. Instruction dispatch lives in [`exec`].

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;

use derive_more::From;
use indexmap::IndexMap;

use crate::{
    attrs::{AttrTable, UnifFrame},
    cell::{Cell, Functor},
    compile,
    defs::{ChoiceId, EnvId, RcdId, RefId, Sym},
    index::{CallKey, Database, Predicate},
    instr::{Instr, InstrAddr, Lbl, Operand, Reg, Slot},
    syntax::Term,
    unify::{TrailEntry, Unifier},
};

mod exec;
#[cfg(test)]
mod tests;

pub type Result<T> = std::result::Result<T, Error>;

/// Operational errors. Any of these escapes the instruction loop; the
/// machine state is undefined afterwards and the answer iterator is done.
#[derive(Debug, From)]
pub enum Error {
    StepBudgetExceeded { budget: u64 },
    DepthLimitExceeded { limit: usize },
    UndefinedPredicate(String),
    UndefinedBuiltin(String),
    UnboundMetaGoal,
    MetaGoalNotCallable(String),
    EmptyRegister(u8),
    EmptySlot(u16),
    NoEnvironment,
    NoChoicePoint,
    NoStructInProgress,
    UnknownLabel(Lbl),
    CodeOutOfBounds(String),
    UnknownAttrPackage(String),
    AttrHandlerFailed(String),
    #[from]
    Trace(std::io::Error),
    #[from]
    Snapshot(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::StepBudgetExceeded { budget } => {
                write!(f, "step budget of {budget} exceeded")
            }
            Error::DepthLimitExceeded { limit } => {
                write!(f, "environment depth limit of {limit} exceeded")
            }
            Error::UndefinedPredicate(name) => write!(f, "undefined predicate {name}"),
            Error::UndefinedBuiltin(name) => write!(f, "undefined builtin {name}"),
            Error::UnboundMetaGoal => write!(f, "meta-call goal is unbound"),
            Error::MetaGoalNotCallable(what) => {
                write!(f, "meta-call goal is not callable: {what}")
            }
            Error::EmptyRegister(reg) => write!(f, "read of empty register X{reg}"),
            Error::EmptySlot(slot) => write!(f, "read of empty slot Y{slot}"),
            Error::NoEnvironment => write!(f, "no environment frame"),
            Error::NoChoicePoint => write!(f, "no choice point"),
            Error::NoStructInProgress => write!(f, "unify instruction outside a struct"),
            Error::UnknownLabel(lbl) => write!(f, "unknown label L{lbl}"),
            Error::CodeOutOfBounds(addr) => write!(f, "fell off clause code at {addr}"),
            Error::UnknownAttrPackage(name) => {
                write!(f, "unknown attribute package {name}")
            }
            Error::AttrHandlerFailed(name) => {
                write!(f, "attribute handler for {name} failed")
            }
            Error::Trace(err) => write!(f, "trace sink: {err}"),
            Error::Snapshot(err) => write!(f, "snapshot record: {err}"),
        }
    }
}

impl std::error::Error for Error {}

/// An attribute-package hook: (machine, attributed ref, binding value,
/// attribute value) → keep the binding?
pub type AttrHook = Arc<dyn Fn(&mut Vm, RefId, Cell, Cell) -> Result<bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Run,
    Read,
    Write,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Run => write!(f, "run"),
            Mode::Read => write!(f, "read"),
            Mode::Write => write!(f, "write"),
        }
    }
}

/// The struct currently being read or written by unify instructions.
#[derive(Debug, Clone, Copy)]
pub struct ComplexArg {
    pub rcd: RcdId,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct Env {
    pub prev: Option<EnvId>,
    pub continuation: Option<InstrAddr>,
    pub slots: Vec<Option<Cell>>,
    pub depth: usize,
}

/// Saved state for retrying alternative clauses. `alternatives[next_alt]`
/// is where backtracking resumes; the watermarks say how far to rewind the
/// arenas. A code-managed choice point (`try_me_else` family) is updated
/// and popped by the clause code's own retry/trust instructions, never by
/// the backtracker.
pub struct Choice {
    pub prev: Option<ChoiceId>,
    pub env: Option<EnvId>,
    pub continuation: Option<InstrAddr>,
    pub functor: Functor,
    pub alternatives: Vec<InstrAddr>,
    pub next_alt: usize,
    pub code_managed: bool,
    pub saved_args: Vec<Option<Cell>>,
    pub trail: Vec<TrailEntry>,
    pub ref_top: usize,
    pub rcd_top: usize,
    pub env_len: usize,
    pub attr_snapshot: AttrTable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub steps: u64,
    pub clauses_considered: u64,
    pub peak_env_depth: usize,
}

/// One answer: query variable names mapped to their walked terms, in query
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution(pub IndexMap<String, Term>);

impl std::fmt::Display for Solution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "true");
        }
        for (i, (name, term)) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name} = {term}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    Answer(Solution),
    Exhausted,
}

/// The interpreter. One mutable state per query, over a shared read-only
/// database.
pub struct Vm {
    pub(crate) db: Arc<Database>,
    pub(crate) mem: crate::mem::Mem,
    pub(crate) query: Predicate,
    pub(crate) query_functor: Functor,
    pub(crate) query_vars: Vec<String>,
    pub(crate) query_env: Option<EnvId>,

    pub(crate) regs: Vec<Option<Cell>>,
    pub(crate) mode: Mode,
    pub(crate) complex: Option<ComplexArg>,
    pub(crate) code_ptr: Option<InstrAddr>,
    pub(crate) continuation: Option<InstrAddr>,
    pub(crate) envs: Vec<Env>,
    pub(crate) env_top: Option<EnvId>,
    pub(crate) choices: Vec<Choice>,
    pub(crate) choice_top: Option<ChoiceId>,
    pub(crate) frames: VecDeque<UnifFrame>,
    pub(crate) attrs: AttrTable,
    packages: HashMap<Sym, AttrHook>,
    /// Every binding made this run, rendered at bind time.
    pub(crate) bindings_seen: Vec<(String, String)>,

    pub(crate) stats: Stats,
    step_budget: Option<u64>,
    depth_limit: Option<usize>,
    strict: bool,
    surface_attr_errors: bool,
    pub(crate) trace: Option<Box<dyn Write>>,
    pub(crate) trace_sent_clauses: bool,
    /// Set while the current step triggered backtracking; snapshots report it.
    pub(crate) backtracked: bool,
}

impl Vm {
    /// Compile the query and set up a fresh machine over the database.
    pub fn new(db: Arc<Database>, goals: &[Term]) -> compile::Result<Self> {
        let mut syms = db.syms.clone();
        let (clause, query_vars) = db.compile_query(goals, &mut syms)?;
        let query_functor = clause.functor;
        let nregs = clause.nregs;
        let query = Predicate::single(clause);
        Ok(Self {
            db,
            mem: crate::mem::Mem::new(syms),
            query,
            query_functor,
            query_vars,
            query_env: None,
            regs: vec![None; nregs],
            mode: Mode::Run,
            complex: None,
            code_ptr: Some(InstrAddr::clause_start(query_functor, 0)),
            continuation: None,
            envs: Vec::new(),
            env_top: None,
            choices: Vec::new(),
            choice_top: None,
            frames: VecDeque::new(),
            attrs: AttrTable::new(),
            packages: HashMap::new(),
            bindings_seen: Vec::new(),
            stats: Stats::default(),
            step_budget: None,
            depth_limit: None,
            strict: false,
            surface_attr_errors: false,
            trace: None,
            trace_sent_clauses: false,
            backtracked: false,
        })
    }

    /// Compile a query and return its answer iterator in one go.
    pub fn solve(db: Arc<Database>, goals: &[Term]) -> compile::Result<Solutions> {
        Ok(Self::new(db, goals)?.run())
    }

    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = Some(budget);
        self
    }

    pub fn with_depth_limit(mut self, limit: usize) -> Self {
        self.depth_limit = Some(limit);
        self
    }

    /// In strict mode a call to an unknown predicate is an operational
    /// error instead of a silent failure.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn surface_attr_errors(mut self) -> Self {
        self.surface_attr_errors = true;
        self
    }

    /// Emit one JSONL state record per executed instruction to `sink`.
    pub fn with_trace(mut self, sink: Box<dyn Write>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn register_attribute_package<F>(&mut self, name: &str, hook: F)
    where
        F: Fn(&mut Vm, RefId, Cell, Cell) -> Result<bool> + Send + Sync + 'static,
    {
        let sym = self.mem.intern(name);
        self.packages.insert(sym, Arc::new(hook));
    }

    pub fn run(self) -> Solutions {
        Solutions { vm: self, done: false }
    }

    pub fn mem(&self) -> &crate::mem::Mem {
        &self.mem
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Bindings made so far, rendered at bind time.
    pub fn bindings_seen(&self) -> &[(String, String)] {
        &self.bindings_seen
    }

    // ------------------------------------------------------------------
    // Register, slot and operand access.

    pub(crate) fn get_reg(&self, reg: Reg) -> Result<Cell> {
        self.regs
            .get(reg.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::EmptyRegister(reg.0))
    }

    pub(crate) fn set_reg(&mut self, reg: Reg, cell: Cell) {
        let idx = reg.0 as usize;
        if idx >= self.regs.len() {
            self.regs.resize(idx + 1, None);
        }
        self.regs[idx] = Some(cell);
    }

    pub(crate) fn get_slot(&self, slot: Slot) -> Result<Cell> {
        match slot {
            Slot::Reg(reg) => self.get_reg(reg),
            Slot::Local(local) => {
                let env = self.env_top.ok_or(Error::NoEnvironment)?;
                self.envs[env].slots[local.0 as usize].ok_or(Error::EmptySlot(local.0))
            }
        }
    }

    pub(crate) fn set_slot(&mut self, slot: Slot, cell: Cell) -> Result<()> {
        match slot {
            Slot::Reg(reg) => self.set_reg(reg, cell),
            Slot::Local(local) => {
                let env = self.env_top.ok_or(Error::NoEnvironment)?;
                let idx = local.0 as usize;
                // Writes into frames older than the newest choice point are
                // value-trailed so backtracking restores them exactly.
                if let Some(ci) = self.choice_top {
                    if env < self.choices[ci].env_len {
                        let old = self.envs[env].slots[idx];
                        self.choices[ci].trail.push(TrailEntry::EnvSlot {
                            env,
                            slot: idx,
                            old,
                        });
                    }
                }
                self.envs[env].slots[idx] = Some(cell);
            }
        }
        Ok(())
    }

    pub(crate) fn operand(&self, op: &Operand) -> Result<Cell> {
        match op {
            Operand::Slot(slot) => self.get_slot(*slot),
            Operand::Atom(sym) => Ok(Cell::Sym(*sym)),
        }
    }

    // ------------------------------------------------------------------
    // Binding and unification against the machine's trail.

    fn watermark(&self) -> usize {
        self.choice_top.map_or(0, |ci| self.choices[ci].ref_top)
    }

    /// Unify two cells under the machine's trail; the public entry point
    /// for builtin handlers.
    pub fn unify_cells(&mut self, a: Cell, b: Cell) -> bool {
        let watermark = self.watermark();
        let choice_top = self.choice_top;
        let mut scratch = Vec::new();
        let trail = match choice_top {
            Some(ci) => &mut self.choices[ci].trail,
            None => &mut scratch,
        };
        Unifier {
            mem: &mut self.mem,
            attrs: &self.attrs,
            watermark,
            trail,
            log: &mut self.bindings_seen,
            frames: &mut self.frames,
        }
        .unify(a, b)
    }

    /// A fresh unbound ref; named when it materializes a query variable so
    /// answers and traces show source names.
    pub(crate) fn fresh_ref_for(&mut self, slot: Slot) -> Cell {
        if let Slot::Local(local) = slot {
            if self.env_top == self.query_env && self.query_env.is_some() {
                if let Some(name) = self.query_vars.get(local.0 as usize) {
                    let name = name.clone();
                    return self.mem.fresh_named_ref(&name);
                }
            }
        }
        self.mem.fresh_ref()
    }

    // ------------------------------------------------------------------
    // Code access.

    pub(crate) fn clause_meta(&self, functor: Functor, idx: usize) -> Option<(usize, u8)> {
        let pred = self.predicate(functor)?;
        let clause = pred.clauses.get(idx)?;
        Some((clause.nregs, functor.arity))
    }

    pub(crate) fn predicate(&self, functor: Functor) -> Option<&Predicate> {
        if functor == self.query_functor {
            Some(&self.query)
        } else {
            self.db.predicate(functor)
        }
    }

    pub(crate) fn fetch(&self, addr: InstrAddr) -> Option<Instr> {
        self.predicate(addr.functor)?
            .clauses
            .get(addr.clause)?
            .code
            .get(addr.instr)
            .cloned()
    }

    /// Position of `label` in the clause `addr` points into.
    pub(crate) fn resolve_label(&self, addr: InstrAddr, label: Lbl) -> Result<InstrAddr> {
        let pred = self
            .predicate(addr.functor)
            .ok_or(Error::UnknownLabel(label))?;
        let code = &pred.clauses[addr.clause].code;
        for (i, instr) in code.iter().enumerate() {
            if matches!(instr, Instr::Label(l) if *l == label) {
                return Ok(InstrAddr { instr: i, ..addr });
            }
        }
        Err(Error::UnknownLabel(label))
    }

    // ------------------------------------------------------------------
    // Call protocol.

    pub(crate) fn do_call(&mut self, functor: Functor, tail: bool) -> Result<Flow> {
        if !tail {
            self.continuation = self.code_ptr.map(InstrAddr::next);
        }
        self.mode = Mode::Run;
        self.complex = None;

        let Some(pred) = self.predicate(functor) else {
            if self.strict {
                return Err(Error::UndefinedPredicate(
                    self.mem.syms.display_functor(functor),
                ));
            }
            tracing::debug!(
                "call to unknown predicate {}",
                self.mem.syms.display_functor(functor)
            );
            return self.backtrack();
        };

        let key = if functor.arity == 0 {
            None
        } else {
            Some(match self.mem.walk(self.get_reg(Reg(0))?) {
                Cell::Ref(_) => CallKey::Unbound,
                Cell::Sym(sym) => CallKey::Atom(sym),
                Cell::Rcd(id) => CallKey::Struct(self.mem.rcd(id).functor),
            })
        };
        let candidates = pred.lookup(key);

        match candidates.len() {
            0 => self.backtrack(),
            1 => self.enter(InstrAddr::clause_start(functor, candidates[0])),
            _ => {
                let alternatives = candidates
                    .iter()
                    .map(|&c| InstrAddr::clause_start(functor, c))
                    .collect::<Vec<_>>();
                let first = alternatives[0];
                self.push_choice(functor, alternatives, 1, false);
                self.enter(first)
            }
        }
    }

    /// Start executing the clause (or alternative block) at `addr`.
    pub(crate) fn enter(&mut self, addr: InstrAddr) -> Result<Flow> {
        self.stats.clauses_considered += 1;
        if let Some((nregs, arity)) = self.clause_meta(addr.functor, addr.clause) {
            let need = nregs.max(arity as usize);
            if need > self.regs.len() {
                self.regs.resize(need, None);
            }
        }
        self.code_ptr = Some(addr);
        Ok(Flow::Continue)
    }

    pub(crate) fn push_choice(
        &mut self,
        functor: Functor,
        alternatives: Vec<InstrAddr>,
        next_alt: usize,
        code_managed: bool,
    ) {
        let mut saved_args: Vec<Option<Cell>> =
            self.regs.iter().copied().take(functor.arity as usize).collect();
        saved_args.resize(functor.arity as usize, None);
        let choice = Choice {
            prev: self.choice_top,
            env: self.env_top,
            continuation: self.continuation,
            functor,
            alternatives,
            next_alt,
            code_managed,
            saved_args,
            trail: Vec::new(),
            ref_top: self.mem.refs.len(),
            rcd_top: self.mem.rcds.len(),
            env_len: self.envs.len(),
            attr_snapshot: self.attrs.clone(),
        };
        self.choices.push(choice);
        self.choice_top = Some(self.choices.len() - 1);
    }

    /// Pop to the newest choice point, rewind, and enter the next
    /// alternative. With no choice point left, the search space is done.
    pub(crate) fn backtrack(&mut self) -> Result<Flow> {
        self.backtracked = true;
        let Some(ci) = self.choice_top else {
            return Ok(Flow::Exhausted);
        };

        let trail = std::mem::take(&mut self.choices[ci].trail);
        for entry in trail.into_iter().rev() {
            match entry {
                TrailEntry::Bind(id) => self.mem.set_ref(id, None),
                TrailEntry::EnvSlot { env, slot, old } => {
                    self.envs[env].slots[slot] = old;
                }
            }
        }

        let choice = &mut self.choices[ci];
        self.mem.refs.truncate(choice.ref_top);
        self.mem.rcds.truncate(choice.rcd_top);
        self.envs.truncate(choice.env_len);
        self.regs.clear();
        self.regs.extend(choice.saved_args.iter().copied());
        self.env_top = choice.env;
        self.continuation = choice.continuation;
        self.attrs = choice.attr_snapshot.clone();
        self.frames.clear();
        self.mode = Mode::Run;
        self.complex = None;

        let next = choice.alternatives[choice.next_alt];
        if !choice.code_managed {
            choice.next_alt += 1;
            if choice.next_alt >= choice.alternatives.len() {
                self.choice_top = choice.prev;
                self.choices.truncate(ci);
            }
        }
        self.enter(next)
    }

    // ------------------------------------------------------------------
    // Stepping.

    pub(crate) fn step(&mut self) -> Result<Flow> {
        if let Some(budget) = self.step_budget {
            if self.stats.steps >= budget {
                return Err(Error::StepBudgetExceeded { budget });
            }
        }
        self.stats.steps += 1;

        let Some(addr) = self.code_ptr else {
            return Ok(Flow::Exhausted);
        };
        let instr = self.fetch(addr).ok_or_else(|| {
            Error::CodeOutOfBounds(addr.display(self.mem.symbols()))
        })?;

        self.backtracked = false;
        let mut flow = self.dispatch(&instr, addr)?;
        if matches!(flow, Flow::Continue) && !self.frames.is_empty() {
            flow = self.drain_frames()?;
        }
        if self.trace.is_some() {
            self.emit_snapshot(addr)?;
        }
        Ok(flow)
    }

    /// Run the suspended attribute checks, package hooks in attribute
    /// insertion order. A refusing hook backtracks; a hook error backtracks
    /// too unless errors are configured to surface.
    fn drain_frames(&mut self) -> Result<Flow> {
        while let Some(frame) = self.frames.pop_front() {
            for (pkg, attr_value) in frame.attributes.clone() {
                let Some(hook) = self.packages.get(&pkg).cloned() else {
                    tracing::warn!(
                        "no hook for attribute package {}; accepting binding",
                        self.mem.syms.resolve(pkg)
                    );
                    continue;
                };
                match hook(self, frame.attributed_ref, frame.binding_value, attr_value) {
                    Ok(true) => {}
                    Ok(false) => return self.backtrack(),
                    Err(err) if self.surface_attr_errors => return Err(err),
                    Err(err) => {
                        tracing::debug!("attribute handler failed: {err}; backtracking");
                        return self.backtrack();
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Answers.

    pub(crate) fn answer(&self) -> Solution {
        let mut map = IndexMap::new();
        if let Some(env) = self.query_env {
            let slots = &self.envs[env].slots;
            for (i, name) in self.query_vars.iter().enumerate() {
                let term = match slots.get(i).copied().flatten() {
                    Some(cell) => self.render(cell),
                    None => Term::var(name.clone()),
                };
                map.insert(name.clone(), term);
            }
        }
        Solution(map)
    }

    /// Reconstruct a source-level term from a cell, walking refs. Depth is
    /// capped; unification without an occurs check can produce cycles.
    pub fn render(&self, cell: Cell) -> Term {
        self.render_depth(cell, 0)
    }

    fn render_depth(&self, cell: Cell, depth: usize) -> Term {
        if depth > 64 {
            return Term::atom("...");
        }
        match self.mem.walk(cell) {
            Cell::Sym(sym) => Term::atom(self.mem.syms.resolve(sym)),
            Cell::Ref(id) => Term::var(self.mem.display_name_of(id)),
            Cell::Rcd(id) => {
                let rcd = self.mem.rcd(id);
                let name = self.mem.syms.resolve(rcd.functor.sym).to_owned();
                let args = rcd
                    .slots
                    .iter()
                    .map(|&slot| self.render_depth(slot, depth + 1))
                    .collect();
                Term::Struct(name, args)
            }
        }
    }

    fn emit_snapshot(&mut self, executed: InstrAddr) -> Result<()> {
        let record = crate::snapshot::record(self, executed);
        let line = serde_json::to_string(&record)?;
        if let Some(sink) = self.trace.as_mut() {
            writeln!(sink, "{line}")?;
            self.trace_sent_clauses = true;
        }
        Ok(())
    }
}

/// Depth-first answer iterator. Errors are final: after an `Err` the
/// iterator is exhausted.
pub struct Solutions {
    vm: Vm,
    done: bool,
}

impl Iterator for Solutions {
    type Item = Result<Solution>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.vm.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Answer(solution)) => {
                    // Seek the next answer from here on.
                    match self.vm.backtrack() {
                        Ok(Flow::Exhausted) => self.done = true,
                        Ok(_) => {}
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                    return Some(Ok(solution));
                }
                Ok(Flow::Exhausted) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Solutions {
    pub fn stats(&self) -> Stats {
        self.vm.stats()
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

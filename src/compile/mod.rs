//! Clause compiler: chunk analysis, Debray register allocation, instruction
//! emission.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};

use crate::{
    cell::Functor,
    defs::Sym,
    instr::{Instr, Local, Operand, Reg, Slot},
    mem::SymbolTable,
    syntax::{Clause, Term},
};

#[cfg(test)]
mod tests;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ClauseHeadIsVariable(String),
    NonCallableGoal(Term),
    MetaCallWithoutGoal,
    ArityTooLarge { name: String, arity: usize },
    AttrPackageNotAtom(Term),
    AttrTargetNotVar(Term),
    RegisterPressure { name: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ClauseHeadIsVariable(name) => {
                write!(f, "clause head is a variable: {name}")
            }
            Error::NonCallableGoal(term) => write!(f, "goal is not callable: {term}"),
            Error::MetaCallWithoutGoal => write!(f, "call/N needs a goal argument"),
            Error::ArityTooLarge { name, arity } => {
                write!(f, "arity of {name} exceeds the register file: {arity}")
            }
            Error::AttrPackageNotAtom(term) => {
                write!(f, "attribute package must be an atom, got {term}")
            }
            Error::AttrTargetNotVar(term) => {
                write!(f, "attribute target must be a variable, got {term}")
            }
            Error::RegisterPressure { name } => {
                write!(f, "no register available for {name}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Compilation switches. `last_call_opt` turns the final `call` of an
/// environment-holding clause into `deallocate; execute`; turning it off
/// keeps `call … deallocate; proceed`, trading one environment frame of
/// stack depth for the same answers.
#[derive(Debug, Clone, Copy)]
pub struct CompileOpts {
    pub last_call_opt: bool,
}

impl Default for CompileOpts {
    fn default() -> Self {
        Self { last_call_opt: true }
    }
}

/// Shape of a clause's first head argument, for first-argument indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstArg {
    /// Zero-arity predicate.
    None,
    Var,
    Atom(Sym),
    Struct(Functor),
}

/// One clause, compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledClause {
    pub functor: Functor,
    pub code: Vec<Instr>,
    pub nregs: usize,
    pub nperms: usize,
    pub first_arg: FirstArg,
}

impl CompiledClause {
    pub fn listing(&self, syms: &SymbolTable) -> Vec<String> {
        self.code.iter().map(|i| i.display(syms).to_string()).collect()
    }
}

/// Attribute goal forms compiled to dedicated instructions.
const ATTR_FORMS: [(&str, usize); 4] = [
    ("put_attr", 3),
    ("get_attr", 3),
    ("del_attr", 2),
    ("import_pkg", 1),
];

fn is_attr_form(name: &str, arity: usize) -> bool {
    ATTR_FORMS.contains(&(name, arity))
}

/// Yield all variable names in `term`, depth-first, with repetition.
fn term_vars<'t>(term: &'t Term, out: &mut Vec<&'t str>) {
    match term {
        Term::Var(name) => out.push(name),
        Term::Struct(_, args) => {
            for arg in args {
                term_vars(arg, out);
            }
        }
        Term::Atom(_) => {}
    }
}

fn args_of(term: &Term) -> &[Term] {
    match term {
        Term::Struct(_, args) => args,
        _ => &[],
    }
}

/// Section of a clause: inline goals (builtins, attribute forms) closed by
/// one call-shaped goal. The head opens the first chunk; trailing inline
/// goals form a final chunk of their own.
struct Chunk {
    terms: Vec<Term>,
}

impl Chunk {
    /// All variables in the chunk, depth-first, without repetition.
    fn vars(&self) -> IndexSet<String> {
        let mut names = Vec::new();
        for term in &self.terms {
            term_vars(term, &mut names);
        }
        names.into_iter().map(str::to_owned).collect()
    }
}

/// Structs nested in the chunk goals' arguments; each needs a register of
/// its own while being built or matched.
fn count_nested_structs(chunk: &Chunk) -> usize {
    fn count(term: &Term, n: &mut usize) {
        if let Term::Struct(_, args) = term {
            *n += 1;
            for arg in args {
                count(arg, n);
            }
        }
    }
    let mut n = 0;
    for term in &chunk.terms {
        for arg in args_of(term) {
            count(arg, &mut n);
        }
    }
    n
}

/// Per-chunk register analysis: the USE, NOUSE and CONFLICT sets of Debray's
/// allocator, plus the register-file size needed by the chunk.
struct ChunkSets {
    max_regs: usize,
    use_: HashMap<String, BTreeSet<u8>>,
    no_use: HashMap<String, BTreeSet<u8>>,
    conflict: HashMap<String, BTreeSet<u8>>,
}

impl ChunkSets {
    fn empty_set() -> BTreeSet<u8> {
        BTreeSet::new()
    }

    fn from_chunk(
        chunk: &Chunk,
        temps: &IndexSet<String>,
        is_head: bool,
        inline: &dyn Fn(&Term) -> bool,
    ) -> Self {
        let (Some(first), Some(last)) = (chunk.terms.first(), chunk.terms.last()) else {
            return ChunkSets {
                max_regs: 0,
                use_: HashMap::new(),
                no_use: HashMap::new(),
                conflict: HashMap::new(),
            };
        };

        let input_arity = if is_head { args_of(first).len() } else { 0 };
        let output_arity = if inline(last) { 0 } else { args_of(last).len() };
        let max_args = input_arity.max(output_arity);
        let max_regs = max_args + temps.len() + count_nested_structs(chunk);

        let mut use_: HashMap<String, BTreeSet<u8>> = HashMap::new();
        let mut calc_use = |term: &Term| {
            for (i, arg) in args_of(term).iter().enumerate() {
                if let Term::Var(name) = arg {
                    if temps.contains(name) {
                        use_.entry(name.clone()).or_default().insert(i as u8);
                    }
                }
            }
        };
        if is_head {
            calc_use(first);
        }
        calc_use(last);

        let mut no_use: HashMap<String, BTreeSet<u8>> = HashMap::new();
        for x in temps {
            for (i, arg) in args_of(last).iter().enumerate() {
                if let Term::Var(name) = arg {
                    if temps.contains(name)
                        && name != x
                        && !use_.get(x).is_some_and(|s| s.contains(&(i as u8)))
                    {
                        no_use.entry(x.clone()).or_default().insert(i as u8);
                    }
                }
            }
        }

        let mut vars_in_last = Vec::new();
        term_vars(last, &mut vars_in_last);
        let vars_in_last: HashSet<&str> = vars_in_last.into_iter().collect();

        let mut conflict: HashMap<String, BTreeSet<u8>> = HashMap::new();
        for x in temps {
            if !vars_in_last.contains(x.as_str()) {
                continue;
            }
            for (i, arg) in args_of(last).iter().enumerate() {
                if arg != &Term::Var(x.clone()) {
                    conflict.entry(x.clone()).or_default().insert(i as u8);
                }
            }
        }

        ChunkSets { max_regs, use_, no_use, conflict }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrAlloc {
    Existing,
    NewVar,
    NewStruct,
}

/// Clause-wide compilation state: variable classification and permanent-slot
/// assignment.
struct ClauseCtx {
    temps: IndexSet<String>,
    perms: IndexSet<String>,
    perm_addrs: IndexMap<String, Local>,
    /// Variables occurring exactly once in the clause; nested occurrences
    /// compile to `unify_void`. Queries keep them: every query variable
    /// must reach the answer map.
    singletons: HashSet<String>,
    is_query: bool,
}

impl ClauseCtx {
    fn perm_addr(&mut self, name: &str) -> (Local, AddrAlloc) {
        if let Some(&addr) = self.perm_addrs.get(name) {
            return (addr, AddrAlloc::Existing);
        }
        let addr = Local(self.perm_addrs.len() as u16);
        self.perm_addrs.insert(name.to_owned(), addr);
        (addr, AddrAlloc::NewVar)
    }
}

/// Chunk-local emission state: the free-register pool and what currently
/// lives where.
struct ChunkSt {
    sets: ChunkSets,
    free: BTreeSet<u8>,
    temp_addrs: HashMap<Term, u8>,
    reg_content: HashMap<u8, Term>,
    delayed: Vec<(Term, u8)>,
}

impl ChunkSt {
    fn set_reg(&mut self, reg: u8, term: Term) {
        self.temp_addrs.insert(term.clone(), reg);
        self.reg_content.insert(reg, term);
    }

    fn unset_reg(&mut self, reg: u8, term: &Term) {
        self.temp_addrs.remove(term);
        self.reg_content.remove(&reg);
    }
}

/// Compiles clauses and queries against a symbol table and the set of
/// builtins known to the database.
pub struct Compiler<'a> {
    pub syms: &'a mut SymbolTable,
    pub builtins: &'a HashSet<(String, u8)>,
    pub opts: CompileOpts,
}

impl<'a> Compiler<'a> {
    pub fn new(syms: &'a mut SymbolTable, builtins: &'a HashSet<(String, u8)>) -> Self {
        Self { syms, builtins, opts: CompileOpts::default() }
    }

    pub fn with_opts(mut self, opts: CompileOpts) -> Self {
        self.opts = opts;
        self
    }

    fn is_inline(&self, term: &Term) -> bool {
        match term.name_arity() {
            Some((name, arity)) => {
                is_attr_form(name, arity)
                    || (arity <= u8::MAX as usize
                        && self.builtins.contains(&(name.to_owned(), arity as u8)))
            }
            None => false,
        }
    }

    pub fn compile_clause(&mut self, clause: &Clause) -> Result<CompiledClause> {
        let head = match &clause.head {
            Term::Var(name) => return Err(Error::ClauseHeadIsVariable(name.clone())),
            head => head.clone(),
        };
        let body = normalize_goals(&clause.body)?;
        self.compile_normalized(&head, &body, false).map(|(c, _)| c)
    }

    /// Compile query goals as a headless clause with every variable forced
    /// permanent, so the bindings survive in the query frame for rendering.
    /// Returns the variable names in slot order.
    pub fn compile_query(&mut self, goals: &[Term]) -> Result<(CompiledClause, Vec<String>)> {
        let head = Term::atom("query__");
        let body = normalize_goals(goals)?;
        self.compile_normalized(&head, &body, true)
    }

    fn compile_normalized(
        &mut self,
        head: &Term,
        body: &[Term],
        is_query: bool,
    ) -> Result<(CompiledClause, Vec<String>)> {
        let (head_name, head_arity) =
            head.name_arity().ok_or_else(|| Error::NonCallableGoal(head.clone()))?;
        if head_arity > u8::MAX as usize {
            return Err(Error::ArityTooLarge { name: head_name.to_owned(), arity: head_arity });
        }
        for goal in body {
            let (name, arity) =
                goal.name_arity().ok_or_else(|| Error::NonCallableGoal(goal.clone()))?;
            if arity > u8::MAX as usize {
                return Err(Error::ArityTooLarge { name: name.to_owned(), arity });
            }
        }

        let functor = self.syms.intern_functor(head_name, head_arity as u8);
        let first_arg = match args_of(head).first() {
            None => FirstArg::None,
            Some(Term::Var(_)) => FirstArg::Var,
            Some(Term::Atom(name)) => FirstArg::Atom(self.syms.intern(name)),
            Some(Term::Struct(name, args)) => {
                FirstArg::Struct(self.syms.intern_functor(name, args.len() as u8))
            }
        };

        // Chunk the clause and classify its variables.
        let chunks = self.gen_chunks(head, body);
        let mut var_chunks: IndexMap<String, IndexSet<usize>> = IndexMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            for name in chunk.vars() {
                var_chunks.entry(name).or_default().insert(i);
            }
        }
        let mut temps = IndexSet::new();
        let mut perms = IndexSet::new();
        for (name, idxs) in &var_chunks {
            if idxs.len() == 1 {
                temps.insert(name.clone());
            } else {
                perms.insert(name.clone());
            }
        }
        if is_query {
            // All query variables live in the query frame.
            perms.extend(temps.drain(..));
        }

        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        let mut names = Vec::new();
        term_vars(head, &mut names);
        for goal in body {
            term_vars(goal, &mut names);
        }
        for name in names {
            *occurrences.entry(name).or_default() += 1;
        }
        let singletons = occurrences
            .into_iter()
            .filter(|&(_, n)| n == 1)
            .map(|(name, _)| name.to_owned())
            .collect();

        let mut cx = ClauseCtx {
            temps,
            perms,
            perm_addrs: IndexMap::new(),
            singletons,
            is_query,
        };

        let mut code = Vec::new();
        let mut nregs = head_arity;
        let mut calls = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            let is_head = i == 0;
            let inline = |t: &Term| self.is_inline(t);
            let sets = ChunkSets::from_chunk(chunk, &cx.temps, is_head, &inline);
            nregs = nregs.max(sets.max_regs);
            let mut st = ChunkSt {
                free: (0..sets.max_regs.min(u8::MAX as usize) as u8).collect(),
                sets,
                temp_addrs: HashMap::new(),
                reg_content: HashMap::new(),
                delayed: Vec::new(),
            };
            calls += self.compile_chunk(&mut st, &mut cx, chunk, is_head, &mut code)?;
        }

        let nperms = cx.perm_addrs.len();
        let code = self.wrap_control(code, nperms, calls, is_query);
        let query_vars = cx.perm_addrs.keys().cloned().collect();

        Ok((
            CompiledClause { functor, code, nregs, nperms, first_arg },
            query_vars,
        ))
    }

    /// Split head+body into chunks: inline goals accumulate, a call-shaped
    /// goal closes the chunk, trailing inline goals close the clause.
    fn gen_chunks(&self, head: &Term, body: &[Term]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut terms = vec![head.clone()];
        for goal in body {
            terms.push(goal.clone());
            if self.is_inline(goal) {
                continue;
            }
            chunks.push(Chunk { terms: std::mem::take(&mut terms) });
        }
        if !terms.is_empty() {
            chunks.push(Chunk { terms });
        }
        chunks
    }

    /// Emit one chunk; returns the number of call-shaped goals emitted.
    fn compile_chunk(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        chunk: &Chunk,
        is_head: bool,
        out: &mut Vec<Instr>,
    ) -> Result<usize> {
        let mut terms = &chunk.terms[..];

        if is_head {
            let head = &terms[0];
            terms = &terms[1..];
            for i in 0..args_of(head).len() {
                st.free.remove(&(i as u8));
            }
            self.compile_head(st, cx, head, out)?;
        }

        if terms.is_empty() {
            return Ok(0);
        }

        let (inline_goals, last_goal) = match terms.last() {
            Some(last) if !self.is_inline(last) => (&terms[..terms.len() - 1], Some(last)),
            _ => (terms, None),
        };

        for goal in inline_goals {
            self.compile_inline_goal(st, cx, goal, out)?;
        }

        let mut calls = 0;
        if let Some(goal) = last_goal {
            calls = 1;
            if let Some(("call", _)) = goal.name_arity() {
                if meta_goal_var(goal).is_some() {
                    self.compile_meta_call(st, cx, goal, out)?;
                    return Ok(calls);
                }
            }
            let (name, arity) = goal
                .name_arity()
                .ok_or_else(|| Error::NonCallableGoal(goal.clone()))?;
            for (i, arg) in args_of(goal).iter().enumerate() {
                // The argument register is spoken for from here on; nested
                // allocations must not pick it.
                st.free.remove(&(i as u8));
                self.put_term(st, cx, arg, i as u8, true, out)?;
            }
            let functor = self.syms.intern_functor(name, arity as u8);
            out.push(Instr::Call(functor));
        }
        Ok(calls)
    }

    fn compile_head(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        head: &Term,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        st.delayed.clear();
        for (i, arg) in args_of(head).iter().enumerate() {
            self.get_term(st, cx, arg, i as u8, out)?;
        }
        while !st.delayed.is_empty() {
            let delayed = std::mem::take(&mut st.delayed);
            for (strukt, reg) in delayed {
                self.get_term(st, cx, &strukt, reg, out)?;
            }
        }
        Ok(())
    }

    fn get_term(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        term: &Term,
        reg: u8,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        match term {
            Term::Atom(name) => {
                let sym = self.syms.intern(name);
                out.push(Instr::GetAtom(Reg(reg), sym));
                st.free.insert(reg);
            }
            Term::Var(name) => {
                if cx.perms.contains(name) {
                    st.set_reg(reg, term.clone());
                    let (addr, alloc) = cx.perm_addr(name);
                    let instr = match alloc {
                        AddrAlloc::Existing => Instr::GetValue(Reg(reg), addr.into()),
                        _ => Instr::GetVariable(Reg(reg), addr.into()),
                    };
                    out.push(instr);
                    st.free.insert(reg);
                } else if let Some(&addr) = st.temp_addrs.get(term) {
                    // Second mention of a head variable unifies with its
                    // first home instead of stealing the register.
                    if addr != reg {
                        out.push(Instr::GetValue(Reg(reg), Slot::reg(addr)));
                    }
                    st.free.insert(reg);
                } else {
                    // First mention keeps the argument register; no move.
                    st.set_reg(reg, term.clone());
                }
            }
            Term::Struct(name, args) => {
                let functor = self.syms.intern_functor(name, args.len() as u8);
                out.push(Instr::GetStruct(Reg(reg), functor));
                st.free.insert(reg);
                for arg in args {
                    self.unify_arg(st, cx, arg, out)?;
                }
            }
        }
        Ok(())
    }

    fn unify_arg(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        term: &Term,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        match term {
            Term::Atom(name) => {
                let sym = self.syms.intern(name);
                out.push(Instr::UnifyAtom(sym));
            }
            Term::Var(name) => {
                if !cx.is_query && cx.singletons.contains(name) {
                    match out.last_mut() {
                        Some(Instr::UnifyVoid(n)) => *n += 1,
                        _ => out.push(Instr::UnifyVoid(1)),
                    }
                    return Ok(());
                }
                let (slot, alloc) = self.var_addr(st, cx, name, false)?;
                let instr = match alloc {
                    AddrAlloc::Existing => Instr::UnifyValue(slot),
                    _ => Instr::UnifyVariable(slot),
                };
                out.push(instr);
            }
            Term::Struct(..) => {
                let (reg, _) = self.temp_addr(st, cx, term, false)?;
                st.delayed.push((term.clone(), reg));
                out.push(Instr::UnifyVariable(Slot::reg(reg)));
            }
        }
        Ok(())
    }

    fn put_term(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        term: &Term,
        reg: u8,
        top_level: bool,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        // The argument register may still hold a temporary that is live
        // later; move it to its allocated home first.
        if top_level {
            if let Some(value) = st.reg_content.get(&reg).cloned() {
                let is_live_temp = matches!(&value, Term::Var(name)
                    if value != *term && cx.temps.contains(name));
                if is_live_temp {
                    st.unset_reg(reg, &value);
                    let (addr, _) = self.temp_addr(st, cx, &value, false)?;
                    if addr != reg {
                        out.push(Instr::GetVariable(Reg(reg), Slot::reg(addr)));
                    }
                }
            }
        }

        match term {
            Term::Atom(name) => {
                let sym = self.syms.intern(name);
                out.push(Instr::PutAtom(Reg(reg), sym));
            }
            Term::Var(name) => {
                let (slot, alloc) = self.var_addr(st, cx, name, false)?;
                if alloc == AddrAlloc::Existing && slot == Slot::reg(reg) {
                    return Ok(());
                }
                let instr = match alloc {
                    AddrAlloc::Existing => Instr::PutValue(Reg(reg), slot),
                    _ => Instr::PutVariable(Reg(reg), slot),
                };
                out.push(instr);
                if let Slot::Reg(Reg(r)) = slot {
                    st.free.insert(r);
                }
            }
            Term::Struct(name, args) => {
                // Nested structs build bottom-up: the machine has a single
                // struct cursor, so inner builds must finish first.
                let mut struct_addrs: HashMap<usize, u8> = HashMap::new();
                for (i, arg) in args.iter().enumerate() {
                    if matches!(arg, Term::Struct(..)) {
                        let (addr, alloc) = self.temp_addr(st, cx, arg, false)?;
                        if alloc == AddrAlloc::NewStruct {
                            self.put_term(st, cx, arg, addr, false, out)?;
                        }
                        struct_addrs.insert(i, addr);
                    }
                }
                let functor = self.syms.intern_functor(name, args.len() as u8);
                out.push(Instr::PutStruct(Reg(reg), functor));
                // Write mode appends slots in emission order, so the unify
                // stream must follow argument order exactly.
                for (i, arg) in args.iter().enumerate() {
                    match arg {
                        Term::Struct(..) => {
                            out.push(Instr::UnifyValue(Slot::reg(struct_addrs[&i])));
                        }
                        _ => self.unify_arg(st, cx, arg, out)?,
                    }
                }
            }
        }
        Ok(())
    }

    /// Address of a term used as a builtin or meta operand. New structs are
    /// built on the spot; a first-mention variable is materialized as a
    /// fresh unbound ref so the operand reads a real cell.
    fn term_addr(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        term: &Term,
        out: &mut Vec<Instr>,
    ) -> Result<Operand> {
        match term {
            Term::Atom(name) => Ok(Operand::Atom(self.syms.intern(name))),
            Term::Var(name) => {
                let (slot, alloc) = self.var_addr(st, cx, name, false)?;
                if alloc != AddrAlloc::Existing {
                    match slot {
                        Slot::Reg(Reg(r)) => out.push(Instr::PutVariable(Reg(r), slot)),
                        Slot::Local(_) => {
                            // The scratch register only carries the fresh
                            // ref into the slot; one past the chunk's pool
                            // is always safe.
                            let scratch = st.free.iter().next().copied().unwrap_or(
                                st.sets.max_regs.min(u8::MAX as usize) as u8,
                            );
                            out.push(Instr::PutVariable(Reg(scratch), slot));
                        }
                    }
                }
                Ok(Operand::Slot(slot))
            }
            Term::Struct(..) => {
                let (reg, alloc) = self.temp_addr(st, cx, term, false)?;
                if alloc == AddrAlloc::NewStruct {
                    self.put_term(st, cx, term, reg, false, out)?;
                }
                Ok(Operand::Slot(Slot::reg(reg)))
            }
        }
    }

    fn compile_inline_goal(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        goal: &Term,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let (name, arity) = goal
            .name_arity()
            .ok_or_else(|| Error::NonCallableGoal(goal.clone()))?;
        if is_attr_form(name, arity) {
            return self.compile_attr_goal(st, cx, goal, out);
        }
        let mut args = Vec::with_capacity(arity);
        for arg in args_of(goal) {
            args.push(self.term_addr(st, cx, arg, out)?);
        }
        let name = self.syms.intern(name);
        out.push(Instr::Builtin { name, args });
        Ok(())
    }

    fn compile_attr_goal(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        goal: &Term,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let (name, _) = goal
            .name_arity()
            .ok_or_else(|| Error::NonCallableGoal(goal.clone()))?;
        let args = args_of(goal);

        if name == "import_pkg" {
            let pkg = attr_pkg(self, &args[0])?;
            out.push(Instr::ImportPkg(pkg));
            return Ok(());
        }

        let pkg = attr_pkg(self, &args[0])?;
        let addr = match &args[1] {
            var @ Term::Var(vname) => {
                let operand = self.term_addr(st, cx, var, out)?;
                match operand {
                    Operand::Slot(slot) => slot,
                    Operand::Atom(_) => {
                        return Err(Error::AttrTargetNotVar(Term::var(vname.clone())))
                    }
                }
            }
            other => return Err(Error::AttrTargetNotVar(other.clone())),
        };

        let instr = match name {
            "put_attr" => {
                let attr = self.term_addr(st, cx, &args[2], out)?;
                Instr::PutAttr { pkg, addr, attr }
            }
            "get_attr" => {
                let attr = self.term_addr(st, cx, &args[2], out)?;
                Instr::GetAttr { pkg, addr, attr }
            }
            "del_attr" => Instr::DelAttr { pkg, addr },
            _ => unreachable!("attr form"),
        };
        out.push(instr);
        Ok(())
    }

    fn compile_meta_call(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        goal: &Term,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let args = args_of(goal);
        let goal_var = &args[0];
        let operand = self.term_addr(st, cx, goal_var, out)?;
        let goal_slot = match operand {
            Operand::Slot(slot) => slot,
            Operand::Atom(_) => unreachable!("meta goal is a variable"),
        };
        let mut params = Vec::new();
        for param in &args[1..] {
            params.push(self.term_addr(st, cx, param, out)?);
        }
        out.push(Instr::CallMeta { goal: goal_slot, params });
        Ok(())
    }

    fn var_addr(
        &mut self,
        st: &mut ChunkSt,
        cx: &mut ClauseCtx,
        name: &str,
        is_head: bool,
    ) -> Result<(Slot, AddrAlloc)> {
        if cx.perms.contains(name) {
            let (addr, alloc) = cx.perm_addr(name);
            return Ok((addr.into(), alloc));
        }
        let (reg, alloc) = self.temp_addr(st, cx, &Term::var(name), is_head)?;
        Ok((Slot::reg(reg), alloc))
    }

    /// Debray allocation for a temporary variable or nested struct: prefer a
    /// free register the term will be used in, avoid registers other terms
    /// need, take the lowest index.
    fn temp_addr(
        &mut self,
        st: &mut ChunkSt,
        _cx: &mut ClauseCtx,
        term: &Term,
        is_head: bool,
    ) -> Result<(u8, AddrAlloc)> {
        if let Some(&reg) = st.temp_addrs.get(term) {
            return Ok((reg, AddrAlloc::Existing));
        }

        let empty = ChunkSets::empty_set();
        let name = match term {
            Term::Var(name) => Some(name.as_str()),
            _ => None,
        };
        let use_ = name.and_then(|n| st.sets.use_.get(n)).unwrap_or(&empty);
        let mut no_use = name
            .and_then(|n| st.sets.no_use.get(n))
            .cloned()
            .unwrap_or_default();
        if !is_head {
            if let Some(conflict) = name.and_then(|n| st.sets.conflict.get(n)) {
                no_use.extend(conflict);
            }
        }

        let reg = st
            .free
            .intersection(use_)
            .next()
            .copied()
            .or_else(|| st.free.difference(&no_use).next().copied())
            .ok_or_else(|| Error::RegisterPressure {
                name: term.to_string(),
            })?;
        st.free.remove(&reg);
        st.set_reg(reg, term.clone());

        let alloc = match term {
            Term::Var(_) => AddrAlloc::NewVar,
            _ => AddrAlloc::NewStruct,
        };
        Ok((reg, alloc))
    }

    /// Bracket the emitted stream with environment control: `allocate` up
    /// front when the clause holds state across calls, `deallocate` before
    /// the final transfer, the final `call` turned into `execute` when the
    /// last-call optimization applies, `proceed` everywhere else.
    fn wrap_control(
        &self,
        mut code: Vec<Instr>,
        nperms: usize,
        calls: usize,
        is_query: bool,
    ) -> Vec<Instr> {
        let ends_with_call = matches!(code.last(), Some(Instr::Call(_) | Instr::CallMeta { .. }));
        let lco = self.opts.last_call_opt && !is_query;
        let needs_env = is_query
            || nperms > 0
            || calls >= 2
            || (calls >= 1 && (!ends_with_call || !lco));

        if !needs_env {
            match code.pop() {
                Some(Instr::Call(f)) if lco => code.push(Instr::Execute(f)),
                Some(Instr::CallMeta { goal, params }) if lco => {
                    code.push(Instr::ExecuteMeta { goal, params })
                }
                Some(last) => {
                    code.push(last);
                    code.push(Instr::Proceed);
                }
                None => code.push(Instr::Proceed),
            }
            return code;
        }

        let mut wrapped = Vec::with_capacity(code.len() + 3);
        wrapped.push(Instr::Allocate(nperms as u8));
        match code.pop() {
            Some(Instr::Call(f)) if lco => {
                wrapped.extend(code);
                wrapped.push(Instr::Deallocate);
                wrapped.push(Instr::Execute(f));
            }
            Some(Instr::CallMeta { goal, params }) if lco => {
                wrapped.extend(code);
                wrapped.push(Instr::Deallocate);
                wrapped.push(Instr::ExecuteMeta { goal, params });
            }
            Some(last) => {
                wrapped.extend(code);
                wrapped.push(last);
                wrapped.push(Instr::Deallocate);
                wrapped.push(Instr::Proceed);
            }
            None => {
                wrapped.push(Instr::Deallocate);
                wrapped.push(Instr::Proceed);
            }
        }
        wrapped
    }
}

fn attr_pkg(compiler: &mut Compiler, term: &Term) -> Result<Sym> {
    match term {
        Term::Atom(name) => Ok(compiler.syms.intern(name)),
        other => Err(Error::AttrPackageNotAtom(other.clone())),
    }
}

/// For a `call/N` goal, the goal-position variable, if it is one.
fn meta_goal_var(goal: &Term) -> Option<&str> {
    match args_of(goal).first() {
        Some(Term::Var(name)) => Some(name),
        _ => None,
    }
}

/// Rewrite meta-call shapes: a bare variable goal becomes `call(V)`;
/// `call(f(..), ps..)` with a known goal folds the params into a plain goal.
fn normalize_goals(goals: &[Term]) -> Result<Vec<Term>> {
    let mut out = Vec::with_capacity(goals.len());
    for goal in goals {
        out.push(normalize_goal(goal)?);
    }
    Ok(out)
}

fn normalize_goal(goal: &Term) -> Result<Term> {
    match goal {
        Term::Var(name) => Ok(Term::strukt("call", vec![Term::var(name.clone())])),
        Term::Struct(name, args) if name == "call" => {
            if args.is_empty() {
                return Err(Error::MetaCallWithoutGoal);
            }
            let params = args[1..].to_vec();
            match &args[0] {
                Term::Var(_) => Ok(goal.clone()),
                Term::Atom(goal_name) => Ok(if params.is_empty() {
                    Term::atom(goal_name.clone())
                } else {
                    Term::strukt(goal_name.clone(), params)
                }),
                Term::Struct(goal_name, goal_args) => {
                    let mut folded = goal_args.clone();
                    folded.extend(params);
                    Ok(Term::strukt(goal_name.clone(), folded))
                }
            }
        }
        other => Ok(other.clone()),
    }
}

//! Clause database: predicates grouped by functor, two-level first-argument
//! indexing, and the builtin registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use derive_more::From;
use indexmap::IndexMap;

use crate::{
    cell::{Cell, Functor},
    compile::{self, CompileOpts, CompiledClause, Compiler, FirstArg},
    defs::Sym,
    mem::SymbolTable,
    syntax::{self, Clause},
    vm::{self, Vm},
};

/// A builtin receives the machine and its walked operand cells; `Ok(false)`
/// is logical failure.
pub type BuiltinFn = Arc<dyn Fn(&mut Vm, &[Cell]) -> vm::Result<bool> + Send + Sync>;

/// Shape of a call's first argument after walking, as the index sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKey {
    Unbound,
    Atom(Sym),
    Struct(Functor),
}

/// One run of clauses whose first head arguments share a kind, in source
/// order. Constant runs carry the level-two maps.
#[derive(Debug, Clone)]
enum Run {
    Vars(Vec<usize>),
    Consts {
        atoms: HashMap<Sym, Vec<usize>>,
        structs: HashMap<Functor, Vec<usize>>,
    },
}

#[derive(Debug, Clone, Default)]
struct PredIndex {
    runs: Vec<Run>,
}

impl PredIndex {
    fn build(clauses: &[CompiledClause]) -> Self {
        let mut runs: Vec<Run> = Vec::new();
        for (i, clause) in clauses.iter().enumerate() {
            match clause.first_arg {
                FirstArg::Var | FirstArg::None => match runs.last_mut() {
                    Some(Run::Vars(run)) => run.push(i),
                    _ => runs.push(Run::Vars(vec![i])),
                },
                FirstArg::Atom(sym) => {
                    if !matches!(runs.last(), Some(Run::Consts { .. })) {
                        runs.push(Run::Consts { atoms: HashMap::new(), structs: HashMap::new() });
                    }
                    if let Some(Run::Consts { atoms, .. }) = runs.last_mut() {
                        atoms.entry(sym).or_default().push(i);
                    }
                }
                FirstArg::Struct(functor) => {
                    if !matches!(runs.last(), Some(Run::Consts { .. })) {
                        runs.push(Run::Consts { atoms: HashMap::new(), structs: HashMap::new() });
                    }
                    if let Some(Run::Consts { structs, .. }) = runs.last_mut() {
                        structs.entry(functor).or_default().push(i);
                    }
                }
            }
        }
        Self { runs }
    }

    fn lookup(&self, key: CallKey, total: usize) -> Vec<usize> {
        match key {
            CallKey::Unbound => (0..total).collect(),
            CallKey::Atom(sym) => self.filtered(|run| match run {
                Run::Consts { atoms, .. } => atoms.get(&sym).cloned().unwrap_or_default(),
                Run::Vars(run) => run.clone(),
            }),
            CallKey::Struct(functor) => self.filtered(|run| match run {
                Run::Consts { structs, .. } => {
                    structs.get(&functor).cloned().unwrap_or_default()
                }
                Run::Vars(run) => run.clone(),
            }),
        }
    }

    fn filtered(&self, pick: impl Fn(&Run) -> Vec<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        for run in &self.runs {
            out.extend(pick(run));
        }
        out
    }
}

/// Ordered clauses of one functor plus their first-argument index.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    pub clauses: Vec<CompiledClause>,
    index: PredIndex,
}

impl Predicate {
    /// A one-clause predicate, as the machine holds the compiled query.
    pub(crate) fn single(clause: CompiledClause) -> Self {
        let mut pred = Predicate { clauses: vec![clause], index: PredIndex::default() };
        pred.reindex();
        pred
    }

    fn reindex(&mut self) {
        self.index = PredIndex::build(&self.clauses);
    }

    /// Source-ordered candidate clause positions for a call whose first
    /// argument walks to `key`. `None` means no first argument to index on.
    pub fn lookup(&self, key: Option<CallKey>) -> Vec<usize> {
        match key {
            None => (0..self.clauses.len()).collect(),
            Some(key) => self.index.lookup(key, self.clauses.len()),
        }
    }
}

#[derive(Debug, From)]
pub enum LoadError {
    #[from]
    Compile(compile::Error),
    Parse(Vec<chumsky::error::Simple<char>>),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Compile(err) => write!(f, "compile error: {err}"),
            LoadError::Parse(errs) => {
                write!(f, "parse error:")?;
                for err in errs {
                    write!(f, " {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// The compiled program: immutable once loaded, shared read-only between
/// machines.
pub struct Database {
    pub(crate) syms: SymbolTable,
    pub(crate) preds: IndexMap<Functor, Predicate>,
    pub(crate) builtins: HashMap<Functor, BuiltinFn>,
    builtin_names: HashSet<(String, u8)>,
    opts: CompileOpts,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        let mut db = Self {
            syms: SymbolTable::new(),
            preds: IndexMap::new(),
            builtins: HashMap::new(),
            builtin_names: HashSet::new(),
            opts: CompileOpts::default(),
        };
        crate::builtins::register_defaults(&mut db);
        db
    }

    pub fn with_opts(mut self, opts: CompileOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Register a builtin handler; goals with this name and arity compile to
    /// `builtin` instructions from then on.
    pub fn register_builtin<F>(&mut self, name: &str, arity: u8, f: F)
    where
        F: Fn(&mut Vm, &[Cell]) -> vm::Result<bool> + Send + Sync + 'static,
    {
        let functor = self.syms.intern_functor(name, arity);
        self.builtins.insert(functor, Arc::new(f));
        self.builtin_names.insert((name.to_owned(), arity));
    }

    pub(crate) fn builtin(&self, functor: Functor) -> Option<BuiltinFn> {
        self.builtins.get(&functor).cloned()
    }

    /// Compile clauses into the database, appending to existing predicates.
    pub fn load(&mut self, clauses: &[Clause]) -> compile::Result<()> {
        let mut compiled = Vec::with_capacity(clauses.len());
        {
            let mut compiler =
                Compiler::new(&mut self.syms, &self.builtin_names).with_opts(self.opts);
            for clause in clauses {
                compiled.push(compiler.compile_clause(clause)?);
            }
        }
        for clause in compiled {
            self.preds.entry(clause.functor).or_default().clauses.push(clause);
        }
        for pred in self.preds.values_mut() {
            pred.reindex();
        }
        Ok(())
    }

    pub fn load_source(&mut self, src: &str) -> Result<(), LoadError> {
        let clauses = syntax::parse_program(src).map_err(LoadError::Parse)?;
        self.load(&clauses)?;
        Ok(())
    }

    /// Compile a query against this database's symbols and builtins.
    pub(crate) fn compile_query(
        &self,
        goals: &[crate::syntax::Term],
        syms: &mut SymbolTable,
    ) -> compile::Result<(CompiledClause, Vec<String>)> {
        let mut compiler = Compiler::new(syms, &self.builtin_names).with_opts(CompileOpts {
            last_call_opt: false,
        });
        compiler.compile_query(goals)
    }

    pub fn predicate(&self, functor: Functor) -> Option<&Predicate> {
        self.preds.get(&functor)
    }

    /// Install a hand-assembled code block as a one-clause predicate.
    #[cfg(test)]
    pub(crate) fn insert_raw(
        &mut self,
        name: &str,
        arity: u8,
        nregs: usize,
        code: Vec<crate::instr::Instr>,
    ) {
        let functor = self.syms.intern_functor(name, arity);
        let clause = CompiledClause {
            functor,
            code,
            nregs,
            nperms: 0,
            first_arg: FirstArg::Var,
        };
        self.preds.insert(functor, Predicate::single(clause));
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.syms
    }

    /// Instruction listings per predicate, for the first debug snapshot.
    pub fn listings(&self) -> IndexMap<String, Vec<Vec<String>>> {
        self.preds
            .iter()
            .map(|(functor, pred)| {
                (
                    self.syms.display_functor(*functor),
                    pred.clauses.iter().map(|c| c.listing(&self.syms)).collect(),
                )
            })
            .collect()
    }
}

/// Compile a program into a fresh database.
pub fn compile(clauses: &[Clause]) -> compile::Result<Database> {
    let mut db = Database::new();
    db.load(clauses)?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn db(src: &str) -> Database {
        let mut db = Database::new();
        db.load_source(src).unwrap();
        db
    }

    fn functor(db: &Database, name: &str, arity: u8) -> Functor {
        Functor { sym: db.syms.lookup(name).unwrap(), arity }
    }

    #[test]
    fn runs_group_by_first_argument_kind() {
        // Mixed var/constant first arguments split into four runs.
        let db = db(
            "f(X, a). f(a, b). f(g(c), d). f(a, e). f(Y, f). f(Z, g). f(g(b), h).",
        );
        let f = functor(&db, "f", 2);
        let pred = db.predicate(f).unwrap();

        let a = db.syms.lookup("a").unwrap();
        let g1 = functor(&db, "g", 1);

        // Unbound first arg: every clause, source order.
        assert_eq!(pred.lookup(Some(CallKey::Unbound)), vec![0, 1, 2, 3, 4, 5, 6]);
        // Atom key: var runs interleave with the matching sublists.
        assert_eq!(pred.lookup(Some(CallKey::Atom(a))), vec![0, 1, 3, 4, 5]);
        // Struct key: only g/1 clauses plus var runs.
        assert_eq!(pred.lookup(Some(CallKey::Struct(g1))), vec![0, 2, 4, 5, 6]);
        // Unknown atom: var runs only.
        let zz = Sym::new(9999);
        assert_eq!(pred.lookup(Some(CallKey::Atom(zz))), vec![0, 4, 5]);
    }

    #[test]
    fn zero_arity_predicates_take_the_full_list() {
        let db = db("p. p.");
        let p = functor(&db, "p", 0);
        assert_eq!(db.predicate(p).unwrap().lookup(None), vec![0, 1]);
    }

    #[test]
    fn struct_key_misses_fail_fast() {
        let db = db("f(a, 1). f(g(X), 2). f(a, 10). f(b, 10).");
        let f = functor(&db, "f", 2);
        let pred = db.predicate(f).unwrap();
        let g1 = functor(&db, "g", 1);
        assert_eq!(pred.lookup(Some(CallKey::Struct(g1))), vec![1]);
        let h1 = Functor { sym: db.syms.lookup("g").unwrap(), arity: 2 };
        assert_eq!(pred.lookup(Some(CallKey::Struct(h1))), Vec::<usize>::new());
    }
}

use std::collections::BTreeMap;
use std::fmt;

use derive_more::From;

use crate::{
    cell::Functor,
    defs::Sym,
    mem::SymbolTable,
};

/// A label id, local to one code block.
pub type Lbl = usize;

/// Temporary register `Xi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct Reg(pub u8);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X{}", self.0)
    }
}

/// Permanent slot `Yi` in the current environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct Local(pub u16);

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Y{}", self.0)
    }
}

/// A compile-time-assigned location: temporary register or permanent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub enum Slot {
    #[from]
    Reg(Reg),
    #[from]
    Local(Local),
}

impl Slot {
    pub fn reg(r: impl Into<Reg>) -> Self {
        Self::Reg(r.into())
    }

    pub fn local(l: impl Into<Local>) -> Self {
        Self::Local(l.into())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Reg(reg) => write!(f, "{reg}"),
            Slot::Local(local) => write!(f, "{local}"),
        }
    }
}

/// Operand of a builtin or meta instruction: a slot, or an atom used as a
/// read-only address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From)]
pub enum Operand {
    #[from]
    Slot(Slot),
    Atom(Sym),
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Slot(reg.into())
    }
}

impl From<Local> for Operand {
    fn from(local: Local) -> Self {
        Operand::Slot(local.into())
    }
}

/// Address of one instruction in the database: predicate, clause position,
/// instruction position. Rendered `name/arity#clause[instr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrAddr {
    pub functor: Functor,
    pub clause: usize,
    pub instr: usize,
}

impl InstrAddr {
    pub fn clause_start(functor: Functor, clause: usize) -> Self {
        Self { functor, clause, instr: 0 }
    }

    pub fn next(self) -> Self {
        Self { instr: self.instr + 1, ..self }
    }
}

/// Dispatch table on the shape of the first call argument. The assoc and
/// dict arms are carried for interface completeness; no cell kind reaches
/// them in the symbolic-only data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOnTerm {
    pub if_var: Lbl,
    pub if_const: Lbl,
    pub if_struct: Lbl,
    pub if_list: Lbl,
    pub if_assoc: Option<Lbl>,
    pub if_dict: Option<Lbl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    // Get family: match head arguments against the argument registers.
    GetVariable(Reg, Slot),
    GetValue(Reg, Slot),
    GetAtom(Reg, Sym),
    GetStruct(Reg, Functor),
    GetPair(Reg),

    // Unify family: read or write the current struct's slots.
    UnifyVariable(Slot),
    UnifyValue(Slot),
    UnifyAtom(Sym),
    UnifyVoid(u8),

    // Put family: build goal arguments into the argument registers.
    PutVariable(Reg, Slot),
    PutValue(Reg, Slot),
    PutAtom(Reg, Sym),
    PutStruct(Reg, Functor),
    PutPair(Reg),

    // Control.
    Call(Functor),
    Execute(Functor),
    Proceed,
    Allocate(u8),
    Deallocate,
    TryMeElse(Lbl),
    RetryMeElse(Lbl),
    TrustMe,
    Try(Lbl),
    Retry(Lbl),
    Trust(Lbl),
    Jump(Lbl),
    Label(Lbl),

    // Indexing.
    SwitchOnTerm(SwitchOnTerm),
    SwitchOnConstant(BTreeMap<Sym, Lbl>),
    SwitchOnStruct(BTreeMap<Functor, Lbl>),

    // Builtins and meta-calls.
    Builtin { name: Sym, args: Vec<Operand> },
    InlineUnify(Operand, Operand),
    CallMeta { goal: Slot, params: Vec<Operand> },
    ExecuteMeta { goal: Slot, params: Vec<Operand> },

    // Attributed refs.
    PutAttr { pkg: Sym, addr: Slot, attr: Operand },
    GetAttr { pkg: Sym, addr: Slot, attr: Operand },
    DelAttr { pkg: Sym, addr: Slot },
    ImportPkg(Sym),
}

impl Instr {
    /// Render against a symbol table; instruction names are the snake_case
    /// of their kind, operands in declaration order.
    pub fn display<'a>(&'a self, syms: &'a SymbolTable) -> DisplayInstr<'a> {
        DisplayInstr { instr: self, syms }
    }
}

pub struct DisplayInstr<'a> {
    instr: &'a Instr,
    syms: &'a SymbolTable,
}

impl DisplayInstr<'_> {
    fn operand(&self, op: &Operand) -> String {
        match op {
            Operand::Slot(slot) => slot.to_string(),
            Operand::Atom(sym) => format!("@{}", self.syms.resolve(*sym)),
        }
    }

    fn operands(&self, ops: &[Operand]) -> String {
        ops.iter().map(|op| self.operand(op)).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for DisplayInstr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.syms;
        match self.instr {
            Instr::GetVariable(reg, slot) => write!(f, "get_var {reg}, {slot}"),
            Instr::GetValue(reg, slot) => write!(f, "get_val {reg}, {slot}"),
            Instr::GetAtom(reg, sym) => write!(f, "get_atom {reg}, {}", s.resolve(*sym)),
            Instr::GetStruct(reg, ft) => {
                write!(f, "get_struct {reg}, {}", s.display_functor(*ft))
            }
            Instr::GetPair(reg) => write!(f, "get_pair {reg}"),
            Instr::UnifyVariable(slot) => write!(f, "unify_var {slot}"),
            Instr::UnifyValue(slot) => write!(f, "unify_val {slot}"),
            Instr::UnifyAtom(sym) => write!(f, "unify_atom {}", s.resolve(*sym)),
            Instr::UnifyVoid(n) => write!(f, "unify_void {n}"),
            Instr::PutVariable(reg, slot) => write!(f, "put_var {reg}, {slot}"),
            Instr::PutValue(reg, slot) => write!(f, "put_val {reg}, {slot}"),
            Instr::PutAtom(reg, sym) => write!(f, "put_atom {reg}, {}", s.resolve(*sym)),
            Instr::PutStruct(reg, ft) => {
                write!(f, "put_struct {reg}, {}", s.display_functor(*ft))
            }
            Instr::PutPair(reg) => write!(f, "put_pair {reg}"),
            Instr::Call(ft) => write!(f, "call {}", s.display_functor(*ft)),
            Instr::Execute(ft) => write!(f, "execute {}", s.display_functor(*ft)),
            Instr::Proceed => write!(f, "proceed"),
            Instr::Allocate(n) => write!(f, "allocate {n}"),
            Instr::Deallocate => write!(f, "deallocate"),
            Instr::TryMeElse(lbl) => write!(f, "try_me_else L{lbl}"),
            Instr::RetryMeElse(lbl) => write!(f, "retry_me_else L{lbl}"),
            Instr::TrustMe => write!(f, "trust_me"),
            Instr::Try(lbl) => write!(f, "try L{lbl}"),
            Instr::Retry(lbl) => write!(f, "retry L{lbl}"),
            Instr::Trust(lbl) => write!(f, "trust L{lbl}"),
            Instr::Jump(lbl) => write!(f, "jump L{lbl}"),
            Instr::Label(lbl) => write!(f, "label L{lbl}"),
            Instr::SwitchOnTerm(sw) => {
                write!(
                    f,
                    "switch_on_term var=L{}, const=L{}, struct=L{}, list=L{}",
                    sw.if_var, sw.if_const, sw.if_struct, sw.if_list
                )?;
                if let Some(lbl) = sw.if_assoc {
                    write!(f, ", assoc=L{lbl}")?;
                }
                if let Some(lbl) = sw.if_dict {
                    write!(f, ", dict=L{lbl}")?;
                }
                Ok(())
            }
            Instr::SwitchOnConstant(table) => {
                let mut entries: Vec<_> = table
                    .iter()
                    .map(|(sym, lbl)| format!("{}: L{lbl}", s.resolve(*sym)))
                    .collect();
                entries.sort();
                write!(f, "switch_on_constant {{{}}}", entries.join(", "))
            }
            Instr::SwitchOnStruct(table) => {
                let mut entries: Vec<_> = table
                    .iter()
                    .map(|(ft, lbl)| format!("{}: L{lbl}", s.display_functor(*ft)))
                    .collect();
                entries.sort();
                write!(f, "switch_on_struct {{{}}}", entries.join(", "))
            }
            Instr::Builtin { name, args } => {
                if args.is_empty() {
                    write!(f, "{}", s.resolve(*name))
                } else {
                    write!(f, "{} {}", s.resolve(*name), self.operands(args))
                }
            }
            Instr::InlineUnify(a, b) => {
                write!(f, "inline_unify {}, {}", self.operand(a), self.operand(b))
            }
            Instr::CallMeta { goal, params } => {
                write!(f, "call_meta {goal}")?;
                for p in params {
                    write!(f, ", {}", self.operand(p))?;
                }
                Ok(())
            }
            Instr::ExecuteMeta { goal, params } => {
                write!(f, "execute_meta {goal}")?;
                for p in params {
                    write!(f, ", {}", self.operand(p))?;
                }
                Ok(())
            }
            Instr::PutAttr { pkg, addr, attr } => {
                write!(f, "put_attr {}, {addr}, {}", s.resolve(*pkg), self.operand(attr))
            }
            Instr::GetAttr { pkg, addr, attr } => {
                write!(f, "get_attr {}, {addr}, {}", s.resolve(*pkg), self.operand(attr))
            }
            Instr::DelAttr { pkg, addr } => {
                write!(f, "del_attr {}, {addr}", s.resolve(*pkg))
            }
            Instr::ImportPkg(pkg) => write!(f, "import_pkg {}", s.resolve(*pkg)),
        }
    }
}

impl fmt::Display for InstrAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The functor's name needs a symbol table; the bare form shows ids.
        write!(f, "{}/{}#{}[{}]", self.functor.sym, self.functor.arity, self.clause, self.instr)
    }
}

impl InstrAddr {
    pub fn display(&self, syms: &SymbolTable) -> String {
        format!(
            "{}/{}#{}[{}]",
            syms.resolve(self.functor.sym),
            self.functor.arity,
            self.clause,
            self.instr
        )
    }
}

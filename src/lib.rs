//! A register-machine engine for a Prolog-like logic language: a clause
//! compiler with Debray register allocation, a first-argument-indexed
//! clause database, and a depth-first backtracking interpreter with
//! trailing, attributed-variable hooks and JSONL state tracing.

pub mod attrs;
pub mod builtins;
pub mod cell;
pub mod compile;
pub mod defs;
pub mod index;
pub mod instr;
pub mod mem;
pub mod snapshot;
pub mod syntax;
pub mod unify;
pub mod vm;

pub use index::{Database, LoadError};
pub use syntax::{parse_program, parse_query, parse_term, Clause, Term};
pub use vm::{Solution, Solutions, Vm};

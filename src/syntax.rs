use std::{cell::Cell, rc::Rc};

use chumsky::prelude::*;

/// A source-level term, as delivered by the surface parser or built directly
/// by a driver. Variable identity within a clause is by name; distinct
/// clauses never share variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Atom(String),
    Var(String),
    Struct(String, Vec<Term>),
}

/// Head plus body goals; a fact when the body is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub head: Term,
    pub body: Vec<Term>,
}

impl Clause {
    pub fn fact(head: Term) -> Self {
        Self { head, body: vec![] }
    }

    pub fn rule(head: Term, body: Vec<Term>) -> Self {
        Self { head, body }
    }
}

impl Term {
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Term::Var(name.into())
    }

    pub fn strukt(name: impl Into<String>, args: Vec<Term>) -> Self {
        Term::Struct(name.into(), args)
    }

    /// Cons-cell list `[items.. | tail]` as nested `./2` structs.
    pub fn list(items: Vec<Term>, tail: Term) -> Self {
        items.into_iter().rev().fold(tail, |tail, item| {
            Term::Struct(".".to_owned(), vec![item, tail])
        })
    }

    /// Predicate name and arity when this term is callable.
    pub fn name_arity(&self) -> Option<(&str, usize)> {
        match self {
            Term::Atom(name) => Some((name, 0)),
            Term::Struct(name, args) => Some((name, args.len())),
            Term::Var(_) => None,
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Atom(name) | Term::Var(name) => write!(f, "{name}"),
            Term::Struct(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl std::fmt::Display for Clause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            write!(f, " :- ")?;
            for (i, goal) in self.body.iter().enumerate() {
                if i != 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{goal}")?;
            }
        }
        write!(f, ".")
    }
}

/// Characters a symbolic atom may be spelled from.
const SYMBOL_CHARS: &str = "+-*/\\^<>=~:.?@#&";

fn term_parser(
    fresh: Rc<Cell<usize>>,
) -> impl Parser<char, Term, Error = Simple<char>> + Clone {
    recursive(move |term| {
        let ident_tail = filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated();

        let lower_name = filter(|c: &char| c.is_alphabetic() && c.is_lowercase())
            .then(ident_tail.clone())
            .map(|(first, rest)| std::iter::once(first).chain(rest).collect::<String>());

        let digit_name = filter(|c: &char| c.is_ascii_digit())
            .repeated()
            .at_least(1)
            .collect::<String>();

        let symbol_name = one_of(SYMBOL_CHARS)
            .repeated()
            .at_least(1)
            .collect::<String>();

        let quoted_name = just('\'')
            .ignore_then(none_of("'").repeated().collect::<String>())
            .then_ignore(just('\''));

        let name = lower_name.or(digit_name).or(quoted_name).or(symbol_name);

        let args = term
            .clone()
            .separated_by(just(',').padded())
            .delimited_by(just('('), just(')'));

        let strukt = name
            .clone()
            .then(args)
            .map(|(name, args): (String, Vec<Term>)| Term::Struct(name, args));

        let var = filter(|c: &char| c.is_uppercase() || *c == '_')
            .then(ident_tail)
            .map(|(first, rest): (char, Vec<char>)| {
                std::iter::once(first).chain(rest).collect::<String>()
            })
            .map(move |name| {
                if name == "_" {
                    // Every textual `_` is a distinct fresh variable.
                    let n = fresh.get();
                    fresh.set(n + 1);
                    Term::Var(format!("_#{n}"))
                } else {
                    Term::Var(name)
                }
            });

        let list = term
            .clone()
            .separated_by(just(',').padded())
            .then(just('|').padded().ignore_then(term.clone()).or_not())
            .delimited_by(just('[').padded(), just(']'))
            .map(|(items, tail)| {
                Term::list(items, tail.unwrap_or_else(|| Term::atom("[]")))
            });

        let parens = term.delimited_by(just('(').padded(), just(')'));

        strukt
            .or(list)
            .or(var)
            .or(name.map(Term::Atom))
            .or(parens)
            .padded()
    })
}

fn goal_parser(
    fresh: Rc<Cell<usize>>,
) -> impl Parser<char, Term, Error = Simple<char>> + Clone {
    let term = term_parser(fresh);
    // Longest operators first so `\==` wins over `==` and `==` over `=`.
    let op = just("\\==")
        .or(just("=="))
        .or(just("@<"))
        .or(just("@>"))
        .or(just("="))
        .padded();
    term.clone()
        .then(op.then(term).or_not())
        .map(|(lhs, rest)| match rest {
            Some((op, rhs)) => Term::Struct(op.to_owned(), vec![lhs, rhs]),
            None => lhs,
        })
}

/// Parser for one clause: `head.` or `head :- goal, goal, ... .`
fn clause_parser(
    fresh: Rc<Cell<usize>>,
) -> impl Parser<char, Clause, Error = Simple<char>> {
    let head = term_parser(fresh.clone());
    let body = goal_parser(fresh)
        .separated_by(just(',').padded())
        .at_least(1);
    head.then(just(":-").padded().ignore_then(body).or_not())
        .then_ignore(just('.').padded())
        .map(|(head, body)| Clause {
            head,
            body: body.unwrap_or_default(),
        })
}

/// Parser for a whole program text.
pub fn program_parser() -> impl Parser<char, Vec<Clause>, Error = Simple<char>> {
    let fresh = Rc::new(Cell::new(0));
    clause_parser(fresh).repeated().then_ignore(end())
}

/// Parser for a query: comma-separated goals with an optional final `.`.
pub fn query_parser() -> impl Parser<char, Vec<Term>, Error = Simple<char>> {
    let fresh = Rc::new(Cell::new(0));
    goal_parser(fresh)
        .separated_by(just(',').padded())
        .at_least(1)
        .then_ignore(just('.').padded().or_not())
        .then_ignore(end())
}

/// Parse a single term; used all over the tests.
pub fn parse_term(src: &str) -> Result<Term, Vec<Simple<char>>> {
    let fresh = Rc::new(Cell::new(0));
    term_parser(fresh).then_ignore(end()).parse(src)
}

pub fn parse_program(src: &str) -> Result<Vec<Clause>, Vec<Simple<char>>> {
    program_parser().parse(src)
}

pub fn parse_query(src: &str) -> Result<Vec<Term>, Vec<Simple<char>>> {
    query_parser().parse(src)
}

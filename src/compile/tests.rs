use std::collections::HashSet;

use test_log::test;

use super::*;
use crate::builtins;
use crate::syntax::{parse_program, parse_query};

fn builtin_set() -> HashSet<(String, u8)> {
    builtins::default_names()
}

fn compile_one(src: &str, opts: CompileOpts) -> (CompiledClause, SymbolTable) {
    let clauses = parse_program(src).unwrap();
    let mut syms = SymbolTable::new();
    let builtins = builtin_set();
    let mut compiler = Compiler::new(&mut syms, &builtins).with_opts(opts);
    let compiled = compiler.compile_clause(&clauses[0]).unwrap();
    (compiled, syms)
}

#[track_caller]
fn check(src: &str, want: &[&str]) {
    let (compiled, syms) = compile_one(src, CompileOpts::default());
    assert_eq!(compiled.listing(&syms), want, "clause: {src}");
}

#[test]
fn list_destructuring_keeps_head_vars_in_place() {
    check(
        "member(E, [H|T]) :- member_(T, E, H).",
        &[
            "get_struct X1, ./2",
            "unify_var X2",
            "unify_var X3",
            "get_var X0, X1",
            "put_val X0, X3",
            "execute member_/3",
        ],
    );
}

#[test]
fn permanent_vars_get_frame_slots() {
    check(
        "mul(A, B, P) :- s(B1) = B, mul(A, B1, P1), add(B1, P1, P).",
        &[
            "allocate 3",
            "get_var X2, Y0",
            "put_struct X2, s/1",
            "unify_var Y1",
            "= X2, X1",
            "get_var X1, X3",
            "put_val X1, Y1",
            "put_var X2, Y2",
            "call mul/3",
            "put_val X0, Y1",
            "put_val X1, Y2",
            "put_val X2, Y0",
            "deallocate",
            "execute add/3",
        ],
    );
}

#[test]
fn doubly_nested_head_struct_reuses_register() {
    check(
        "is_even(s(s(X))) :- is_even(X).",
        &[
            "get_struct X0, s/1",
            "unify_var X0",
            "get_struct X0, s/1",
            "unify_var X0",
            "execute is_even/1",
        ],
    );
}

#[test]
fn nested_list_fact_expands_breadth_first() {
    check(
        "f([g(a), h(b)]).",
        &[
            "get_struct X0, ./2",
            "unify_var X0",
            "unify_var X1",
            "get_struct X0, g/1",
            "unify_atom a",
            "get_struct X1, ./2",
            "unify_var X0",
            "unify_atom []",
            "get_struct X0, h/1",
            "unify_atom b",
            "proceed",
        ],
    );
}

#[test]
fn builtin_operands_use_allocated_homes() {
    check(
        "p(X, f(X), Y, W) :- X = [a|Z], W @> Y, q(Z, Y, X).",
        &[
            "get_struct X1, f/1",
            "unify_val X0",
            "put_struct X1, ./2",
            "unify_atom a",
            "unify_var X4",
            "= X0, X1",
            "@> X3, X2",
            "get_var X0, X5",
            "put_val X0, X4",
            "put_val X1, X2",
            "put_val X2, X5",
            "execute q/3",
        ],
    );
}

#[test]
fn argument_rotation_moves_conflicting_vars() {
    check(
        "p(X, Y, Z, a) :- q(Z, X, Y).",
        &[
            "get_atom X3, a",
            "get_var X0, X3",
            "put_val X0, X2",
            "get_var X1, X2",
            "put_val X1, X3",
            "execute q/3",
        ],
    );
}

#[test]
fn atoms_free_their_registers_early() {
    check(
        "p(X, a, b) :- q(c, d, f(X)).",
        &[
            "get_atom X1, a",
            "get_atom X2, b",
            "get_var X0, X3",
            "put_atom X0, c",
            "put_atom X1, d",
            "put_struct X2, f/1",
            "unify_val X3",
            "execute q/3",
        ],
    );
}

#[test]
fn goal_struct_args_build_after_moves() {
    check(
        "p(X, Y, f(Z)) :- q(a, b, Z, g(X, Y)).",
        &[
            "get_struct X2, f/1",
            "unify_var X2",
            "get_var X0, X4",
            "put_atom X0, a",
            "get_var X1, X5",
            "put_atom X1, b",
            "put_struct X3, g/2",
            "unify_val X4",
            "unify_val X5",
            "execute q/4",
        ],
    );
}

#[test]
fn trailing_builtins_keep_the_environment() {
    check(
        "'f-eq'(X, Y) :- f(X, A), f(Y, B), B \\== p(a), A = B.",
        &[
            "allocate 3",
            "get_var X1, Y0",
            "put_var X1, Y1",
            "call f/2",
            "put_val X0, Y0",
            "put_var X1, Y2",
            "call f/2",
            "put_struct X0, p/1",
            "unify_atom a",
            "\\== Y2, X0",
            "= Y1, Y2",
            "deallocate",
            "proceed",
        ],
    );
}

#[test]
fn put_side_struct_args_stay_in_source_order() {
    // Write mode appends slots in emission order, so a variable ahead of
    // non-variable arguments must not be deferred.
    check(
        "mix(X) :- q(p(X, a, f(b))).",
        &[
            "get_var X0, X1",
            "put_struct X2, f/1",
            "unify_atom b",
            "put_struct X0, p/3",
            "unify_val X1",
            "unify_atom a",
            "unify_val X2",
            "execute q/1",
        ],
    );
}

#[test]
fn repeated_head_var_unifies_with_first_home() {
    check("p(X, X).", &["get_val X1, X0", "proceed"]);
}

#[test]
fn nested_singletons_become_voids() {
    check("f(g(_, _)).", &["get_struct X0, g/2", "unify_void 2", "proceed"]);
}

#[test]
fn head_variable_is_a_compile_error() {
    let clauses = parse_program("X :- foo.").unwrap();
    let mut syms = SymbolTable::new();
    let builtins = builtin_set();
    let mut compiler = Compiler::new(&mut syms, &builtins);
    assert_eq!(
        compiler.compile_clause(&clauses[0]),
        Err(Error::ClauseHeadIsVariable("X".to_owned()))
    );
}

#[test]
fn without_last_call_opt_every_call_gets_a_frame() {
    let (compiled, syms) = compile_one(
        "member(E, [H|T]) :- member_(T, E, H).",
        CompileOpts { last_call_opt: false },
    );
    assert_eq!(
        compiled.listing(&syms),
        &[
            "allocate 0",
            "get_struct X1, ./2",
            "unify_var X2",
            "unify_var X3",
            "get_var X0, X1",
            "put_val X0, X3",
            "call member_/3",
            "deallocate",
            "proceed",
        ],
    );
}

#[test]
fn queries_force_all_vars_permanent() {
    let goals = parse_query("length(L, s(s(s(0)))), member(a, L).").unwrap();
    let mut syms = SymbolTable::new();
    let builtins = builtin_set();
    let mut compiler = Compiler::new(&mut syms, &builtins);
    let (compiled, vars) = compiler.compile_query(&goals).unwrap();
    assert_eq!(vars, vec!["L".to_owned()]);
    assert_eq!(
        compiled.listing(&syms),
        &[
            "allocate 1",
            "put_var X0, Y0",
            "put_struct X3, s/1",
            "unify_atom 0",
            "put_struct X2, s/1",
            "unify_val X3",
            "put_struct X1, s/1",
            "unify_val X2",
            "call length/2",
            "put_atom X0, a",
            "put_val X1, Y0",
            "call member/2",
            "deallocate",
            "proceed",
        ],
    );
}

#[test]
fn bare_variable_goal_becomes_a_meta_call() {
    let (compiled, syms) = compile_one("do(G) :- G.", CompileOpts::default());
    assert_eq!(compiled.listing(&syms), &["execute_meta X0"]);
}

#[test]
fn meta_call_with_known_goal_folds_params() {
    check(
        "apply(X) :- call(f(a), X).",
        &["get_var X0, X1", "put_atom X0, a", "execute f/2"],
    );
}

#[test]
fn first_arg_shapes() {
    let (c, syms) = compile_one("f(g(X), Y).", CompileOpts::default());
    let g1 = syms.lookup("g").unwrap();
    assert_eq!(c.first_arg, FirstArg::Struct(Functor { sym: g1, arity: 1 }));

    let (c, syms) = compile_one("f(a, Y).", CompileOpts::default());
    assert_eq!(c.first_arg, FirstArg::Atom(syms.lookup("a").unwrap()));

    let (c, _) = compile_one("f(X, Y).", CompileOpts::default());
    assert_eq!(c.first_arg, FirstArg::Var);

    let (c, _) = compile_one("f.", CompileOpts::default());
    assert_eq!(c.first_arg, FirstArg::None);
}

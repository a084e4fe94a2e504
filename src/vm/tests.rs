use std::io::Write as _;
use std::sync::{Arc, Mutex};

use assert2::{check, let_assert};
use test_log::test;

use super::*;
use crate::{
    compile::CompileOpts,
    index::Database,
    instr::{Instr, Operand, Reg, Slot},
    syntax::{parse_query, parse_term},
};

fn db(src: &str) -> Arc<Database> {
    let mut db = Database::new();
    db.load_source(src).unwrap();
    Arc::new(db)
}

fn solutions(db: &Arc<Database>, query: &str) -> Solutions {
    let goals = parse_query(query).unwrap();
    Vm::solve(db.clone(), &goals).unwrap()
}

/// Rendered answers, one string per solution.
#[track_caller]
fn ask(db: &Arc<Database>, query: &str) -> Vec<String> {
    solutions(db, query)
        .map(|sol| sol.unwrap().to_string())
        .collect()
}

/// Replace every variable name by `_`, for answers with fresh variables.
fn anonymize(term: &Term) -> Term {
    match term {
        Term::Var(_) => Term::var("_"),
        Term::Atom(_) => term.clone(),
        Term::Struct(name, args) => {
            Term::Struct(name.clone(), args.iter().map(anonymize).collect())
        }
    }
}

#[test]
fn facts_enumerate_in_source_order() {
    let db = db("bit(0). bit(1). color(red). color(green). color(blue).");
    check!(
        ask(&db, "bit(X), color(Y).")
            == vec![
                "X = 0, Y = red",
                "X = 0, Y = green",
                "X = 0, Y = blue",
                "X = 1, Y = red",
                "X = 1, Y = green",
                "X = 1, Y = blue",
            ]
    );
}

#[test]
fn empty_intersection_has_no_answers() {
    let db = db("bit(0). bit(1). color(red). color(green). color(blue).");
    check!(ask(&db, "bit(X), color(X).").is_empty());
}

#[test]
fn subway_reachability() {
    let db = db(
        "connection(são_bento, luz).
         connection(são_bento, sé).
         connection(luz, república).
         connection(sé, anhangabaú).
         connection(anhangabaú, república).
         walk(A, B) :- connection(A, B).
         walk(A, B) :- connection(B, A).
         walk2(A, B) :- walk(A, C), walk(C, B), A \\== B.",
    );
    check!(
        ask(&db, "walk2(são_bento, X).") == vec!["X = república", "X = anhangabaú"]
    );
}

#[test]
fn failing_unification_records_intermediate_bindings() {
    let db = db("");
    let goals = parse_query("P1 = p(X, a, f(b)), P2 = p(f(Y), Y, X), P1 = P2.").unwrap();
    let mut sols = Vm::new(db, &goals).unwrap().run();
    let answers: Vec<_> = sols.by_ref().collect();
    check!(answers.is_empty());

    let seen = sols.vm().bindings_seen();
    let x = seen.iter().position(|(name, value)| name == "X" && value == "f(Y)");
    let y = seen.iter().position(|(name, value)| name == "Y" && value == "a");
    let_assert!(Some(x) = x);
    let_assert!(Some(y) = y);
    check!(x < y, "X must bind before Y: {seen:?}");
}

#[test]
fn difference_list_brackets() {
    let db = db(
        "brackets(T, T).
         brackets(.(<, L), T) :- brackets(L, .(>, T0)), brackets(T0, T).",
    );
    // <<>><>
    let balanced = "brackets(.(<, .(<, .(>, .(>, .(<, .(>, [])))))), []).";
    check!(ask(&db, balanced).len() == 1);

    let unbalanced = "brackets(.(<, .(>, .(>, []))), []).";
    check!(ask(&db, unbalanced).is_empty());
}

#[test]
fn first_argument_indexing_tries_one_clause() {
    let db = db("f(a, 1). f(g(X), 2). f(a, 10). f(b, 10).");
    let mut sols = solutions(&db, "f(g(Z), Y).");
    let answers: Vec<_> = sols.by_ref().map(|s| s.unwrap()).collect();
    check!(answers.len() == 1);
    check!(answers[0].0.get("Y") == Some(&Term::atom("2")));
    check!(matches!(answers[0].0.get("Z"), Some(Term::Var(_))));
    check!(sols.stats().clauses_considered == 1);
}

#[test]
fn member_of_built_list() {
    let db = db(
        "member(E, [H|T]) :- member_(T, E, H).
         member_(U, E, E).
         member_([H|T], E, U) :- member_(T, E, H).
         length([], 0).
         length([V|T], s(L)) :- length(T, L).",
    );
    let got: Vec<Term> = solutions(&db, "length(L, s(s(s(0)))), member(a, L).")
        .map(|sol| anonymize(sol.unwrap().0.get("L").unwrap()))
        .collect();
    let want: Vec<Term> = ["[a, _, _]", "[_, a, _]", "[_, _, a]"]
        .iter()
        .map(|src| anonymize(&parse_term(src).unwrap()))
        .collect();
    check!(got == want);
}

#[test]
fn infinite_enumeration_is_lazy() {
    let db = db("nat(0). nat(s(X)) :- nat(X).");
    let got: Vec<String> = solutions(&db, "nat(X).")
        .take(4)
        .map(|sol| sol.unwrap().to_string())
        .collect();
    check!(
        got == vec!["X = 0", "X = s(0)", "X = s(s(0))", "X = s(s(s(0)))"]
    );
}

#[test]
fn answers_are_deterministic_across_runs() {
    let db = db(
        "edge(a, b). edge(b, c). edge(a, c).
         path(X, Y) :- edge(X, Y).
         path(X, Y) :- edge(X, Z), path(Z, Y).",
    );
    let first = ask(&db, "path(a, X).");
    let second = ask(&db, "path(a, X).");
    check!(first == second);
    check!(first == vec!["X = b", "X = c", "X = c"]);
}

#[test]
fn backtracking_restores_state_pointwise() {
    let db = db("t(a). t(b).");
    let goals = parse_query("t(X).").unwrap();
    let mut vm = Vm::new(db, &goals).unwrap();

    while vm.choices.is_empty() {
        vm.step().unwrap();
    }
    let refs_at_choice = vm.mem.refs.clone();
    let envs_at_choice: Vec<Vec<Option<crate::cell::Cell>>> =
        vm.envs.iter().map(|env| env.slots.clone()).collect();
    let env_top_at_choice = vm.env_top;
    let arg0_at_choice = vm.regs[0];

    // Run to the first answer, then force a retry.
    loop {
        match vm.step().unwrap() {
            Flow::Answer(_) => break,
            Flow::Continue => {}
            Flow::Exhausted => panic!("expected an answer"),
        }
    }
    let_assert!(Flow::Continue = vm.backtrack().unwrap());

    check!(vm.mem.refs == refs_at_choice);
    check!(vm.env_top == env_top_at_choice);
    check!(vm.regs[0] == arg0_at_choice);
    let envs_now: Vec<Vec<Option<crate::cell::Cell>>> =
        vm.envs.iter().map(|env| env.slots.clone()).collect();
    check!(envs_now == envs_at_choice);
}

#[test]
fn last_call_optimization_trades_stack_for_nothing() {
    let src = "nat(z). nat(s(N)) :- nat(N).";
    let query = "nat(s(s(s(s(s(z)))))).";

    let lco = db(src);
    let mut no_lco = Database::new().with_opts(CompileOpts { last_call_opt: false });
    no_lco.load_source(src).unwrap();
    let no_lco = Arc::new(no_lco);

    let mut with_opt = solutions(&lco, query);
    let with_answers: Vec<_> = with_opt.by_ref().map(|s| s.unwrap()).collect();
    let mut without_opt = solutions(&no_lco, query);
    let without_answers: Vec<_> = without_opt.by_ref().map(|s| s.unwrap()).collect();

    check!(with_answers == without_answers);
    check!(with_opt.stats().peak_env_depth < without_opt.stats().peak_env_depth);
}

#[test]
fn step_budget_surfaces_as_an_error() {
    let db = db("loop :- loop.");
    let goals = parse_query("loop.").unwrap();
    let mut sols = Vm::new(db, &goals).unwrap().with_step_budget(100).run();
    let_assert!(Some(Err(Error::StepBudgetExceeded { budget: 100 })) = sols.next());
    check!(sols.next().is_none());
}

#[test]
fn depth_limit_surfaces_as_an_error() {
    let db = db("sink :- sink, fail.");
    let goals = parse_query("sink.").unwrap();
    let mut sols = Vm::new(db, &goals).unwrap().with_depth_limit(16).run();
    let_assert!(Some(Err(Error::DepthLimitExceeded { limit: 16 })) = sols.next());
}

#[test]
fn strict_mode_rejects_unknown_predicates() {
    let db = db("known(a).");
    let goals = parse_query("missing(a).").unwrap();

    let mut lax = Vm::new(db.clone(), &goals).unwrap().run();
    check!(lax.next().is_none());

    let mut strict = Vm::new(db, &goals).unwrap().strict().run();
    let_assert!(Some(Err(Error::UndefinedPredicate(name))) = strict.next());
    check!(name == "missing/1");
}

#[test]
fn meta_calls_dispatch_on_runtime_goals() {
    let db = db(
        "p(a). p(b).
         q(G) :- G.",
    );
    check!(ask(&db, "q(p(X)).") == vec!["X = a", "X = b"]);
    check!(ask(&db, "call(p, X).") == vec!["X = a", "X = b"]);
}

#[test]
fn unbound_meta_goal_is_an_error() {
    let db = db("q(G) :- G.");
    let goals = parse_query("q(Unbound).").unwrap();
    let mut sols = Vm::new(db, &goals).unwrap().run();
    let_assert!(Some(Err(Error::UnboundMetaGoal)) = sols.next());
}

#[test]
fn type_test_builtins() {
    let db = db("");
    check!(ask(&db, "atom(a).").len() == 1);
    check!(ask(&db, "atom(f(a)).").is_empty());
    check!(ask(&db, "var(X).").len() == 1);
    check!(ask(&db, "X = a, var(X).").is_empty());
    check!(ask(&db, "is_list([a, b]).").len() == 1);
    check!(ask(&db, "is_list([a | T]).").is_empty());
    check!(ask(&db, "a @< b, f(a) @> b, a == a, a \\== b.").len() == 1);
    check!(ask(&db, "fail.").is_empty());
}

#[test]
fn attribute_hooks_veto_bindings() {
    let db = db("");
    let goals = parse_query("put_attr(parity, X, even), X = a.").unwrap();

    let mut vm = Vm::new(db.clone(), &goals).unwrap();
    vm.register_attribute_package("parity", |vm, _id, value, _attr| {
        let accepted = match vm.mem().walk(value) {
            crate::cell::Cell::Sym(sym) => vm.mem().symbols().resolve(sym) == "a",
            _ => false,
        };
        Ok(accepted)
    });
    check!(vm.run().map(|s| s.unwrap()).count() == 1);

    let goals = parse_query("put_attr(parity, X, even), X = b.").unwrap();
    let mut vm = Vm::new(db, &goals).unwrap();
    vm.register_attribute_package("parity", |vm, _id, value, _attr| {
        let accepted = match vm.mem().walk(value) {
            crate::cell::Cell::Sym(sym) => vm.mem().symbols().resolve(sym) == "a",
            _ => false,
        };
        Ok(accepted)
    });
    check!(vm.run().map(|s| s.unwrap()).count() == 0);
}

#[test]
fn attributes_read_back_and_delete() {
    let db = db("");
    check!(
        ask(&db, "put_attr(parity, X, even), get_attr(parity, X, A).")
            == vec!["X = X, A = even"]
    );
    check!(
        ask(&db, "put_attr(parity, X, even), del_attr(parity, X), get_attr(parity, X, A).")
            .is_empty()
    );
}

#[test]
fn choice_instructions_enumerate_alternatives() {
    let mut db = Database::new();
    let (a, b, c) = {
        let syms = db_syms_of(&mut db);
        (syms.intern("a"), syms.intern("b"), syms.intern("c"))
    };
    db.insert_raw(
        "alt",
        1,
        1,
        vec![
            Instr::TryMeElse(1),
            Instr::GetAtom(Reg(0), a),
            Instr::Proceed,
            Instr::Label(1),
            Instr::RetryMeElse(2),
            Instr::GetAtom(Reg(0), b),
            Instr::Proceed,
            Instr::Label(2),
            Instr::TrustMe,
            Instr::GetAtom(Reg(0), c),
            Instr::Proceed,
        ],
    );
    let db = Arc::new(db);
    check!(ask(&db, "alt(X).") == vec!["X = a", "X = b", "X = c"]);
}

#[test]
fn switch_instructions_jump_by_shape() {
    let mut db = Database::new();
    let (variable, constant, strukt, list) = {
        let syms = db_syms_of(&mut db);
        (
            syms.intern("variable"),
            syms.intern("constant"),
            syms.intern("strukt"),
            syms.intern("list"),
        )
    };
    db.insert_raw(
        "kind",
        2,
        2,
        vec![
            Instr::SwitchOnTerm(crate::instr::SwitchOnTerm {
                if_var: 0,
                if_const: 1,
                if_struct: 2,
                if_list: 3,
                if_assoc: None,
                if_dict: None,
            }),
            Instr::Label(0),
            Instr::GetAtom(Reg(1), variable),
            Instr::Proceed,
            Instr::Label(1),
            Instr::Jump(4),
            Instr::Label(2),
            Instr::GetAtom(Reg(1), strukt),
            Instr::Proceed,
            Instr::Label(3),
            Instr::GetAtom(Reg(1), list),
            Instr::Proceed,
            Instr::Label(4),
            Instr::GetAtom(Reg(1), constant),
            Instr::Proceed,
        ],
    );
    let db = Arc::new(db);
    check!(ask(&db, "kind(Z, K).") == vec!["Z = Z, K = variable"]);
    check!(ask(&db, "kind(a, K).") == vec!["K = constant"]);
    check!(ask(&db, "kind(f(a), K).") == vec!["K = strukt"]);
    check!(ask(&db, "kind([a], K).") == vec!["K = list"]);
}

#[test]
fn constant_switch_selects_or_fails() {
    let mut db = Database::new();
    let (red, green, one, two) = {
        let syms = db_syms_of(&mut db);
        (
            syms.intern("red"),
            syms.intern("green"),
            syms.intern("one"),
            syms.intern("two"),
        )
    };
    let table = [(red, 1usize), (green, 2usize)].into_iter().collect();
    db.insert_raw(
        "sw",
        2,
        2,
        vec![
            Instr::SwitchOnConstant(table),
            Instr::Label(1),
            Instr::GetAtom(Reg(1), one),
            Instr::Proceed,
            Instr::Label(2),
            Instr::GetAtom(Reg(1), two),
            Instr::Proceed,
        ],
    );
    let db = Arc::new(db);
    check!(ask(&db, "sw(red, Y).") == vec!["Y = one"]);
    check!(ask(&db, "sw(green, Y).") == vec!["Y = two"]);
    check!(ask(&db, "sw(blue, Y).").is_empty());
}

#[test]
fn pair_instructions_mirror_cons_structs() {
    let mut db = Database::new();
    db.insert_raw(
        "pair",
        1,
        1,
        vec![Instr::GetPair(Reg(0)), Instr::UnifyVoid(2), Instr::Proceed],
    );
    let nil = {
        let syms = db_syms_of(&mut db);
        syms.intern("[]")
    };
    db.insert_raw(
        "mk",
        2,
        3,
        vec![
            Instr::PutPair(Reg(2)),
            Instr::UnifyValue(Slot::reg(Reg(0))),
            Instr::UnifyAtom(nil),
            Instr::InlineUnify(
                Operand::Slot(Slot::reg(Reg(1))),
                Operand::Slot(Slot::reg(Reg(2))),
            ),
            Instr::Proceed,
        ],
    );
    let db = Arc::new(db);
    check!(ask(&db, "pair([a, b]).").len() == 1);
    check!(ask(&db, "pair(a).").is_empty());
    check!(ask(&db, "mk(a, P).") == vec!["P = .(a, [])"]);
}

#[test]
fn snapshots_stream_one_record_per_step() {
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let db = db("bit(0). bit(1).");
    let goals = parse_query("bit(X), X == 1.").unwrap();
    let buf = SharedBuf::default();
    let vm = Vm::new(db, &goals)
        .unwrap()
        .with_trace(Box::new(buf.clone()));
    let answers: Vec<_> = vm.run().map(|s| s.unwrap()).collect();
    check!(answers.len() == 1);

    let bytes = buf.0.lock().unwrap().clone();
    let text = String::from_utf8(bytes).unwrap();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    check!(!records.is_empty());
    check!(records[0].get("Clauses").is_some());
    check!(records[1].get("Clauses").is_none());
    for record in &records {
        check!(record.get("Mode").is_some());
        check!(record.get("CodePtr").and_then(|c| c.get("Ref")).is_some());
        check!(record.get("Backtrack").is_some());
    }
    // The X == 1 check fails for X = 0 and triggers a backtrack step.
    check!(records.iter().any(|r| r["Backtrack"] == serde_json::Value::Bool(true)));
}

// Helpers for hand-assembled tests; the database owns the interner.
fn db_syms_of(db: &mut Database) -> &mut crate::mem::SymbolTable {
    &mut db.syms
}

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use owo_colors::OwoColorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow::{parse_query, Database, Vm};

const USAGE: &str = "usage: burrow PROGRAM QUERY [--trace FILE] [--max N] [--steps N] [--strict]";

struct Args {
    program: String,
    query: String,
    trace: Option<String>,
    max_answers: Option<usize>,
    step_budget: Option<u64>,
    strict: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut trace = None;
    let mut max_answers = None;
    let mut step_budget = None;
    let mut strict = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--trace" => {
                trace = Some(args.next().ok_or("--trace needs a file argument")?);
            }
            "--max" => {
                let n = args.next().ok_or("--max needs a number")?;
                max_answers = Some(n.parse().map_err(|_| format!("bad --max value: {n}"))?);
            }
            "--steps" => {
                let n = args.next().ok_or("--steps needs a number")?;
                step_budget = Some(n.parse().map_err(|_| format!("bad --steps value: {n}"))?);
            }
            "--strict" => strict = true,
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let program = positional.next().ok_or(USAGE)?;
    let query = positional.next().ok_or(USAGE)?;
    Ok(Args { program, query, trace, max_answers, step_budget, strict })
}

fn run(args: Args) -> Result<usize, String> {
    let source = fs::read_to_string(&args.program)
        .map_err(|err| format!("{}: {err}", args.program))?;

    let mut db = Database::new();
    db.load_source(&source).map_err(|err| err.to_string())?;
    let db = Arc::new(db);

    let goals = parse_query(&args.query).map_err(|errs| {
        errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
    })?;

    let mut vm = Vm::new(db, &goals).map_err(|err| err.to_string())?;
    if let Some(path) = &args.trace {
        let sink = fs::File::create(path).map_err(|err| format!("{path}: {err}"))?;
        vm = vm.with_trace(Box::new(sink));
    }
    if let Some(budget) = args.step_budget {
        vm = vm.with_step_budget(budget);
    }
    if args.strict {
        vm = vm.strict();
    }

    let mut count = 0usize;
    for solution in vm.run() {
        let solution = solution.map_err(|err| err.to_string())?;
        println!("{}", solution.to_string().green());
        count += 1;
        if args.max_answers.is_some_and(|max| count >= max) {
            break;
        }
    }
    Ok(count)
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_env("LOG_LEVEL"))
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{}", err.red());
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(0) => {
            println!("{}", "no".yellow());
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.red());
            ExitCode::FAILURE
        }
    }
}

//! Per-step machine state records, serialized as JSON Lines when tracing
//! is enabled. Cells render as display strings; instruction addresses as
//! `name/arity#clause[instr]`.

use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    cell::Cell,
    instr::InstrAddr,
    unify::TrailEntry,
    vm::Vm,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Record {
    pub mode: String,
    pub continuation: Option<String>,
    pub complex_arg: Option<ComplexArgRecord>,
    pub code_ptr: CodePtrRecord,
    pub reg: Vec<Option<String>>,
    /// The full instruction table; present on the first record only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clauses: Option<IndexMap<String, Vec<Vec<String>>>>,
    pub envs: Vec<EnvRecord>,
    pub env_pos: Option<usize>,
    pub choice_points: Vec<ChoicePointRecord>,
    pub choice_pos: Option<usize>,
    pub unif_frames: Vec<UnifFrameRecord>,
    pub attributes: Vec<AttributeRecord>,
    pub backtrack: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComplexArgRecord {
    pub mode: String,
    pub index: usize,
    pub cell: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CodePtrRecord {
    pub clause_pos: usize,
    pub pos: usize,
    #[serde(rename = "Ref")]
    pub addr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnvRecord {
    pub prev_pos: Option<usize>,
    pub continuation: Option<String>,
    pub permanent_vars: Vec<Option<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoicePointRecord {
    pub prev_pos: Option<usize>,
    pub next_alternative: Option<String>,
    pub continuation: Option<String>,
    pub env_pos: Option<usize>,
    pub args: Vec<Option<String>>,
    pub trail: Vec<TrailRecord>,
    pub attributes: Vec<AttributeRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrailRecord {
    pub id: u32,
    pub term: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnifFrameRecord {
    pub attributed_ref: String,
    pub binding_value: String,
    pub bindings: Vec<BindingRecord>,
    pub attributes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindingRecord {
    #[serde(rename = "Ref")]
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeRecord {
    pub id: u32,
    pub attribute: String,
    pub value: String,
}

fn cell(vm: &Vm, cell: Option<Cell>) -> Option<String> {
    cell.map(|c| vm.mem.display_cell(c).to_string())
}

fn addr(vm: &Vm, addr: Option<InstrAddr>) -> Option<String> {
    addr.map(|a| a.display(vm.mem.symbols()))
}

fn attributes_of(vm: &Vm) -> Vec<AttributeRecord> {
    vm.attrs
        .iter()
        .map(|(id, pkg, value)| AttributeRecord {
            id: id.usize() as u32,
            attribute: vm.mem.symbols().resolve(pkg).to_owned(),
            value: vm.mem.display_cell(value).to_string(),
        })
        .collect()
}

pub(crate) fn record(vm: &Vm, executed: InstrAddr) -> Record {
    let complex_arg = vm.complex.map(|c| ComplexArgRecord {
        mode: vm.mode.to_string(),
        index: c.index,
        cell: vm.mem.display_cell(Cell::Rcd(c.rcd)).to_string(),
    });

    let envs = vm
        .envs
        .iter()
        .map(|env| EnvRecord {
            prev_pos: env.prev,
            continuation: addr(vm, env.continuation),
            permanent_vars: env.slots.iter().map(|&slot| cell(vm, slot)).collect(),
        })
        .collect();

    let choice_points = vm
        .choices
        .iter()
        .map(|choice| ChoicePointRecord {
            prev_pos: choice.prev,
            next_alternative: choice
                .alternatives
                .get(choice.next_alt)
                .map(|a| a.display(vm.mem.symbols())),
            continuation: addr(vm, choice.continuation),
            env_pos: choice.env,
            args: choice.saved_args.iter().map(|&arg| cell(vm, arg)).collect(),
            trail: choice
                .trail
                .iter()
                .filter_map(|entry| match entry {
                    TrailEntry::Bind(id) => Some(TrailRecord {
                        id: id.usize() as u32,
                        term: cell(vm, vm.mem.ref_value(*id)),
                    }),
                    TrailEntry::EnvSlot { .. } => None,
                })
                .collect(),
            attributes: attributes_of(vm),
        })
        .collect();

    let unif_frames = vm
        .frames
        .iter()
        .map(|frame| UnifFrameRecord {
            attributed_ref: vm.mem.display_name_of(frame.attributed_ref),
            binding_value: vm.mem.display_cell(frame.binding_value).to_string(),
            bindings: frame
                .bindings
                .iter()
                .map(|(name, value)| BindingRecord {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            attributes: frame
                .attributes
                .iter()
                .map(|&(pkg, value)| {
                    format!(
                        "{}:{}",
                        vm.mem.symbols().resolve(pkg),
                        vm.mem.display_cell(value)
                    )
                })
                .collect(),
        })
        .collect();

    Record {
        mode: vm.mode.to_string(),
        continuation: addr(vm, vm.continuation),
        complex_arg,
        code_ptr: CodePtrRecord {
            clause_pos: executed.clause,
            pos: executed.instr,
            addr: executed.display(vm.mem.symbols()),
        },
        reg: vm.regs.iter().map(|&r| cell(vm, r)).collect(),
        clauses: if vm.trace_sent_clauses {
            None
        } else {
            Some(vm.db.listings())
        },
        envs,
        env_pos: vm.env_top,
        choice_points,
        choice_pos: vm.choice_top,
        unif_frames,
        attributes: attributes_of(vm),
        backtrack: vm.backtracked,
    }
}

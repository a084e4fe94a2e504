use derive_more::From;

/// Interned symbol. Resolves to its text through a
/// [`SymbolTable`](crate::mem::SymbolTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct Sym(u32);

impl Sym {
    pub fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    pub fn usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Sym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Id of a runtime logic variable. Ids increase monotonically over a machine
/// run; the trail and the younger-binds-to-older rule rely on that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct RefId(u32);

impl RefId {
    pub fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    pub fn usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "_{}", self.0)
    }
}

/// Id of a struct record in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct RcdId(u32);

impl RcdId {
    pub fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    pub fn usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RcdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Position of an environment frame in the machine's frame arena.
pub type EnvId = usize;

/// Position of a choice point in the machine's choice arena.
pub type ChoiceId = usize;

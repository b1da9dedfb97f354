//! Machine configuration.

use crate::pager::Pgno;

/// Options carried by a `Machine` for its whole lifetime. Separated from
/// `Machine` itself so construction reads like a small, inspectable
/// defaults struct rather than a long positional constructor.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// The root page `IdxInsert` writes to. Earlier dispatchers
    /// hard-coded this to page 2; here it is ordinary configuration,
    /// still defaulting to page 2 for compatibility.
    pub index_root_page: Pgno,
    /// Guards against a program that never reaches `Halt` or a
    /// `ResultRow`: a runaway-loop guard on the number of instructions
    /// a single `step` call may execute.
    pub max_instructions: u64,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions { index_root_page: 2, max_instructions: 100_000 }
    }
}

//! A register-based database machine: executes compiled query programs
//! (sequences of opcodes, see [`program`]) over a small on-disk B-tree
//! file, producing result rows or mutating tables and indexes.
//!
//! The machine itself ([`machine::Machine`]) is the focus of this crate.
//! [`pager`] and [`btree`] provide just enough storage underneath it to be
//! a runnable crate -- a single-leaf-page B-tree with no splitting, no
//! overflow pages, no WAL.

pub mod btree;
pub mod cellindex;
pub mod config;
pub mod cursor;
pub mod error;
pub mod machine;
pub mod pager;
pub mod program;
pub mod record;
pub mod schema;
pub mod value;

pub use config::MachineOptions;
pub use error::{Error, ErrorCode, Result};
pub use machine::{Machine, StepResult};
pub use program::{Opcode, Program, ProgramBuilder};
pub use value::Value;

//! The flattened cell index: a precomputed, key-ordered view over every
//! leaf cell in the file, grouped by owning page.
//!
//! This stands in for real recursive B-tree traversal:
//! `Rewind`/`Next`/`Prev`/`Seek*` all walk this flat sequence rather than
//! descending a tree. It is built once, at
//! machine construction, from every table-leaf and index-leaf page in the
//! file; inserts made by a running machine are not reflected in its own
//! index (a fresh machine picks them up).

use std::collections::HashMap;

use crate::btree::{Btree, Cell};
use crate::error::{Error, ErrorCode, Result};
use crate::pager::Pgno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Table,
    Index,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub cell: Cell,
    pub kind: CellKind,
}

/// Where one page's run of cells lives within the flat sequence.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize,
    count: usize,
}

pub struct CellIndex {
    entries: Vec<Entry>,
    runs: HashMap<Pgno, Run>,
}

impl CellIndex {
    /// Scan every table-leaf and index-leaf page in `btree` and build the
    /// flattened sequence. Page 1 (the file header page) never shows up
    /// as a leaf of either kind, so no explicit skip is needed here beyond
    /// what `Btree::table_leaves`/`index_leaves` already do.
    pub fn build(btree: &mut Btree) -> Result<Self> {
        let mut entries = Vec::new();
        let mut runs = HashMap::new();

        for (pgno, cells) in btree.table_leaves()? {
            let start = entries.len();
            let count = cells.len();
            entries.extend(cells.into_iter().map(|cell| Entry { cell, kind: CellKind::Table }));
            runs.insert(pgno, Run { start, count });
        }
        for (pgno, cells) in btree.index_leaves()? {
            let start = entries.len();
            let count = cells.len();
            entries.extend(cells.into_iter().map(|cell| Entry { cell, kind: CellKind::Index }));
            runs.insert(pgno, Run { start, count });
        }

        tracing::debug!(cells = entries.len(), pages = runs.len(), "built cell index");
        Ok(CellIndex { entries, runs })
    }

    /// The `(start_offset, cell_count, kind)` for the page bound to a cursor.
    pub fn run_for(&self, pgno: Pgno) -> Option<(usize, usize, CellKind)> {
        self.runs.get(&pgno).map(|r| {
            let kind = self.entries.get(r.start).map(|e| e.kind).unwrap_or(CellKind::Table);
            (r.start, r.count, kind)
        })
    }

    pub fn entry(&self, position: usize) -> Result<&Entry> {
        self.entries.get(position).ok_or_else(|| Error::new(ErrorCode::NotFound))
    }

    pub fn cell(&self, position: usize) -> Result<&Cell> {
        Ok(&self.entry(position)?.cell)
    }
}

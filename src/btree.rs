//! A deliberately small table/index B-tree.
//!
//! Every table and index here is a single leaf page -- there is no page
//! splitting, no interior nodes, no overflow payloads. A production B-tree
//! is an external collaborator this workspace doesn't otherwise provide,
//! and the machine's opcode semantics are what this crate exists to get
//! right, not tree balancing. The page-header byte layout (flag byte,
//! freeblock pointer, cell count, cell-content offset, cell pointer array)
//! follows standard `MemPage`/`CellInfo` parsing conventions.

use crate::error::{Error, ErrorCode, Result};
use crate::pager::{Pager, Pgno};
use crate::record;
use crate::value::Value;

/// Page-header type byte. Leaf-only; this crate never writes an interior
/// page, but the byte still distinguishes table cells (integer key plus
/// payload) from index cells (index key plus a one-field `keyPk` payload).
const PAGE_TYPE_TABLE_LEAF: u8 = 0x0D;
const PAGE_TYPE_INDEX_LEAF: u8 = 0x0A;

const HEADER_SIZE: usize = 8;

/// A single decoded leaf cell: a B-tree key plus its payload bytes.
///
/// For a table-leaf cell the payload is a packed record (the primary-key
/// column present as `Value::Null`, per the primary-key-in-key
/// convention). For an index-leaf cell the payload is a packed
/// single-field record holding the `keyPk`, and `key` is the index key.
#[derive(Debug, Clone)]
pub struct Cell {
    pub key: i32,
    pub payload: Vec<u8>,
}

impl Cell {
    /// The `keyPk` carried by an index-leaf cell's payload.
    pub fn index_pk(&self) -> Result<i32> {
        let fields = record::unpack(&self.payload)?;
        match fields.first() {
            Some(Value::Int(pk)) => Ok(*pk),
            _ => Err(Error::with_message(ErrorCode::TypeMismatch, "index cell payload is not a single Int")),
        }
    }
}

struct MemPage {
    pgno: Pgno,
    page_type: u8,
    cells: Vec<Cell>,
    cell_content_offset: u16,
}

impl MemPage {
    fn is_table_leaf(&self) -> bool {
        self.page_type == PAGE_TYPE_TABLE_LEAF
    }

    fn is_index_leaf(&self) -> bool {
        self.page_type == PAGE_TYPE_INDEX_LEAF
    }

    fn parse(pgno: Pgno, bytes: &[u8]) -> Result<Self> {
        let page_type = bytes[0];
        let n_cell = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        let cell_content_offset = u16::from_be_bytes([bytes[5], bytes[6]]);
        let mut cells = Vec::with_capacity(n_cell);
        for i in 0..n_cell {
            let ptr_off = HEADER_SIZE + i * 2;
            let cell_off = u16::from_be_bytes([bytes[ptr_off], bytes[ptr_off + 1]]) as usize;
            cells.push(Self::parse_cell(bytes, cell_off)?);
        }
        Ok(MemPage { pgno, page_type, cells, cell_content_offset })
    }

    fn parse_cell(bytes: &[u8], offset: usize) -> Result<Cell> {
        let payload_size = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let key = i32::from_be_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let payload = bytes[offset + 8..offset + 8 + payload_size].to_vec();
        Ok(Cell { key, payload })
    }

    fn empty(pgno: Pgno, page_type: u8, page_size: usize) -> Self {
        MemPage { pgno, page_type, cells: Vec::new(), cell_content_offset: page_size as u16 }
    }

    fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        page[0] = self.page_type;
        page[3..5].copy_from_slice(&(self.cells.len() as u16).to_be_bytes());
        page[5..7].copy_from_slice(&self.cell_content_offset.to_be_bytes());

        let mut write_at = page_size;
        let mut ptrs = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let cell_bytes = Self::encode_cell(cell);
            write_at -= cell_bytes.len();
            page[write_at..write_at + cell_bytes.len()].copy_from_slice(&cell_bytes);
            ptrs.push(write_at as u16);
        }
        for (i, ptr) in ptrs.iter().enumerate() {
            let ptr_off = HEADER_SIZE + i * 2;
            page[ptr_off..ptr_off + 2].copy_from_slice(&ptr.to_be_bytes());
        }
        page
    }

    fn encode_cell(cell: &Cell) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + cell.payload.len());
        out.extend_from_slice(&(cell.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&cell.key.to_be_bytes());
        out.extend_from_slice(&cell.payload);
        out
    }

    fn free_space(&self, page_size: usize) -> usize {
        let used_by_cells: usize = self.cells.iter().map(|c| 8 + c.payload.len()).sum();
        let used_by_ptrs = HEADER_SIZE + self.cells.len() * 2;
        page_size.saturating_sub(used_by_cells + used_by_ptrs)
    }
}

/// A table or index root page's handle into the B-tree.
pub struct Btree {
    pager: Pager,
}

impl Btree {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Btree { pager: Pager::open(path)? })
    }

    /// Allocate a new, empty table and return its root page.
    pub fn create_table(&mut self) -> Result<Pgno> {
        let pgno = self.pager.allocate_page()?;
        let page = MemPage::empty(pgno, PAGE_TYPE_TABLE_LEAF, self.pager.page_size());
        self.pager.write_page(pgno, &page.serialize(self.pager.page_size()))?;
        Ok(pgno)
    }

    /// Allocate a new, empty index and return its root page.
    pub fn create_index(&mut self) -> Result<Pgno> {
        let pgno = self.pager.allocate_page()?;
        let page = MemPage::empty(pgno, PAGE_TYPE_INDEX_LEAF, self.pager.page_size());
        self.pager.write_page(pgno, &page.serialize(self.pager.page_size()))?;
        Ok(pgno)
    }

    /// Every table-leaf page in the file (page 1, the file header page, is
    /// never a leaf and is always skipped), each with its cells sorted by
    /// key -- this is the "key-ordered" input the cell index assumes.
    pub fn table_leaves(&mut self) -> Result<Vec<(Pgno, Vec<Cell>)>> {
        self.leaves_of_type(PAGE_TYPE_TABLE_LEAF)
    }

    /// Every index-leaf page in the file, cells sorted by index key.
    pub fn index_leaves(&mut self) -> Result<Vec<(Pgno, Vec<Cell>)>> {
        self.leaves_of_type(PAGE_TYPE_INDEX_LEAF)
    }

    fn leaves_of_type(&mut self, page_type: u8) -> Result<Vec<(Pgno, Vec<Cell>)>> {
        let page_count = self.pager.page_count();
        let mut out = Vec::new();
        for pgno in 2..=page_count {
            let bytes = self.pager.read_page(pgno)?.to_vec();
            let page = MemPage::parse(pgno, &bytes)?;
            if page.page_type == page_type {
                let mut cells = page.cells;
                cells.sort_by_key(|c| c.key);
                out.push((pgno, cells));
            }
        }
        Ok(out)
    }

    /// Insert a table-leaf cell (packed record payload, primary-key field
    /// already replaced with Null by the caller -- see
    /// [`crate::machine::Machine`]'s `Insert` handler).
    pub fn insert_table_cell(&mut self, root_page: Pgno, key: i32, payload: Vec<u8>) -> Result<()> {
        self.insert_cell(root_page, PAGE_TYPE_TABLE_LEAF, Cell { key, payload })
    }

    /// Insert an index-leaf cell: `index_key` becomes the cell's B-tree
    /// key, `pk` is packed as the cell's single-field payload.
    pub fn insert_index_cell(&mut self, root_page: Pgno, index_key: i32, pk: i32) -> Result<()> {
        let payload = record::pack(&[Value::Int(pk)])?;
        self.insert_cell(root_page, PAGE_TYPE_INDEX_LEAF, Cell { key: index_key, payload })
    }

    fn insert_cell(&mut self, root_page: Pgno, expected_type: u8, cell: Cell) -> Result<()> {
        let bytes = self.pager.read_page(root_page)?.to_vec();
        let mut page = MemPage::parse(root_page, &bytes)?;
        if page.page_type != expected_type {
            return Err(Error::with_message(ErrorCode::TypeMismatch, "root page is not the expected leaf type"));
        }
        let needed = 8 + cell.payload.len() + 2;
        if needed > page.free_space(self.pager.page_size()) {
            return Err(Error::with_message(
                ErrorCode::OutOfMemory,
                "leaf page full; splitting is out of scope for this B-tree",
            ));
        }
        page.cells.push(cell);
        let serialized = page.serialize(self.pager.page_size());
        self.pager.write_page(root_page, &serialized)?;
        tracing::debug!(root_page, n_cell = page.cells.len(), "inserted b-tree cell");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_then_insert_then_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut bt = Btree::open(dir.path().join("t.db")).unwrap();
        let root = bt.create_table().unwrap();
        bt.insert_table_cell(root, 1, record::pack(&[Value::Null, Value::text(b"a".to_vec())]).unwrap()).unwrap();
        bt.insert_table_cell(root, 2, record::pack(&[Value::Null, Value::text(b"b".to_vec())]).unwrap()).unwrap();

        let leaves = bt.table_leaves().unwrap();
        assert_eq!(leaves.len(), 1);
        let (pgno, cells) = &leaves[0];
        assert_eq!(*pgno, root);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].key, 1);
        assert_eq!(cells[1].key, 2);
    }

    #[test]
    fn index_cell_round_trips_pk() {
        let dir = tempfile::tempdir().unwrap();
        let mut bt = Btree::open(dir.path().join("i.db")).unwrap();
        let root = bt.create_index().unwrap();
        bt.insert_index_cell(root, 42, 7).unwrap();
        let leaves = bt.index_leaves().unwrap();
        assert_eq!(leaves[0].1[0].key, 42);
        assert_eq!(leaves[0].1[0].index_pk().unwrap(), 7);
    }

    #[test]
    fn full_page_reports_out_of_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut bt = Btree::open(dir.path().join("f.db")).unwrap();
        let root = bt.create_table().unwrap();
        let big = vec![0u8; 4096];
        let err = bt.insert_table_cell(root, 1, big).unwrap_err();
        assert_eq!(err.code, ErrorCode::OutOfMemory);
    }
}

//! Instructions and the program they form.

/// The opcode set the machine executes; see each `ProgramBuilder` method
/// below for the p1..p4 contract of the opcode it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    OpenRead,
    OpenWrite,
    Close,
    Rewind,
    Next,
    Prev,
    Seek,
    SeekGt,
    SeekGe,
    Column,
    Key,
    Integer,
    String,
    Null,
    ResultRow,
    MakeRecord,
    Insert,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IdxGt,
    IdxGe,
    IdxLt,
    IdxLe,
    IdxKey,
    IdxInsert,
    SCopy,
    Halt,
}

/// The fourth, rarely-used operand: only `String` and `Halt` carry one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum P4 {
    #[default]
    None,
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: i32,
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: P4,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, id: i32) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

/// Appends instructions in order, assigning each its insertion index as a
/// stable id usable as a jump target. One method per opcode, named after
/// what it does rather than after the enum variant it emits.
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> i32 {
        let id = self.program.instructions.len() as i32;
        self.program.instructions.push(Instruction { id, opcode, p1, p2, p3, p4 });
        id
    }

    pub fn open_read(&mut self, cursor: i32, page_reg: i32, ncols: i32) -> i32 {
        self.push(Opcode::OpenRead, cursor, page_reg, ncols, P4::None)
    }

    pub fn open_write(&mut self, cursor: i32, page_reg: i32, ncols: i32) -> i32 {
        self.push(Opcode::OpenWrite, cursor, page_reg, ncols, P4::None)
    }

    pub fn close(&mut self, cursor: i32) -> i32 {
        self.push(Opcode::Close, cursor, 0, 0, P4::None)
    }

    pub fn rewind(&mut self, cursor: i32, target: i32) -> i32 {
        self.push(Opcode::Rewind, cursor, target, 0, P4::None)
    }

    pub fn next(&mut self, cursor: i32, target: i32) -> i32 {
        self.push(Opcode::Next, cursor, target, 0, P4::None)
    }

    pub fn prev(&mut self, cursor: i32, target: i32) -> i32 {
        self.push(Opcode::Prev, cursor, target, 0, P4::None)
    }

    pub fn seek(&mut self, cursor: i32, target: i32, key: i32) -> i32 {
        self.push(Opcode::Seek, cursor, target, key, P4::None)
    }

    pub fn seek_gt(&mut self, cursor: i32, target: i32, key: i32) -> i32 {
        self.push(Opcode::SeekGt, cursor, target, key, P4::None)
    }

    pub fn seek_ge(&mut self, cursor: i32, target: i32, key: i32) -> i32 {
        self.push(Opcode::SeekGe, cursor, target, key, P4::None)
    }

    pub fn column(&mut self, cursor: i32, col_num: i32, dest_reg: i32) -> i32 {
        self.push(Opcode::Column, cursor, col_num, dest_reg, P4::None)
    }

    pub fn key(&mut self, cursor: i32, dest_reg: i32) -> i32 {
        self.push(Opcode::Key, cursor, dest_reg, 0, P4::None)
    }

    pub fn integer(&mut self, value: i32, dest_reg: i32) -> i32 {
        self.push(Opcode::Integer, value, dest_reg, 0, P4::None)
    }

    pub fn string(&mut self, bytes: impl Into<Vec<u8>>, dest_reg: i32) -> i32 {
        let bytes = bytes.into();
        let len = bytes.len() as i32;
        self.push(Opcode::String, len, dest_reg, 0, P4::Bytes(bytes))
    }

    pub fn null(&mut self, dest_reg: i32) -> i32 {
        self.push(Opcode::Null, 0, dest_reg, 0, P4::None)
    }

    pub fn result_row(&mut self, first_reg: i32, ncols: i32) -> i32 {
        self.push(Opcode::ResultRow, first_reg, ncols, 0, P4::None)
    }

    pub fn make_record(&mut self, first_reg: i32, ncols: i32, dest_reg: i32) -> i32 {
        self.push(Opcode::MakeRecord, first_reg, ncols, dest_reg, P4::None)
    }

    pub fn insert(&mut self, cursor: i32, record_reg: i32, key_reg: i32) -> i32 {
        self.push(Opcode::Insert, cursor, record_reg, key_reg, P4::None)
    }

    pub fn eq(&mut self, reg_a: i32, target: i32, reg_b: i32) -> i32 {
        self.push(Opcode::Eq, reg_a, target, reg_b, P4::None)
    }

    pub fn ne(&mut self, reg_a: i32, target: i32, reg_b: i32) -> i32 {
        self.push(Opcode::Ne, reg_a, target, reg_b, P4::None)
    }

    pub fn lt(&mut self, reg_a: i32, target: i32, reg_b: i32) -> i32 {
        self.push(Opcode::Lt, reg_a, target, reg_b, P4::None)
    }

    pub fn le(&mut self, reg_a: i32, target: i32, reg_b: i32) -> i32 {
        self.push(Opcode::Le, reg_a, target, reg_b, P4::None)
    }

    pub fn gt(&mut self, reg_a: i32, target: i32, reg_b: i32) -> i32 {
        self.push(Opcode::Gt, reg_a, target, reg_b, P4::None)
    }

    pub fn ge(&mut self, reg_a: i32, target: i32, reg_b: i32) -> i32 {
        self.push(Opcode::Ge, reg_a, target, reg_b, P4::None)
    }

    pub fn idx_gt(&mut self, cursor: i32, target: i32, key_reg: i32) -> i32 {
        self.push(Opcode::IdxGt, cursor, target, key_reg, P4::None)
    }

    pub fn idx_ge(&mut self, cursor: i32, target: i32, key_reg: i32) -> i32 {
        self.push(Opcode::IdxGe, cursor, target, key_reg, P4::None)
    }

    pub fn idx_lt(&mut self, cursor: i32, target: i32, key_reg: i32) -> i32 {
        self.push(Opcode::IdxLt, cursor, target, key_reg, P4::None)
    }

    pub fn idx_le(&mut self, cursor: i32, target: i32, key_reg: i32) -> i32 {
        self.push(Opcode::IdxLe, cursor, target, key_reg, P4::None)
    }

    pub fn idx_key(&mut self, cursor: i32, dest_reg: i32) -> i32 {
        self.push(Opcode::IdxKey, cursor, dest_reg, 0, P4::None)
    }

    pub fn idx_insert(&mut self, cursor: i32, index_key_reg: i32, pk_reg: i32) -> i32 {
        self.push(Opcode::IdxInsert, cursor, index_key_reg, pk_reg, P4::None)
    }

    pub fn scopy(&mut self, src_reg: i32, dest_reg: i32) -> i32 {
        self.push(Opcode::SCopy, src_reg, dest_reg, 0, P4::None)
    }

    pub fn halt(&mut self, error_code: i32, message: Option<&str>) -> i32 {
        let p4 = match message {
            Some(m) => P4::Bytes(m.as_bytes().to_vec()),
            None => P4::None,
        };
        self.push(Opcode::Halt, error_code, 0, 0, p4)
    }

    pub fn build(self) -> Program {
        self.program
    }
}

//! Bytecode format
//!
//! A compact stack instruction set, numbered like the JVM's so dumps read
//! familiar. Operands are big-endian. Instructions that name a constant
//! carry a `u16` pool index; body comparison goes through the pool so two
//! methods that differ only in constant numbering compare equal.

use super::def::Constant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    /// push sign-extended i8
    Bipush = 0x10,
    /// push Int/Long/String constant
    Ldc = 0x12,
    /// push local `u8`
    Load = 0x15,
    /// push local 0
    Aload0 = 0x2a,
    /// pop into local `u8`
    Store = 0x36,
    Pop = 0x57,
    Dup = 0x59,
    Iadd = 0x60,
    Isub = 0x64,
    Imul = 0x68,
    /// branch `i16` if int is zero
    Ifeq = 0x99,
    /// branch `i16`
    Goto = 0xa7,
    Ireturn = 0xac,
    Areturn = 0xb0,
    Return = 0xb1,
    Getstatic = 0xb2,
    Putstatic = 0xb3,
    Getfield = 0xb4,
    Putfield = 0xb5,
    Invokevirtual = 0xb6,
    Invokestatic = 0xb8,
    New = 0xbb,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0x00 => Nop,
            0x10 => Bipush,
            0x12 => Ldc,
            0x15 => Load,
            0x2a => Aload0,
            0x36 => Store,
            0x57 => Pop,
            0x59 => Dup,
            0x60 => Iadd,
            0x64 => Isub,
            0x68 => Imul,
            0x99 => Ifeq,
            0xa7 => Goto,
            0xac => Ireturn,
            0xb0 => Areturn,
            0xb1 => Return,
            0xb2 => Getstatic,
            0xb3 => Putstatic,
            0xb4 => Getfield,
            0xb5 => Putfield,
            0xb6 => Invokevirtual,
            0xb8 => Invokestatic,
            0xbb => New,
            _ => return None,
        })
    }

    /// Instruction length including the opcode byte
    pub fn length(self) -> usize {
        use Opcode::*;
        match self {
            Nop | Aload0 | Pop | Dup | Iadd | Isub | Imul | Ireturn | Areturn | Return => 1,
            Bipush | Load | Store => 2,
            Ldc | Ifeq | Goto | Getstatic | Putstatic | Getfield | Putfield | Invokevirtual
            | Invokestatic | New => 3,
        }
    }

    /// Operand is a constant pool index
    pub fn has_cp_operand(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Ldc | Getstatic | Putstatic | Getfield | Putfield | Invokevirtual | Invokestatic | New
        )
    }

    pub fn is_invoke(self) -> bool {
        matches!(self, Opcode::Invokevirtual | Opcode::Invokestatic)
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            Bipush => "bipush",
            Ldc => "ldc",
            Load => "load",
            Aload0 => "aload_0",
            Store => "store",
            Pop => "pop",
            Dup => "dup",
            Iadd => "iadd",
            Isub => "isub",
            Imul => "imul",
            Ifeq => "ifeq",
            Goto => "goto",
            Ireturn => "ireturn",
            Areturn => "areturn",
            Return => "return",
            Getstatic => "getstatic",
            Putstatic => "putstatic",
            Getfield => "getfield",
            Putfield => "putfield",
            Invokevirtual => "invokevirtual",
            Invokestatic => "invokestatic",
            New => "new",
        }
    }
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub bci: usize,
    pub opcode: Opcode,
    /// Raw operand, zero-extended
    pub operand: u16,
}

impl Instruction {
    pub fn cp_index(&self) -> Option<u16> {
        self.opcode.has_cp_operand().then_some(self.operand)
    }

    pub fn branch_offset(&self) -> i16 {
        self.operand as i16
    }
}

/// Decode the instruction at `bci`
pub fn decode_at(code: &[u8], bci: usize) -> Option<Instruction> {
    let opcode = Opcode::from_u8(*code.get(bci)?)?;
    let len = opcode.length();
    if bci + len > code.len() {
        return None;
    }
    let operand = match len {
        1 => 0,
        2 => code[bci + 1] as u16,
        _ => u16::from_be_bytes([code[bci + 1], code[bci + 2]]),
    };
    Some(Instruction {
        bci,
        opcode,
        operand,
    })
}

/// Iterator over the instructions of a method body
pub struct Instructions<'a> {
    code: &'a [u8],
    bci: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Instructions {
            code,
            bci: 0,
            failed: false,
        }
    }
}

impl Iterator for Instructions<'_> {
    /// `None` inside marks an undecodable byte; iteration stops after it
    type Item = Option<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.bci >= self.code.len() {
            return None;
        }
        match decode_at(self.code, self.bci) {
            Some(insn) => {
                self.bci += insn.opcode.length();
                Some(Some(insn))
            },
            None => {
                self.failed = true;
                Some(None)
            },
        }
    }
}

/// Body equivalence modulo constant numbering
///
/// Two bodies are equivalent when they decode to the same instruction
/// sequence and every pool operand names the same symbolic constant.
pub fn equivalent(
    old_code: &[u8],
    old_pool: &[Constant],
    new_code: &[u8],
    new_pool: &[Constant],
) -> bool {
    if old_code.len() != new_code.len() {
        return false;
    }
    let mut old_iter = Instructions::new(old_code);
    let mut new_iter = Instructions::new(new_code);
    loop {
        match (old_iter.next(), new_iter.next()) {
            (None, None) => return true,
            (Some(Some(a)), Some(Some(b))) => {
                if a.opcode != b.opcode {
                    return false;
                }
                if a.opcode.has_cp_operand() {
                    let ca = old_pool.get(a.operand as usize);
                    let cb = new_pool.get(b.operand as usize);
                    if ca.is_none() || ca != cb {
                        return false;
                    }
                } else if a.operand != b.operand {
                    return false;
                }
            },
            // undecodable bytes only match when identical
            (Some(None), Some(None)) => return old_code == new_code,
            _ => return false,
        }
    }
}

/// Small assembler for building method bodies
///
/// ```rust
/// use relive::model::{Assembler, ClassDef};
///
/// let mut def = ClassDef::new("Counter").field("n", "I");
/// let code = Assembler::new(&mut def)
///     .aload0()
///     .getfield("Counter", "n", "I")
///     .ireturn()
///     .finish();
/// let def = def.method("get", "()I", code);
/// assert_eq!(def.methods.len(), 1);
/// ```
pub struct Assembler<'a> {
    def: &'a mut super::def::ClassDef,
    code: Vec<u8>,
}

impl<'a> Assembler<'a> {
    pub fn new(def: &'a mut super::def::ClassDef) -> Self {
        Assembler {
            def,
            code: Vec::new(),
        }
    }

    fn op(mut self, opcode: Opcode) -> Self {
        self.code.push(opcode as u8);
        self
    }

    fn op_u8(mut self, opcode: Opcode, operand: u8) -> Self {
        self.code.push(opcode as u8);
        self.code.push(operand);
        self
    }

    fn op_u16(mut self, opcode: Opcode, operand: u16) -> Self {
        self.code.push(opcode as u8);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    fn op_cp(self, opcode: Opcode, constant: Constant) -> Self {
        let index = self.def.constant(constant);
        self.op_u16(opcode, index)
    }

    pub fn nop(self) -> Self {
        self.op(Opcode::Nop)
    }

    pub fn iconst(self, value: i8) -> Self {
        self.op_u8(Opcode::Bipush, value as u8)
    }

    pub fn ldc_int(self, value: i32) -> Self {
        self.op_cp(Opcode::Ldc, Constant::Int(value))
    }

    pub fn ldc_long(self, value: i64) -> Self {
        self.op_cp(Opcode::Ldc, Constant::Long(value))
    }

    pub fn load(self, slot: u8) -> Self {
        self.op_u8(Opcode::Load, slot)
    }

    pub fn aload0(self) -> Self {
        self.op(Opcode::Aload0)
    }

    pub fn store(self, slot: u8) -> Self {
        self.op_u8(Opcode::Store, slot)
    }

    pub fn pop(self) -> Self {
        self.op(Opcode::Pop)
    }

    pub fn dup(self) -> Self {
        self.op(Opcode::Dup)
    }

    pub fn iadd(self) -> Self {
        self.op(Opcode::Iadd)
    }

    pub fn isub(self) -> Self {
        self.op(Opcode::Isub)
    }

    pub fn imul(self) -> Self {
        self.op(Opcode::Imul)
    }

    /// Branch relative to this instruction's bci
    pub fn ifeq(self, offset: i16) -> Self {
        self.op_u16(Opcode::Ifeq, offset as u16)
    }

    pub fn goto(self, offset: i16) -> Self {
        self.op_u16(Opcode::Goto, offset as u16)
    }

    pub fn ireturn(self) -> Self {
        self.op(Opcode::Ireturn)
    }

    pub fn areturn(self) -> Self {
        self.op(Opcode::Areturn)
    }

    pub fn vreturn(self) -> Self {
        self.op(Opcode::Return)
    }

    pub fn getfield(self, class: &str, name: &str, sig: &str) -> Self {
        self.op_cp(Opcode::Getfield, field_ref(class, name, sig))
    }

    pub fn putfield(self, class: &str, name: &str, sig: &str) -> Self {
        self.op_cp(Opcode::Putfield, field_ref(class, name, sig))
    }

    pub fn getstatic(self, class: &str, name: &str, sig: &str) -> Self {
        self.op_cp(Opcode::Getstatic, field_ref(class, name, sig))
    }

    pub fn putstatic(self, class: &str, name: &str, sig: &str) -> Self {
        self.op_cp(Opcode::Putstatic, field_ref(class, name, sig))
    }

    pub fn invokevirtual(self, class: &str, name: &str, sig: &str) -> Self {
        self.op_cp(Opcode::Invokevirtual, method_ref(class, name, sig))
    }

    pub fn invokestatic(self, class: &str, name: &str, sig: &str) -> Self {
        self.op_cp(Opcode::Invokestatic, method_ref(class, name, sig))
    }

    pub fn new_object(self, class: &str) -> Self {
        self.op_cp(Opcode::New, Constant::Class(class.to_string()))
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }
}

fn field_ref(class: &str, name: &str, sig: &str) -> Constant {
    Constant::FieldRef {
        class: class.to_string(),
        name: name.to_string(),
        sig: sig.to_string(),
    }
}

fn method_ref(class: &str, name: &str, sig: &str) -> Constant {
    Constant::MethodRef {
        class: class.to_string(),
        name: name.to_string(),
        sig: sig.to_string(),
    }
}

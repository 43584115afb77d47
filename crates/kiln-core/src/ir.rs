//! Minimal structural kernel IR.
//!
//! The full IR and its type system live in the compiler front end; the cache
//! core only needs a shape it can traverse deterministically to fingerprint
//! kernels, and that the external compiler interface can exchange.

/// A lowered (or to-be-lowered) kernel body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrModule {
    pub funcs: Vec<IrFunc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrFunc {
    pub name: String,
    pub params: u32,
    pub body: Vec<IrInst>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrInst {
    pub op: IrOp,
    /// Operand value ids, positional.
    pub operands: Vec<u32>,
    pub imm: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrOp {
    Const,
    Load,
    Store,
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Sqrt,
    Loop,
    EndLoop,
    Call,
    Ret,
}

impl IrModule {
    /// Write a deterministic pre-order traversal of the module into `out`.
    ///
    /// Every field is tag- and length-delimited so adjacent fields cannot
    /// alias under concatenation, and nothing position-dependent (addresses,
    /// hash-map iteration order) can leak into the stream. Two structurally
    /// identical modules always produce identical bytes, across processes.
    pub fn write_structural_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.funcs.len() as u64).to_le_bytes());
        for func in &self.funcs {
            out.push(0xf1);
            out.extend_from_slice(&(func.name.len() as u64).to_le_bytes());
            out.extend_from_slice(func.name.as_bytes());
            out.extend_from_slice(&func.params.to_le_bytes());
            out.extend_from_slice(&(func.body.len() as u64).to_le_bytes());
            for inst in &func.body {
                out.push(0xf2);
                out.push(inst.op as u8);
                out.extend_from_slice(&(inst.operands.len() as u64).to_le_bytes());
                for operand in &inst.operands {
                    out.extend_from_slice(&operand.to_le_bytes());
                }
                match inst.imm {
                    Some(imm) => {
                        out.push(1);
                        out.extend_from_slice(&imm.to_le_bytes());
                    }
                    None => out.push(0),
                }
            }
        }
    }
}

//! A positioned instruction builder over a [`Module`].

use crate::ir::{BinOp, BlockId, CastOp, CmpPred, FuncId, InstId, InstKind, Module, ValueId};
use crate::types::TypeId;

/// Where a [`Builder`] places the next instruction
#[derive(Clone, Copy, Debug)]
enum Position {
    /// Right before the anchor; successive instructions keep their creation order
    Before(InstId),
    /// Right after the anchor, which then moves to the newly placed instruction
    After(InstId),
    /// At the end of the block
    End(BlockId),
}

/// Creates instructions at a position in the module. Every instruction it creates can optionally
/// be marked as produced by instrumentation.
pub struct Builder<'a> {
    m: &'a mut Module,
    pos: Position,
    mark_instrumented: bool,
}

impl<'a> Builder<'a> {
    pub fn before(m: &'a mut Module, anchor: InstId) -> Self {
        Self {
            m,
            pos: Position::Before(anchor),
            mark_instrumented: false,
        }
    }

    pub fn after(m: &'a mut Module, anchor: InstId) -> Self {
        Self {
            m,
            pos: Position::After(anchor),
            mark_instrumented: false,
        }
    }

    pub fn at_end(m: &'a mut Module, b: BlockId) -> Self {
        Self {
            m,
            pos: Position::End(b),
            mark_instrumented: false,
        }
    }

    /// Mark every instruction built from now on as instrumentation
    pub fn instrumenting(mut self) -> Self {
        self.mark_instrumented = true;
        self
    }

    pub fn module(&mut self) -> &mut Module {
        self.m
    }

    /// The most recently placed instruction, when building after an anchor
    pub fn last_placed(&self) -> Option<InstId> {
        match self.pos {
            Position::After(i) => Some(i),
            _ => None,
        }
    }

    fn place(&mut self, kind: InstKind, result: Option<TypeId>) -> InstId {
        let i = self.m.create_inst(kind, result.map(|t| (t, None)));
        self.m.inst_mut(i).instrumented = self.mark_instrumented;
        match self.pos {
            Position::Before(anchor) => self.m.insert_before(anchor, i),
            Position::After(anchor) => {
                self.m.insert_after(anchor, i);
                self.pos = Position::After(i);
            }
            Position::End(b) => self.m.append_inst(b, i),
        }
        i
    }

    fn place_value(&mut self, kind: InstKind, ty: TypeId) -> ValueId {
        let i = self.place(kind, Some(ty));
        self.m.result(i)
    }

    pub fn const_i64(&mut self, v: u64) -> ValueId {
        self.m.const_i64(v)
    }

    pub fn load(&mut self, addr: ValueId) -> ValueId {
        let ty = self
            .m
            .types
            .pointee(self.m.ty_of(addr))
            .expect("Load from a non-pointer");
        self.place_value(InstKind::Load { addr }, ty)
    }

    pub fn store(&mut self, value: ValueId, addr: ValueId) -> InstId {
        self.place(InstKind::Store { value, addr }, None)
    }

    pub fn cast(&mut self, op: CastOp, src: ValueId, to: TypeId) -> ValueId {
        self.place_value(InstKind::Cast { op, src }, to)
    }

    pub fn ptr_to_int(&mut self, src: ValueId) -> ValueId {
        let i64_ = self.m.types.i64();
        self.cast(CastOp::PtrToInt, src, i64_)
    }

    pub fn int_to_ptr(&mut self, src: ValueId, to: TypeId) -> ValueId {
        self.cast(CastOp::IntToPtr, src, to)
    }

    pub fn bitcast(&mut self, src: ValueId, to: TypeId) -> ValueId {
        self.cast(CastOp::BitCast, src, to)
    }

    pub fn zext(&mut self, src: ValueId, to: TypeId) -> ValueId {
        self.cast(CastOp::ZExt, src, to)
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.m.ty_of(lhs);
        self.place_value(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn icmp(&mut self, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        let i1 = self.m.types.i1();
        self.place_value(InstKind::Cmp { pred, lhs, rhs }, i1)
    }

    /// Direct call to `f`; returns the call instruction
    pub fn call(&mut self, f: FuncId, args: Vec<ValueId>) -> InstId {
        let callee = self.m.function(f).addr;
        let (ret, _) = self
            .m
            .types
            .signature(self.m.function(f).ty)
            .expect("Function without signature");
        let result = if matches!(self.m.types.get(ret), crate::types::Type::Void) {
            None
        } else {
            Some(ret)
        };
        self.place(InstKind::Call { callee, args }, result)
    }

    /// Direct call to a non-void `f`; returns its result
    pub fn call_value(&mut self, f: FuncId, args: Vec<ValueId>) -> ValueId {
        let i = self.call(f, args);
        self.m.result(i)
    }

    pub fn alloca(&mut self, ty: TypeId) -> ValueId {
        let pty = self.m.types.ptr(ty);
        self.place_value(InstKind::Alloca { ty }, pty)
    }

    pub fn br(&mut self, target: BlockId) -> InstId {
        self.place(InstKind::Br { target }, None)
    }

    pub fn cond_br(&mut self, cond: ValueId, on_true: BlockId, on_false: BlockId) -> InstId {
        self.place(
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            },
            None,
        )
    }

    pub fn ret(&mut self, value: Option<ValueId>) -> InstId {
        self.place(InstKind::Ret { value }, None)
    }
}

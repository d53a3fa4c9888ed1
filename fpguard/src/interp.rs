//! A reference interpreter for modules, used by tests to check that hardened code computes what
//! the original computed.
//!
//! Memory is a sparse little-endian byte map. Globals are laid out from [`GLOBAL_BASE`], and
//! function addresses are synthetic ([`FUNCTION_BASE`] plus a stride per function). Declared
//! functions are modeled: the cipher primitives XOR with a keystream derived from the slot
//! address, the copy, fill and allocation routines do what their kernel namesakes do, and any
//! other external call is recorded in [`Interp::calls`] and returns zero.

use crate::bulk_copy::PERCPU_COPY_HOOK;
use crate::global_init::{GLOBAL_INIT_SECTION, PERCPU_COPY_SECTION};
use crate::instrument::{DECRYPT, ENCRYPT};
use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, ConstExpr, FuncId, Initializer, InstKind, Module, ValueId,
    ValueKind,
};
use crate::types::{Type, TypeId};
use std::collections::BTreeMap;

pub const GLOBAL_BASE: u64 = 0x1000_0000;
pub const HEAP_BASE: u64 = 0x2000_0000;
pub const STACK_BASE: u64 = 0x3000_0000;
pub const FUNCTION_BASE: u64 = 0x4000_0000;
const FUNCTION_STRIDE: u64 = 0x10;
/// Byte pattern of freshly allocated, non-zeroed memory
const POISON: u8 = 0xaa;
const STEP_LIMIT: usize = 1_000_000;

/// The keystream word for the slot at `slot`
pub fn key(slot: u64) -> u64 {
    slot.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(17) ^ 0xa5a5_a5a5_a5a5_a5a5
}

/// The ciphertext of `plain` stored at `slot`
pub fn encrypted(plain: u64, slot: u64) -> u64 {
    plain ^ key(slot)
}

fn round_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

pub struct Interp<'m> {
    m: &'m Module,
    mem: BTreeMap<u64, u8>,
    globals: Vec<u64>,
    heap: u64,
    stack: u64,
    allocations: BTreeMap<u64, u64>,
    steps: usize,
    /// External calls other than the cipher primitives and modeled routines
    pub calls: Vec<(String, Vec<u64>)>,
}

type Frame = BTreeMap<ValueId, u64>;

impl<'m> Interp<'m> {
    /// Lay out and initialize every global of `m`
    pub fn new(m: &'m Module) -> Self {
        let mut r = Self {
            m,
            mem: Default::default(),
            globals: vec![],
            heap: HEAP_BASE,
            stack: STACK_BASE,
            allocations: Default::default(),
            steps: 0,
            calls: vec![],
        };
        let mut next = GLOBAL_BASE;
        for g in m.globals() {
            let ty = m.global(g).ty;
            let size = m.types.size_of(ty).unwrap_or(8).max(1);
            r.globals.push(next);
            next = round_up(next + size, 16);
        }
        for g in m.globals() {
            if let Some(init) = m.global(g).initializer.clone() {
                let addr = r.globals[g.index()];
                r.write_init(addr, m.global(g).ty, &init);
            }
        }
        r
    }

    fn write_init(&mut self, addr: u64, ty: TypeId, init: &Initializer) {
        let m = self.m;
        let size = m.types.size_of(ty).unwrap_or(0);
        match init {
            Initializer::Zero => self.fill(addr, 0, size),
            Initializer::Int(n) => self.write(addr, size, *n),
            Initializer::Value(v) => {
                let x = self.operand(&Frame::new(), *v);
                self.write(addr, size, x)
            }
            Initializer::Aggregate(elems) => match m.types.get(ty) {
                Type::Struct { body: Some(fields), .. } => {
                    for (i, (e, &f)) in elems.iter().zip(fields.iter()).enumerate() {
                        self.write_init(addr + m.types.field_offset(ty, i), f, e);
                    }
                }
                Type::Array { element, .. } => {
                    let step = m.types.size_of(*element).unwrap_or(0);
                    for (i, e) in elems.iter().enumerate() {
                        self.write_init(addr + step * i as u64, *element, e);
                    }
                }
                t => panic!("Aggregate initializer for {:?}", t),
            },
        }
    }

    pub fn global_addr(&self, name: &str) -> u64 {
        let g = self.m.global_named(name).expect("No such global");
        self.globals[g.index()]
    }

    pub fn fn_addr(&self, name: &str) -> u64 {
        let f = self.m.function_named(name).expect("No such function");
        FUNCTION_BASE + FUNCTION_STRIDE * f.index() as u64
    }

    fn function_at(&self, addr: u64) -> FuncId {
        let f = self.m.functions().find(|f| {
            FUNCTION_BASE + FUNCTION_STRIDE * f.index() as u64 == addr
        });
        f.unwrap_or_else(|| panic!("Call through {:#x}, which is not a function", addr))
    }

    pub fn read(&self, addr: u64, size: u64) -> u64 {
        (0..size.min(8)).fold(0, |acc, i| {
            acc | (*self.mem.get(&(addr + i)).unwrap_or(&0) as u64) << (8 * i)
        })
    }

    pub fn write(&mut self, addr: u64, size: u64, v: u64) {
        for i in 0..size {
            let byte = if i < 8 { (v >> (8 * i)) as u8 } else { 0 };
            self.mem.insert(addr + i, byte);
        }
    }

    fn fill(&mut self, addr: u64, byte: u8, len: u64) {
        for i in 0..len {
            self.mem.insert(addr + i, byte);
        }
    }

    fn copy(&mut self, dst: u64, src: u64, len: u64) {
        let bytes: Vec<u8> = (0..len)
            .map(|i| *self.mem.get(&(src + i)).unwrap_or(&0))
            .collect();
        for (i, b) in bytes.into_iter().enumerate() {
            self.mem.insert(dst + i as u64, b);
        }
    }

    /// Heap memory of `size` bytes, filled with `byte`
    pub fn alloc(&mut self, size: u64, byte: u8) -> u64 {
        let addr = self.heap;
        self.heap = round_up(self.heap + size.max(1), 16);
        self.fill(addr, byte, size);
        self.allocations.insert(addr, size);
        addr
    }

    fn width(&self, ty: TypeId) -> u32 {
        match self.m.types.get(ty) {
            Type::Int { bits } => *bits,
            _ => 64,
        }
    }

    fn truncate(&self, ty: TypeId, v: u64) -> u64 {
        let bits = self.width(ty);
        if bits >= 64 {
            v
        } else {
            v & ((1u64 << bits) - 1)
        }
    }

    fn signed(&self, ty: TypeId, v: u64) -> i64 {
        let bits = self.width(ty);
        if bits >= 64 {
            v as i64
        } else {
            ((v << (64 - bits)) as i64) >> (64 - bits)
        }
    }

    fn field_addr(&self, frame: &Frame, source_ty: TypeId, base: ValueId, indices: &[ValueId]) -> u64 {
        let m = self.m;
        let index = |v: ValueId| self.signed(m.ty_of(v), self.operand(frame, v));
        let mut addr = self.operand(frame, base);
        let first = index(indices[0]);
        let size = m.types.size_of(source_ty).unwrap_or(0);
        addr = addr.wrapping_add((first as u64).wrapping_mul(size));
        let mut cur = source_ty;
        for &idx in &indices[1..] {
            match m.types.get(cur) {
                Type::Struct { body: Some(fields), .. } => {
                    let k = index(idx) as usize;
                    addr += m.types.field_offset(cur, k);
                    cur = fields[k];
                }
                Type::Array { element, .. } => {
                    let step = m.types.size_of(*element).unwrap_or(0);
                    addr = addr.wrapping_add((index(idx) as u64).wrapping_mul(step));
                    cur = *element;
                }
                t => panic!("Field address into {:?}", t),
            }
        }
        addr
    }

    fn cast(&self, op: CastOp, v: u64, to: TypeId) -> u64 {
        match op {
            CastOp::Trunc => self.truncate(to, v),
            CastOp::BitCast | CastOp::PtrToInt | CastOp::IntToPtr | CastOp::ZExt => v,
        }
    }

    fn operand(&self, frame: &Frame, v: ValueId) -> u64 {
        let m = self.m;
        match &m.value(v).kind {
            ValueKind::Argument { .. } | ValueKind::Result(_) => *frame
                .get(&v)
                .unwrap_or_else(|| panic!("Use of {} before its definition", m.value_text(v))),
            ValueKind::Global(g) => self.globals[g.index()],
            ValueKind::Function(f) => FUNCTION_BASE + FUNCTION_STRIDE * f.index() as u64,
            ValueKind::ConstInt(c) => *c,
            ValueKind::Null | ValueKind::Undef => 0,
            ValueKind::Expr(ConstExpr::Cast { op, src }) => {
                self.cast(*op, self.operand(frame, *src), m.ty_of(v))
            }
            ValueKind::Expr(ConstExpr::FieldAddr {
                source_ty,
                base,
                indices,
            }) => self.field_addr(frame, *source_ty, *base, indices),
        }
    }

    fn compare(&self, pred: CmpPred, ty: TypeId, a: u64, b: u64) -> bool {
        let (sa, sb) = (self.signed(ty, a), self.signed(ty, b));
        match pred {
            CmpPred::Eq => a == b,
            CmpPred::Ne => a != b,
            CmpPred::Ult => a < b,
            CmpPred::Ule => a <= b,
            CmpPred::Ugt => a > b,
            CmpPred::Uge => a >= b,
            CmpPred::Slt => sa < sb,
            CmpPred::Sle => sa <= sb,
            CmpPred::Sgt => sa > sb,
            CmpPred::Sge => sa >= sb,
        }
    }

    /// Call the function `name` with `args`, returning its result (zero for `void`)
    pub fn call(&mut self, name: &str, args: &[u64]) -> u64 {
        let f = self.m.function_named(name).expect("No such function");
        self.call_function(f, args)
    }

    /// Run every initializer routine registered in the unit, as the boot dispatcher would
    pub fn boot(&mut self) {
        for f in self.registered(GLOBAL_INIT_SECTION) {
            self.call_function(f, &[]);
        }
    }

    /// Functions whose addresses are stored in globals of `section`
    fn registered(&self, section: &str) -> Vec<FuncId> {
        let m = self.m;
        m.globals()
            .filter(|&g| m.global(g).section.as_deref() == Some(section))
            .map(|g| self.function_at(self.read(self.globals[g.index()], 8)))
            .collect()
    }

    fn call_function(&mut self, f: FuncId, args: &[u64]) -> u64 {
        let m = self.m;
        let func = m.function(f);
        if func.is_declaration() {
            return self.call_external(&func.name, args);
        }
        assert_eq!(func.params.len(), args.len(), "Arity mismatch calling @{}", func.name);
        let mut frame: Frame = func.params.iter().cloned().zip(args.iter().cloned()).collect();
        let mut prev: Option<BlockId> = None;
        let mut b = func.blocks[0];
        loop {
            let mut next = None;
            for &i in &m.block(b).insts {
                self.steps += 1;
                assert!(self.steps < STEP_LIMIT, "Step limit exceeded in @{}", func.name);
                let inst = m.inst(i);
                let ty = inst.result.map(|r| m.ty_of(r));
                let val = |s: &Self, frame: &Frame, v: ValueId| s.operand(frame, v);
                let result = match &inst.kind {
                    InstKind::Cast { op, src } => {
                        Some(self.cast(*op, val(self, &frame, *src), ty.unwrap()))
                    }
                    InstKind::Cmp { pred, lhs, rhs } => {
                        let (a, c) = (val(self, &frame, *lhs), val(self, &frame, *rhs));
                        Some(self.compare(*pred, m.ty_of(*lhs), a, c) as u64)
                    }
                    InstKind::Select {
                        cond,
                        on_true,
                        on_false,
                    } => Some(if val(self, &frame, *cond) & 1 != 0 {
                        val(self, &frame, *on_true)
                    } else {
                        val(self, &frame, *on_false)
                    }),
                    InstKind::Phi { incoming } => {
                        let (v, _) = incoming
                            .iter()
                            .find(|(_, from)| Some(*from) == prev)
                            .expect("Phi without an entry for the predecessor");
                        Some(val(self, &frame, *v))
                    }
                    InstKind::Load { addr } => {
                        let size = m.types.size_of(ty.unwrap()).unwrap_or(8);
                        Some(self.read(val(self, &frame, *addr), size))
                    }
                    InstKind::Store { value, addr } => {
                        let size = m.types.size_of(m.ty_of(*value)).unwrap_or(8);
                        let (v, a) = (val(self, &frame, *value), val(self, &frame, *addr));
                        self.write(a, size, v);
                        None
                    }
                    InstKind::FieldAddr {
                        source_ty,
                        base,
                        indices,
                    } => Some(self.field_addr(&frame, *source_ty, *base, indices)),
                    InstKind::Call { callee, args } => {
                        let target = self.function_at(val(self, &frame, *callee));
                        let args: Vec<u64> = args.iter().map(|&a| val(self, &frame, a)).collect();
                        let r = self.call_function(target, &args);
                        inst.result.map(|_| r)
                    }
                    InstKind::Binary { op, lhs, rhs } => {
                        let (a, c) = (val(self, &frame, *lhs), val(self, &frame, *rhs));
                        Some(match op {
                            BinOp::Add => a.wrapping_add(c),
                            BinOp::Sub => a.wrapping_sub(c),
                            BinOp::Mul => a.wrapping_mul(c),
                            BinOp::And => a & c,
                            BinOp::Or => a | c,
                        })
                    }
                    InstKind::Alloca { ty: t } => {
                        let size = m.types.size_of(*t).unwrap_or(8).max(1);
                        let addr = self.stack;
                        self.stack = round_up(self.stack + size, 16);
                        self.fill(addr, POISON, size);
                        Some(addr)
                    }
                    InstKind::Br { target } => {
                        next = Some(*target);
                        None
                    }
                    InstKind::CondBr {
                        cond,
                        on_true,
                        on_false,
                    } => {
                        next = Some(if val(self, &frame, *cond) & 1 != 0 {
                            *on_true
                        } else {
                            *on_false
                        });
                        None
                    }
                    InstKind::Ret { value } => {
                        return value.map_or(0, |v| val(self, &frame, v));
                    }
                };
                if let (Some(r), Some(x)) = (inst.result, result) {
                    let x = self.truncate(m.ty_of(r), x);
                    frame.insert(r, x);
                }
                if next.is_some() {
                    break;
                }
            }
            prev = Some(b);
            b = next.unwrap_or_else(|| panic!("Block {} falls through", m.block(b).name));
        }
    }

    fn call_external(&mut self, name: &str, args: &[u64]) -> u64 {
        let arg = |n: usize| args.get(n).cloned().unwrap_or(0);
        match name {
            ENCRYPT | DECRYPT => arg(0) ^ key(arg(1)),
            n if n.starts_with("llvm.memcpy")
                || n.starts_with("llvm.memmove")
                || ["memcpy", "__memcpy", "memmove", "__memmove"].contains(&n) =>
            {
                self.copy(arg(0), arg(1), arg(2));
                arg(0)
            }
            n if n.starts_with("llvm.memset") || n == "memset" || n == "__memset" => {
                self.fill(arg(0), arg(1) as u8, arg(2));
                arg(0)
            }
            "kmemdup" => {
                let p = self.alloc(arg(1), POISON);
                self.copy(p, arg(0), arg(1));
                p
            }
            "kzalloc" => self.alloc(arg(0), 0),
            "kmalloc" | "__kmalloc" => {
                let byte = if arg(1) & 0x100 != 0 { 0 } else { POISON };
                self.alloc(arg(0), byte)
            }
            "krealloc" => {
                let old = self.allocations.get(&arg(0)).cloned().unwrap_or(0);
                let p = self.alloc(arg(1), POISON);
                self.copy(p, arg(0), old.min(arg(1)));
                p
            }
            PERCPU_COPY_HOOK => {
                for f in self.registered(PERCPU_COPY_SECTION) {
                    self.call_function(f, args);
                }
                0
            }
            _ => {
                self.calls.push((name.to_owned(), args.to_vec()));
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn loops_phis_and_memory() {
        let m = parse_module(
            r#"
unit "t.c"
struct %struct.pair { i32, i64 }
global @acc : %struct.pair = { 7, 0 }
define @sum(%n: i64) -> i64 {
entry:
  br loop
loop:
  %i: i64 = phi [0:i64, entry], [%i.next, loop]
  %s: i64 = phi [0:i64, entry], [%s.next, loop]
  %s.next: i64 = add %s, %i
  %i.next: i64 = add %i, 1:i64
  %more: i1 = icmp ult %i.next, %n
  br %more, loop, done
done:
  %f: ptr<i64> = fieldaddr %struct.pair, @acc, 0:i64, 1:i32
  store %s.next, %f
  ret %s.next
}
"#,
        )
        .unwrap();
        let mut it = Interp::new(&m);
        assert_eq!(it.call("sum", &[5]), 10);
        let acc = it.global_addr("acc");
        assert_eq!(it.read(acc, 4), 7);
        assert_eq!(it.read(acc + 8, 8), 10);
    }

    #[test]
    fn cipher_is_bound_to_the_slot() {
        assert_ne!(encrypted(0x1234, 0x100), encrypted(0x1234, 0x108));
        assert_eq!(encrypted(encrypted(0x1234, 0x100), 0x100), 0x1234);
    }
}

//! The program representation for one compilation unit: globals, functions, basic blocks and
//! typed instructions over SSA values.
//!
//! Everything is stored in arenas owned by the [`Module`] and referred to by small copyable ids.
//! Instructions are mutated in place; an erased instruction stays in the arena but is detached
//! from every block.

use crate::containers::unordered::UnorderedMap;
use crate::types::{Type, TypeId, TypeTable};
use std::collections::BTreeSet;

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            /// Index into the owning arena
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(ValueId, "v");
id_type!(InstId, "i");
id_type!(BlockId, "b");
id_type!(FuncId, "f");
id_type!(GlobalId, "g");

/// Type conversions
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum CastOp {
    BitCast,
    PtrToInt,
    IntToPtr,
    ZExt,
    Trunc,
}

/// Integer comparison predicates
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum CmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// Wrapping integer arithmetic
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
}

/// Constant expressions, usable as operands anywhere a value is expected
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum ConstExpr {
    Cast {
        op: CastOp,
        src: ValueId,
    },
    FieldAddr {
        source_ty: TypeId,
        base: ValueId,
        indices: Vec<ValueId>,
    },
}

/// What a value is
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum ValueKind {
    /// The `index`th parameter of `func`
    Argument { func: FuncId, index: usize },
    /// The result of an instruction
    Result(InstId),
    /// The address of a global variable
    Global(GlobalId),
    /// The address of a function
    Function(FuncId),
    /// An integer constant, stored zero-extended
    ConstInt(u64),
    Null,
    Undef,
    Expr(ConstExpr),
}

#[derive(Clone, Debug)]
pub struct ValueData {
    pub ty: TypeId,
    pub kind: ValueKind,
    /// Front-end assigned name, if any
    pub name: Option<String>,
}

/// An instruction's operation
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
    Cast {
        op: CastOp,
        src: ValueId,
    },
    Cmp {
        pred: CmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },
    /// A control-flow merge
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
    Load {
        addr: ValueId,
    },
    Store {
        value: ValueId,
        addr: ValueId,
    },
    /// Address of a sub-object: `base` is a `ptr<source_ty>`; the first index steps over whole
    /// `source_ty` objects, the remaining ones into struct fields and array elements.
    FieldAddr {
        source_ty: TypeId,
        base: ValueId,
        indices: Vec<ValueId>,
    },
    Call {
        callee: ValueId,
        args: Vec<ValueId>,
    },
    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Stack allocation of one `ty`
    Alloca {
        ty: TypeId,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: ValueId,
        on_true: BlockId,
        on_false: BlockId,
    },
    Ret {
        value: Option<ValueId>,
    },
}

impl InstKind {
    /// All value operands, in order
    pub fn operands(&self) -> Vec<ValueId> {
        use InstKind::*;
        match self {
            Cast { src, .. } => vec![*src],
            Cmp { lhs, rhs, .. } | Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Select {
                cond,
                on_true,
                on_false,
            } => vec![*cond, *on_true, *on_false],
            Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            Load { addr } => vec![*addr],
            Store { value, addr } => vec![*value, *addr],
            FieldAddr { base, indices, .. } => {
                std::iter::once(*base).chain(indices.iter().cloned()).collect()
            }
            Call { callee, args } => std::iter::once(*callee).chain(args.iter().cloned()).collect(),
            Alloca { .. } | Br { .. } => vec![],
            CondBr { cond, .. } => vec![*cond],
            Ret { value } => value.iter().cloned().collect(),
        }
    }

    /// Mutable references to all value operands, in the same order as [`Self::operands`]
    pub fn operands_mut(&mut self) -> Vec<&mut ValueId> {
        use InstKind::*;
        match self {
            Cast { src, .. } => vec![src],
            Cmp { lhs, rhs, .. } | Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Select {
                cond,
                on_true,
                on_false,
            } => vec![cond, on_true, on_false],
            Phi { incoming } => incoming.iter_mut().map(|(v, _)| v).collect(),
            Load { addr } => vec![addr],
            Store { value, addr } => vec![value, addr],
            FieldAddr { base, indices, .. } => {
                std::iter::once(base).chain(indices.iter_mut()).collect()
            }
            Call { callee, args } => std::iter::once(callee).chain(args.iter_mut()).collect(),
            Alloca { .. } | Br { .. } => vec![],
            CondBr { cond, .. } => vec![cond],
            Ret { value } => value.iter_mut().collect(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. }
        )
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => vec![],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub kind: InstKind,
    pub result: Option<ValueId>,
    /// Containing block; `None` once erased (or before being placed)
    pub block: Option<BlockId>,
    /// Set on instructions that the instrumenter has already rewritten or produced
    pub instrumented: bool,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub func: FuncId,
    pub insts: Vec<InstId>,
}

/// Function attributes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum FnAttr {
    Cold,
    NoUnwind,
    /// The parameter list has had its trailing function pointer swapped to the front
    FpParamsReordered,
}

impl FnAttr {
    pub fn keyword(self) -> &'static str {
        match self {
            FnAttr::Cold => "cold",
            FnAttr::NoUnwind => "nounwind",
            FnAttr::FpParamsReordered => "fp_params_reordered",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        [FnAttr::Cold, FnAttr::NoUnwind, FnAttr::FpParamsReordered]
            .into_iter()
            .find(|a| a.keyword() == s)
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// The function's signature (a [`Type::Function`])
    pub ty: TypeId,
    pub params: Vec<ValueId>,
    pub blocks: Vec<BlockId>,
    pub section: Option<String>,
    pub attrs: BTreeSet<FnAttr>,
    /// The address of this function, as a value
    pub addr: ValueId,
}

impl Function {
    /// A function without a body
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Static initial contents of a global
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Initializer {
    Zero,
    Int(u64),
    /// A constant value: address, null, or constant expression
    Value(ValueId),
    Aggregate(Vec<Initializer>),
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    /// Type of the variable's contents
    pub ty: TypeId,
    /// `None` for an external declaration, whose storage lives in another unit
    pub initializer: Option<Initializer>,
    pub section: Option<String>,
    pub internal: bool,
    pub unnamed_addr: bool,
    pub addr: ValueId,
}

impl Global {
    pub fn is_declaration(&self) -> bool {
        self.initializer.is_none()
    }
}

/// Where the last index of a field-address computation lands
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldPath {
    /// Type of the addressed sub-object
    pub target: TypeId,
    /// `(struct, field index)` if the final step selects a struct field
    pub field: Option<(TypeId, usize)>,
}

/// One compilation unit
#[derive(Clone, Debug)]
pub struct Module {
    /// The compilation unit's name (its source path)
    pub unit: String,
    pub types: TypeTable,
    values: Vec<ValueData>,
    insts: Vec<Instruction>,
    blocks: Vec<Block>,
    funcs: Vec<Function>,
    globals: Vec<Global>,
    constants: UnorderedMap<(TypeId, ValueKind), ValueId>,
}

impl Module {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_owned(),
            types: TypeTable::new(),
            values: vec![],
            insts: vec![],
            blocks: vec![],
            funcs: vec![],
            globals: vec![],
            constants: Default::default(),
        }
    }

    fn add_value(&mut self, ty: TypeId, kind: ValueKind, name: Option<String>) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(ValueData { ty, kind, name });
        id
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.0]
    }

    pub fn ty_of(&self, v: ValueId) -> TypeId {
        self.values[v.0].ty
    }

    pub fn name_of(&self, v: ValueId) -> Option<&str> {
        self.values[v.0].name.as_deref()
    }

    pub fn set_name(&mut self, v: ValueId, name: Option<String>) {
        self.values[v.0].name = name;
    }

    /// Number of values ever created (including those of erased instructions)
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// All values ever created
    pub fn values(&self) -> impl Iterator<Item = ValueId> {
        (0..self.values.len()).map(ValueId)
    }

    /// The first value carrying front-end name `name`
    pub fn value_named(&self, name: &str) -> Option<ValueId> {
        self.values
            .iter()
            .position(|v| v.name.as_deref() == Some(name))
            .map(ValueId)
    }

    fn intern_constant(&mut self, ty: TypeId, kind: ValueKind) -> ValueId {
        if let Some(&v) = self.constants.get(&(ty, kind.clone())) {
            return v;
        }
        let v = self.add_value(ty, kind.clone(), None);
        self.constants.insert((ty, kind), v);
        v
    }

    /// Integer constant `value` of integer type `ty`
    pub fn const_int(&mut self, ty: TypeId, value: u64) -> ValueId {
        let bits = match self.types.get(ty) {
            Type::Int { bits } => *bits,
            t => panic!("Integer constant of non-integer type {:?}", t),
        };
        let value = if bits >= 64 {
            value
        } else {
            value & ((1u64 << bits) - 1)
        };
        self.intern_constant(ty, ValueKind::ConstInt(value))
    }

    pub fn const_i64(&mut self, value: u64) -> ValueId {
        let i64_ = self.types.i64();
        self.const_int(i64_, value)
    }

    pub fn null(&mut self, ty: TypeId) -> ValueId {
        assert!(self.types.is_pointer(ty), "Null of non-pointer type");
        self.intern_constant(ty, ValueKind::Null)
    }

    pub fn undef(&mut self, ty: TypeId) -> ValueId {
        self.intern_constant(ty, ValueKind::Undef)
    }

    /// A constant expression of result type `ty`
    pub fn const_expr(&mut self, ty: TypeId, e: ConstExpr) -> ValueId {
        self.intern_constant(ty, ValueKind::Expr(e))
    }

    /// The integer held by `v`, if it is an integer constant
    pub fn const_value(&self, v: ValueId) -> Option<u64> {
        match self.values[v.0].kind {
            ValueKind::ConstInt(c) => Some(c),
            _ => None,
        }
    }

    /// Is `v` plain constant data (an integer, null or undef)?
    pub fn is_constant_data(&self, v: ValueId) -> bool {
        matches!(
            self.values[v.0].kind,
            ValueKind::ConstInt(_) | ValueKind::Null | ValueKind::Undef
        )
    }

    /// The instruction producing `v`, if any
    pub fn producer(&self, v: ValueId) -> Option<InstId> {
        match self.values[v.0].kind {
            ValueKind::Result(i) => Some(i),
            _ => None,
        }
    }

    // ---------------- Globals ----------------

    pub fn add_global(
        &mut self,
        name: &str,
        ty: TypeId,
        initializer: Option<Initializer>,
        section: Option<String>,
        internal: bool,
    ) -> GlobalId {
        assert!(
            self.global_named(name).is_none(),
            "Global {} defined twice",
            name
        );
        let g = GlobalId(self.globals.len());
        let pty = self.types.ptr(ty);
        let addr = self.add_value(pty, ValueKind::Global(g), Some(name.to_owned()));
        self.globals.push(Global {
            name: name.to_owned(),
            ty,
            initializer,
            section,
            internal,
            unnamed_addr: false,
            addr,
        });
        g
    }

    pub fn global(&self, g: GlobalId) -> &Global {
        &self.globals[g.0]
    }

    pub fn global_mut(&mut self, g: GlobalId) -> &mut Global {
        &mut self.globals[g.0]
    }

    pub fn globals(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len()).map(GlobalId)
    }

    pub fn global_named(&self, name: &str) -> Option<GlobalId> {
        self.globals.iter().position(|g| g.name == name).map(GlobalId)
    }

    // ---------------- Functions ----------------

    /// Declare a function (without body) of signature `fnty`
    pub fn declare_function(&mut self, name: &str, fnty: TypeId, param_names: &[&str]) -> FuncId {
        assert!(
            self.function_named(name).is_none(),
            "Function {} declared twice",
            name
        );
        let params_tys = match self.types.get(fnty) {
            Type::Function { params, .. } => params.clone(),
            t => panic!("Function {} declared with non-function type {:?}", name, t),
        };
        let f = FuncId(self.funcs.len());
        let pty = self.types.ptr(fnty);
        let addr = self.add_value(pty, ValueKind::Function(f), Some(name.to_owned()));
        let params = params_tys
            .iter()
            .enumerate()
            .map(|(index, &ty)| {
                let name = param_names.get(index).map(|s| s.to_string());
                self.add_value(ty, ValueKind::Argument { func: f, index }, name)
            })
            .collect();
        self.funcs.push(Function {
            name: name.to_owned(),
            ty: fnty,
            params,
            blocks: vec![],
            section: None,
            attrs: Default::default(),
            addr,
        });
        f
    }

    /// The function named `name`, declaring it with the given signature if it does not exist yet
    pub fn get_or_declare_function(&mut self, name: &str, ret: TypeId, params: Vec<TypeId>) -> FuncId {
        if let Some(f) = self.function_named(name) {
            return f;
        }
        let fnty = self.types.func(ret, params);
        self.declare_function(name, fnty, &[])
    }

    pub fn function(&self, f: FuncId) -> &Function {
        &self.funcs[f.0]
    }

    pub fn function_mut(&mut self, f: FuncId) -> &mut Function {
        &mut self.funcs[f.0]
    }

    pub fn functions(&self) -> impl Iterator<Item = FuncId> {
        (0..self.funcs.len()).map(FuncId)
    }

    pub fn function_named(&self, name: &str) -> Option<FuncId> {
        self.funcs.iter().position(|f| f.name == name).map(FuncId)
    }

    /// Swap parameters `a` and `b` of `f`, both in its signature and in its parameter list. Uses
    /// of the parameter values inside the body are unaffected, so a parameter keeps meaning the
    /// same thing after moving to its new position.
    pub fn swap_params(&mut self, f: FuncId, a: usize, b: usize) {
        let (ret, mut params) = match self.types.get(self.funcs[f.0].ty) {
            Type::Function { ret, params } => (*ret, params.clone()),
            _ => unreachable!(),
        };
        params.swap(a, b);
        let fnty = self.types.func(ret, params);
        let pty = self.types.ptr(fnty);
        let func = &mut self.funcs[f.0];
        func.ty = fnty;
        func.params.swap(a, b);
        let (pa, pb) = (func.params[a], func.params[b]);
        self.values[func.addr.0].ty = pty;
        self.values[pa.0].kind = ValueKind::Argument { func: f, index: a };
        self.values[pb.0].kind = ValueKind::Argument { func: f, index: b };
    }

    // ---------------- Blocks ----------------

    /// `name`, suffixed if needed to be unique among the blocks of `f`
    fn fresh_block_name(&self, f: FuncId, name: &str) -> String {
        let taken = |n: &str| self.block_named(f, n).is_some();
        if !taken(name) {
            return name.to_owned();
        }
        (1..)
            .map(|k| format!("{}.{}", name, k))
            .find(|n| !taken(n))
            .unwrap()
    }

    /// Append a new, empty block to `f`. The name is suffixed if already used in `f`.
    pub fn add_block(&mut self, f: FuncId, name: &str) -> BlockId {
        let name = self.fresh_block_name(f, name);
        let b = BlockId(self.blocks.len());
        self.blocks.push(Block {
            name,
            func: f,
            insts: vec![],
        });
        self.funcs[f.0].blocks.push(b);
        b
    }

    /// Insert a new, empty block into `after`'s function, immediately after `after`. The name is
    /// suffixed if already used in the function.
    pub fn add_block_after(&mut self, after: BlockId, name: &str) -> BlockId {
        let f = self.blocks[after.0].func;
        let name = self.fresh_block_name(f, name);
        let b = BlockId(self.blocks.len());
        self.blocks.push(Block {
            name,
            func: f,
            insts: vec![],
        });
        let pos = self.funcs[f.0]
            .blocks
            .iter()
            .position(|&x| x == after)
            .unwrap();
        self.funcs[f.0].blocks.insert(pos + 1, b);
        b
    }

    pub fn block(&self, b: BlockId) -> &Block {
        &self.blocks[b.0]
    }

    pub fn block_named(&self, f: FuncId, name: &str) -> Option<BlockId> {
        self.funcs[f.0]
            .blocks
            .iter()
            .cloned()
            .find(|&b| self.blocks[b.0].name == name)
    }

    /// Split `inst`'s block right before `inst`: `inst` and everything after it move to a new
    /// block (named `name`) placed right after the original, which gets an unconditional branch
    /// to the new one. Merges in successor blocks are re-pointed to the new block.
    pub fn split_block(&mut self, inst: InstId, name: &str) -> BlockId {
        let old = self.insts[inst.0].block.expect("Split at detached instruction");
        let new = self.add_block_after(old, name);
        let pos = self.position_in_block(inst);
        let moved: Vec<InstId> = self.blocks[old.0].insts.split_off(pos);
        for &i in &moved {
            self.insts[i.0].block = Some(new);
        }
        let succs: Vec<BlockId> = moved
            .last()
            .map(|&t| self.insts[t.0].kind.successors())
            .unwrap_or_default();
        self.blocks[new.0].insts = moved;
        for s in succs {
            for i in self.blocks[s.0].insts.clone() {
                if let InstKind::Phi { incoming } = &mut self.insts[i.0].kind {
                    for (_, b) in incoming.iter_mut() {
                        if *b == old {
                            *b = new;
                        }
                    }
                }
            }
        }
        let br = self.create_inst(InstKind::Br { target: new }, None);
        self.append_inst(old, br);
        new
    }

    // ---------------- Instructions ----------------

    /// Create a detached instruction. If `result` is given, a result value of that type (and
    /// optional name) is created too.
    pub fn create_inst(&mut self, kind: InstKind, result: Option<(TypeId, Option<String>)>) -> InstId {
        let i = InstId(self.insts.len());
        let result = result.map(|(ty, name)| self.add_value(ty, ValueKind::Result(i), name));
        self.insts.push(Instruction {
            kind,
            result,
            block: None,
            instrumented: false,
        });
        i
    }

    pub fn inst(&self, i: InstId) -> &Instruction {
        &self.insts[i.0]
    }

    pub fn inst_mut(&mut self, i: InstId) -> &mut Instruction {
        &mut self.insts[i.0]
    }

    /// The result value of `i`. Panics if `i` has none.
    pub fn result(&self, i: InstId) -> ValueId {
        self.insts[i.0]
            .result
            .unwrap_or_else(|| panic!("Instruction {:?} has no result", self.insts[i.0].kind))
    }

    fn position_in_block(&self, i: InstId) -> usize {
        let b = self.insts[i.0].block.expect("Detached instruction");
        self.blocks[b.0]
            .insts
            .iter()
            .position(|&x| x == i)
            .unwrap()
    }

    pub fn append_inst(&mut self, b: BlockId, i: InstId) {
        assert!(self.insts[i.0].block.is_none(), "Instruction placed twice");
        self.insts[i.0].block = Some(b);
        self.blocks[b.0].insts.push(i);
    }

    pub fn insert_before(&mut self, anchor: InstId, i: InstId) {
        assert!(self.insts[i.0].block.is_none(), "Instruction placed twice");
        let b = self.insts[anchor.0].block.expect("Anchor is detached");
        let pos = self.position_in_block(anchor);
        self.insts[i.0].block = Some(b);
        self.blocks[b.0].insts.insert(pos, i);
    }

    pub fn insert_after(&mut self, anchor: InstId, i: InstId) {
        assert!(self.insts[i.0].block.is_none(), "Instruction placed twice");
        let b = self.insts[anchor.0].block.expect("Anchor is detached");
        let pos = self.position_in_block(anchor);
        self.insts[i.0].block = Some(b);
        self.blocks[b.0].insts.insert(pos + 1, i);
    }

    /// Detach `i` from its block. Its result (if any) must have no remaining users.
    pub fn erase_inst(&mut self, i: InstId) {
        if let Some(r) = self.insts[i.0].result {
            let users = self.users(r);
            assert!(
                users.is_empty(),
                "Erasing {:?} which still has users {:?}",
                self.insts[i.0].kind,
                users
            );
        }
        let pos = self.position_in_block(i);
        let b = self.insts[i.0].block.take().unwrap();
        self.blocks[b.0].insts.remove(pos);
    }

    pub fn next_inst(&self, i: InstId) -> Option<InstId> {
        let b = self.insts[i.0].block?;
        let pos = self.position_in_block(i);
        self.blocks[b.0].insts.get(pos + 1).cloned()
    }

    pub fn prev_inst(&self, i: InstId) -> Option<InstId> {
        let b = self.insts[i.0].block?;
        let pos = self.position_in_block(i);
        if pos == 0 {
            None
        } else {
            Some(self.blocks[b.0].insts[pos - 1])
        }
    }

    /// Function containing `i`. Panics if `i` is detached.
    pub fn parent_function(&self, i: InstId) -> FuncId {
        let b = self.insts[i.0].block.expect("Detached instruction");
        self.blocks[b.0].func
    }

    /// All placed instructions of `f`, in block order
    pub fn func_insts(&self, f: FuncId) -> Vec<InstId> {
        self.funcs[f.0]
            .blocks
            .iter()
            .flat_map(|b| self.blocks[b.0].insts.iter().cloned())
            .collect()
    }

    /// All placed instructions of the module, in function then block order
    pub fn all_insts(&self) -> Vec<InstId> {
        self.functions().flat_map(|f| self.func_insts(f)).collect()
    }

    /// Placed instructions having `v` as a direct operand
    pub fn users(&self, v: ValueId) -> Vec<InstId> {
        self.all_insts()
            .into_iter()
            .filter(|&i| self.insts[i.0].kind.operands().contains(&v))
            .collect()
    }

    /// Replace each use of `old` by `new`, in the placed instructions for which `pred` holds
    pub fn replace_uses_with_if(&mut self, old: ValueId, new: ValueId, pred: impl Fn(InstId) -> bool) {
        for i in self.all_insts() {
            if !pred(i) {
                continue;
            }
            for op in self.insts[i.0].kind.operands_mut() {
                if *op == old {
                    *op = new;
                }
            }
        }
    }

    /// The function directly called by call instruction `i` (looking through constant casts of
    /// the function's address), or `None` for an indirect call or a non-call.
    pub fn called_function(&self, i: InstId) -> Option<FuncId> {
        match &self.insts[i.0].kind {
            InstKind::Call { callee, .. } => self.function_behind(*callee),
            _ => None,
        }
    }

    fn function_behind(&self, v: ValueId) -> Option<FuncId> {
        match &self.values[v.0].kind {
            ValueKind::Function(f) => Some(*f),
            ValueKind::Expr(ConstExpr::Cast {
                op: CastOp::BitCast,
                src,
            }) => self.function_behind(*src),
            _ => None,
        }
    }

    /// Name of the function directly called by `i`, if any
    pub fn called_name(&self, i: InstId) -> Option<&str> {
        self.called_function(i).map(|f| self.funcs[f.0].name.as_str())
    }

    /// Argument list of call instruction `i`
    pub fn call_args(&self, i: InstId) -> &[ValueId] {
        match &self.insts[i.0].kind {
            InstKind::Call { args, .. } => args,
            k => panic!("Expected a call, got {:?}", k),
        }
    }

    /// Walk a field-address index chain starting at `source_ty`
    pub fn field_path(&self, source_ty: TypeId, indices: &[ValueId]) -> Result<FieldPath, String> {
        if indices.is_empty() {
            return Err("Field address with no indices".into());
        }
        let mut cur = source_ty;
        let mut field = None;
        for (n, &idx) in indices.iter().enumerate().skip(1) {
            let last = n + 1 == indices.len();
            match self.types.get(cur) {
                Type::Struct { body: Some(fields), name } => {
                    let k = self.const_value(idx).ok_or_else(|| {
                        format!("Non-constant index into struct {}", name)
                    })? as usize;
                    let f = *fields
                        .get(k)
                        .ok_or_else(|| format!("Field {} out of range for {}", k, name))?;
                    if last {
                        field = Some((cur, k));
                    }
                    cur = f;
                }
                Type::Array { element, .. } => {
                    cur = *element;
                }
                _ => {
                    return Err(format!(
                        "Cannot index into {} with a field address",
                        self.types.name(cur)
                    ))
                }
            }
        }
        Ok(FieldPath { target: cur, field })
    }

    // ---------------- Validation ----------------

    pub fn confirm_valid(&self) {
        self.try_confirm_valid().unwrap()
    }

    /// Confirms structural validity of the whole module: operand types of every instruction,
    /// placement of terminators, and branch targets.
    pub fn try_confirm_valid(&self) -> Result<(), String> {
        for g in &self.globals {
            if g.internal && g.initializer.is_none() {
                return Err(format!("Internal global @{} has no initializer", g.name));
            }
        }
        for f in self.functions() {
            let func = &self.funcs[f.0];
            for &b in &func.blocks {
                let block = &self.blocks[b.0];
                if block.func != f {
                    return Err(format!("Block {} listed in the wrong function", block.name));
                }
                match block.insts.last() {
                    Some(&t) if self.insts[t.0].kind.is_terminator() => {}
                    _ => {
                        return Err(format!(
                            "Block {} of @{} does not end in a terminator",
                            block.name, func.name
                        ))
                    }
                }
                for (n, &i) in block.insts.iter().enumerate() {
                    if self.insts[i.0].block != Some(b) {
                        return Err(format!("Instruction {:?} has a stale block", i));
                    }
                    if n + 1 != block.insts.len() && self.insts[i.0].kind.is_terminator() {
                        return Err(format!(
                            "Terminator in the middle of block {} of @{}",
                            block.name, func.name
                        ));
                    }
                    self.try_confirm_valid_inst(f, i).map_err(|e| {
                        format!("In @{}, block {}: {}", func.name, block.name, e)
                    })?;
                }
            }
        }
        Ok(())
    }

    fn try_confirm_valid_inst(&self, f: FuncId, i: InstId) -> Result<(), String> {
        let inst = &self.insts[i.0];
        let t = &self.types;
        let res_ty = inst.result.map(|r| self.ty_of(r));
        let name = |ty: TypeId| t.name(ty);
        macro_rules! exp {
            ($cond:expr, $($fmt:tt)*) => {
                if !$cond {
                    return Err(format!(
                        "Got {:?}. Expected {}.",
                        inst.kind,
                        format!($($fmt)*)
                    ));
                }
            };
        }
        let needs_result = !matches!(
            inst.kind,
            InstKind::Store { .. }
                | InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Call { .. }
        );
        exp!(
            !needs_result || res_ty.is_some(),
            "a result for this operation"
        );
        for b in inst.kind.successors() {
            exp!(self.blocks[b.0].func == f, "branch targets in the same function");
        }
        match &inst.kind {
            InstKind::Cast { op, src } => {
                let (s, r) = (self.ty_of(*src), res_ty.unwrap());
                match op {
                    CastOp::BitCast => exp!(
                        (t.is_pointer(s) && t.is_pointer(r)) || t.size_of(s) == t.size_of(r),
                        "same-size bitcast between {} and {}",
                        name(s),
                        name(r)
                    ),
                    CastOp::PtrToInt => exp!(
                        t.is_pointer(s) && matches!(t.get(r), Type::Int { .. }),
                        "pointer to integer"
                    ),
                    CastOp::IntToPtr => exp!(
                        matches!(t.get(s), Type::Int { .. }) && t.is_pointer(r),
                        "integer to pointer"
                    ),
                    CastOp::ZExt | CastOp::Trunc => exp!(
                        matches!(t.get(s), Type::Int { .. }) && matches!(t.get(r), Type::Int { .. }),
                        "integer to integer"
                    ),
                }
            }
            InstKind::Cmp { lhs, rhs, .. } => {
                exp!(self.ty_of(*lhs) == self.ty_of(*rhs), "operands of the same type");
                exp!(t.is_int(res_ty.unwrap(), 1), "an i1 result");
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                exp!(t.is_int(self.ty_of(*cond), 1), "an i1 condition");
                exp!(
                    self.ty_of(*on_true) == res_ty.unwrap() && self.ty_of(*on_false) == res_ty.unwrap(),
                    "arms of type {}",
                    name(res_ty.unwrap())
                );
            }
            InstKind::Phi { incoming } => {
                for (v, b) in incoming {
                    exp!(
                        self.ty_of(*v) == res_ty.unwrap(),
                        "incoming values of type {}",
                        name(res_ty.unwrap())
                    );
                    exp!(self.blocks[b.0].func == f, "incoming blocks of the same function");
                }
            }
            InstKind::Load { addr } => {
                exp!(
                    t.pointee(self.ty_of(*addr)) == res_ty,
                    "address of type ptr<{}>",
                    name(res_ty.unwrap())
                );
            }
            InstKind::Store { value, addr } => {
                exp!(inst.result.is_none(), "no result for a store");
                exp!(
                    t.pointee(self.ty_of(*addr)) == Some(self.ty_of(*value)),
                    "address of type ptr<{}>",
                    name(self.ty_of(*value))
                );
            }
            InstKind::FieldAddr {
                source_ty,
                base,
                indices,
            } => {
                exp!(
                    t.pointee(self.ty_of(*base)) == Some(*source_ty),
                    "base of type ptr<{}>",
                    name(*source_ty)
                );
                for &idx in indices {
                    exp!(
                        matches!(t.get(self.ty_of(idx)), Type::Int { .. }),
                        "integer indices"
                    );
                }
                let path = self.field_path(*source_ty, indices)?;
                exp!(
                    t.pointee(res_ty.unwrap()) == Some(path.target),
                    "result of type ptr<{}>",
                    name(path.target)
                );
            }
            InstKind::Call { callee, args } => {
                let (ret, params) = t
                    .signature(self.ty_of(*callee))
                    .ok_or_else(|| format!("Callee of call is not a function: {:?}", inst.kind))?;
                exp!(
                    params.len() == args.len(),
                    "{} arguments",
                    params.len()
                );
                for (a, &p) in args.iter().zip(params.iter()) {
                    exp!(
                        self.ty_of(*a) == p,
                        "argument of type {}, got {}",
                        name(p),
                        name(self.ty_of(*a))
                    );
                }
                match t.get(ret) {
                    Type::Void => exp!(res_ty.is_none(), "no result from a void call"),
                    _ => exp!(res_ty == Some(ret), "a result of type {}", name(ret)),
                }
            }
            InstKind::Binary { lhs, rhs, .. } => {
                exp!(
                    self.ty_of(*lhs) == res_ty.unwrap() && self.ty_of(*rhs) == res_ty.unwrap(),
                    "operands of the result type"
                );
            }
            InstKind::Alloca { ty } => {
                exp!(t.pointee(res_ty.unwrap()) == Some(*ty), "a ptr<{}> result", name(*ty));
            }
            InstKind::Br { .. } => {}
            InstKind::CondBr { cond, .. } => {
                exp!(t.is_int(self.ty_of(*cond), 1), "an i1 condition");
            }
            InstKind::Ret { value } => {
                let (ret, _) = t.signature(self.funcs[f.0].ty).unwrap();
                match value {
                    None => exp!(matches!(t.get(ret), Type::Void), "a returned value"),
                    Some(v) => exp!(self.ty_of(*v) == ret, "a returned {}", name(ret)),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_module() -> (Module, FuncId, InstId) {
        let mut m = Module::new("test.c");
        let i64_ = m.types.i64();
        let p64 = m.types.ptr(i64_);
        let void = m.types.void();
        let fnty = m.types.func(void, vec![p64]);
        let f = m.declare_function("f", fnty, &["p"]);
        let entry = m.add_block(f, "entry");
        let p = m.function(f).params[0];
        let load = m.create_inst(InstKind::Load { addr: p }, Some((i64_, Some("x".into()))));
        m.append_inst(entry, load);
        let x = m.result(load);
        let store = m.create_inst(InstKind::Store { value: x, addr: p }, None);
        m.append_inst(entry, store);
        let ret = m.create_inst(InstKind::Ret { value: None }, None);
        m.append_inst(entry, ret);
        (m, f, store)
    }

    #[test]
    fn split_block_moves_tail_and_branches() {
        let (mut m, f, store) = simple_module();
        m.confirm_valid();
        let new = m.split_block(store, "tail");
        m.confirm_valid();
        assert_eq!(m.function(f).blocks.len(), 2);
        assert_eq!(m.block(new).insts[0], store);
        let entry = m.function(f).blocks[0];
        let last = *m.block(entry).insts.last().unwrap();
        assert_eq!(m.inst(last).kind, InstKind::Br { target: new });
    }

    #[test]
    fn users_and_replacement() {
        let (mut m, f, store) = simple_module();
        let load = m.func_insts(f)[0];
        let x = m.result(load);
        assert_eq!(m.users(x), vec![store]);
        let zero = m.const_i64(0);
        m.replace_uses_with_if(x, zero, |_| true);
        assert!(m.users(x).is_empty());
        m.erase_inst(load);
        assert_eq!(m.func_insts(f).len(), 2);
        m.confirm_valid();
    }

    #[test]
    fn invalid_store_is_reported() {
        let (mut m, _, store) = simple_module();
        let i32_ = m.types.i32();
        let c = m.const_int(i32_, 1);
        if let InstKind::Store { value, .. } = &mut m.inst_mut(store).kind {
            *value = c;
        }
        assert!(m.try_confirm_valid().is_err());
    }

    #[test]
    fn constants_are_interned_and_truncated() {
        let mut m = Module::new("test.c");
        let i8_ = m.types.i8();
        let a = m.const_int(i8_, 0x1ff);
        let b = m.const_int(i8_, 0xff);
        assert_eq!(a, b);
        assert_eq!(m.const_value(a), Some(0xff));
    }
}

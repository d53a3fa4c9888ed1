//! The textual form of a [`Module`], as read back by [`crate::parser::parse_module`].
//!
//! Values without a front-end name print as `%.N`, `N` being their index in the module.

use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, ConstExpr, FuncId, Initializer, InstId, InstKind, Module,
    ValueId, ValueKind,
};
use crate::types::Type;
use itertools::Itertools;
use std::fmt::{self, Display, Formatter};

impl CastOp {
    pub fn keyword(self) -> &'static str {
        match self {
            CastOp::BitCast => "bitcast",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
            CastOp::ZExt => "zext",
            CastOp::Trunc => "trunc",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        use CastOp::*;
        [BitCast, PtrToInt, IntToPtr, ZExt, Trunc]
            .into_iter()
            .find(|c| c.keyword() == s)
    }
}

impl CmpPred {
    pub fn keyword(self) -> &'static str {
        use CmpPred::*;
        match self {
            Eq => "eq",
            Ne => "ne",
            Ult => "ult",
            Ule => "ule",
            Ugt => "ugt",
            Uge => "uge",
            Slt => "slt",
            Sle => "sle",
            Sgt => "sgt",
            Sge => "sge",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        use CmpPred::*;
        [Eq, Ne, Ult, Ule, Ugt, Uge, Slt, Sle, Sgt, Sge]
            .into_iter()
            .find(|c| c.keyword() == s)
    }
}

impl BinOp {
    pub fn keyword(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        use BinOp::*;
        [Add, Sub, Mul, And, Or].into_iter().find(|c| c.keyword() == s)
    }
}

/// Quote `s` as a string literal
fn quoted(s: &str) -> String {
    format!("{:?}", s)
}

impl Module {
    /// The operand syntax for `v`
    pub fn value_text(&self, v: ValueId) -> String {
        let data = self.value(v);
        let ty = || self.types.name(data.ty);
        match &data.kind {
            ValueKind::Global(g) => format!("@{}", self.global(*g).name),
            ValueKind::Function(f) => format!("@{}", self.function(*f).name),
            ValueKind::ConstInt(c) => format!("{}:{}", c, ty()),
            ValueKind::Null => format!("null:{}", ty()),
            ValueKind::Undef => format!("undef:{}", ty()),
            ValueKind::Expr(ConstExpr::Cast { op, src }) => {
                format!("{}({} : {})", op.keyword(), self.value_text(*src), ty())
            }
            ValueKind::Expr(ConstExpr::FieldAddr {
                source_ty,
                base,
                indices,
            }) => format!(
                "fieldaddr({}, {}, {})",
                self.types.name(*source_ty),
                self.value_text(*base),
                indices.iter().map(|&i| self.value_text(i)).join(", ")
            ),
            ValueKind::Argument { .. } | ValueKind::Result(_) => match &data.name {
                Some(n) => format!("%{}", n),
                None => format!("%.{}", v.index()),
            },
        }
    }

    fn block_label(&self, b: BlockId) -> &str {
        &self.block(b).name
    }

    fn initializer_text(&self, init: &Initializer) -> String {
        match init {
            Initializer::Zero => "zeroinit".into(),
            Initializer::Int(n) => n.to_string(),
            Initializer::Value(v) => self.value_text(*v),
            Initializer::Aggregate(elems) => format!(
                "{{ {} }}",
                elems.iter().map(|e| self.initializer_text(e)).join(", ")
            ),
        }
    }

    /// One instruction, without indentation or trailing newline
    pub fn inst_text(&self, i: InstId) -> String {
        let inst = self.inst(i);
        let v = |x: &ValueId| self.value_text(*x);
        let body = match &inst.kind {
            InstKind::Cast { op, src } => format!("{} {}", op.keyword(), v(src)),
            InstKind::Cmp { pred, lhs, rhs } => {
                format!("icmp {} {}, {}", pred.keyword(), v(lhs), v(rhs))
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => format!("select {}, {}, {}", v(cond), v(on_true), v(on_false)),
            InstKind::Phi { incoming } => format!(
                "phi {}",
                incoming
                    .iter()
                    .map(|(x, b)| format!("[{}, {}]", v(x), self.block_label(*b)))
                    .join(", ")
            ),
            InstKind::Load { addr } => format!("load {}", v(addr)),
            InstKind::Store { value, addr } => format!("store {}, {}", v(value), v(addr)),
            InstKind::FieldAddr {
                source_ty,
                base,
                indices,
            } => format!(
                "fieldaddr {}, {}, {}",
                self.types.name(*source_ty),
                v(base),
                indices.iter().map(v).join(", ")
            ),
            InstKind::Call { callee, args } => {
                format!("call {}({})", v(callee), args.iter().map(v).join(", "))
            }
            InstKind::Binary { op, lhs, rhs } => {
                format!("{} {}, {}", op.keyword(), v(lhs), v(rhs))
            }
            InstKind::Alloca { ty } => format!("alloca {}", self.types.name(*ty)),
            InstKind::Br { target } => format!("br {}", self.block_label(*target)),
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            } => format!(
                "br {}, {}, {}",
                v(cond),
                self.block_label(*on_true),
                self.block_label(*on_false)
            ),
            InstKind::Ret { value: None } => "ret".into(),
            InstKind::Ret { value: Some(x) } => format!("ret {}", v(x)),
        };
        let mut s = match inst.result {
            Some(r) => format!("{}: {} = {}", v(&r), self.types.name(self.ty_of(r)), body),
            None => body,
        };
        if inst.instrumented {
            s.push_str(" !instrumented");
        }
        s
    }

    fn function_suffix(&self, f: FuncId) -> String {
        let func = self.function(f);
        let mut s = String::new();
        if let Some(section) = &func.section {
            s.push_str(&format!(" section {}", quoted(section)));
        }
        if !func.attrs.is_empty() {
            s.push_str(&format!(
                " attrs({})",
                func.attrs.iter().map(|a| a.keyword()).join(", ")
            ));
        }
        s
    }

    fn fmt_function(&self, f: FuncId, out: &mut Formatter) -> fmt::Result {
        let func = self.function(f);
        let (ret, params) = self
            .types
            .signature(func.ty)
            .expect("Function has a function type");
        let ret = self.types.name(ret);
        if func.is_declaration() {
            return writeln!(
                out,
                "declare @{}({}) -> {}{}",
                func.name,
                params.iter().map(|&p| self.types.name(p)).join(", "),
                ret,
                self.function_suffix(f)
            );
        }
        writeln!(
            out,
            "define @{}({}) -> {}{} {{",
            func.name,
            func.params
                .iter()
                .map(|&p| format!("{}: {}", self.value_text(p), self.types.name(self.ty_of(p))))
                .join(", "),
            ret,
            self.function_suffix(f)
        )?;
        for &b in &func.blocks {
            writeln!(out, "{}:", self.block_label(b))?;
            for &i in &self.block(b).insts {
                writeln!(out, "  {}", self.inst_text(i))?;
            }
        }
        writeln!(out, "}}")
    }
}

impl Display for Module {
    fn fmt(&self, out: &mut Formatter) -> fmt::Result {
        writeln!(out, "unit {}", quoted(&self.unit))?;
        for s in self.types.structs() {
            match self.types.get(s) {
                Type::Struct {
                    name,
                    body: Some(fields),
                } => writeln!(
                    out,
                    "struct %{} {{ {} }}",
                    name,
                    fields.iter().map(|&t| self.types.name(t)).join(", ")
                )?,
                Type::Struct { name, body: None } => writeln!(out, "struct %{} opaque", name)?,
                _ => unreachable!(),
            }
        }
        for g in self.globals() {
            let global = self.global(g);
            write!(out, "global @{} : {}", global.name, self.types.name(global.ty))?;
            if let Some(init) = &global.initializer {
                write!(out, " = {}", self.initializer_text(init))?;
            }
            if let Some(section) = &global.section {
                write!(out, " section {}", quoted(section))?;
            }
            if global.internal {
                write!(out, " internal")?;
            }
            if global.unnamed_addr {
                write!(out, " unnamed_addr")?;
            }
            writeln!(out)?;
        }
        for f in self.functions() {
            self.fmt_function(f, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_module;

    #[test]
    fn printing_is_stable_through_parsing() {
        let text = r#"unit "net/core/dev.c"
struct %struct.ops { i32, ptr<fn(i64) -> void>, [2 x i32] }
struct %struct.opaque opaque
global @g : %struct.ops = { 0, @handler, zeroinit } section ".data" internal unnamed_addr
global @p : i64 = ptrtoint(@g : i64)
declare @handler(i64) -> void
define @f(%a: i64, %p: ptr<i64>, %q: ptr<%struct.ops>) -> void section ".text" attrs(cold) {
entry:
  %x: i64 = load %p
  store %x, %p !instrumented
  %c: ptr<i8> = bitcast %p
  %fa: ptr<ptr<fn(i64) -> void>> = fieldaddr %struct.ops, %q, 0:i64, 1:i32
  %h: ptr<fn(i64) -> void> = load %fa
  call %h(%a)
  %e: i1 = icmp eq %a, 8:i64
  br %e, next, done
next:
  br done
done:
  %m: i64 = phi [%a, entry], [%x, next]
  ret
}
"#;
        let m = parse_module(text).unwrap();
        m.confirm_valid();
        let printed = m.to_string();
        let again = parse_module(&printed).unwrap().to_string();
        assert_eq!(printed, again);
        assert!(printed.contains("  store %x, %p !instrumented\n"));
        assert!(printed.contains("declare @handler(i64) -> void\n"));
        assert!(printed.contains("attrs(cold)"));
    }
}

//! The rewrite engine: consumes a [`Classification`] and its offsets, and rewrites the module so
//! that function pointer slots only ever hold address-bound ciphertext.
//!
//! The rewrite families live in their own modules ([`crate::bulk_copy`], [`crate::zero_init`],
//! [`crate::global_init`], [`crate::site_patches`]) as further `impl Instrumenter` blocks; this
//! module holds the shared state, the cipher call helpers, the load/store rewrite and the
//! parameter reordering.
//!
//! Every instruction the instrumenter produces or rewrites carries the `instrumented` marker, and
//! every rewrite skips marked instructions, which makes the whole rewrite idempotent.

use crate::annotations::AnnotationConfig;
use crate::builder::Builder;
use crate::ir::{
    BlockId, CastOp, CmpPred, ConstExpr, FnAttr, FuncId, InstId, InstKind, Module, ValueId, ValueKind,
};
use crate::log::*;
use crate::offsets::{GlobalFpRecord, OffsetResolver};
use crate::pass_config::PassConfig;
use crate::propagation::Classification;
use crate::types::{Type, TypeId, TypeTable, POINTER_SIZE};
use std::collections::BTreeSet;

/// Name of the external encryption primitive `(plaintext: i64, slot: ptr<i64>) -> i64`
pub const ENCRYPT: &str = "encrypt";
/// Name of the external decryption primitive `(ciphertext: i64, slot: ptr<i64>) -> i64`
pub const DECRYPT: &str = "decrypt";

/// The two declared cipher primitives
#[derive(Clone, Copy, Debug)]
pub struct Cipher {
    pub encrypt: FuncId,
    pub decrypt: FuncId,
}

impl Cipher {
    pub fn encrypt(&self, b: &mut Builder, plain: ValueId, slot: ValueId) -> ValueId {
        b.call_value(self.encrypt, vec![plain, slot])
    }

    pub fn decrypt(&self, b: &mut Builder, cipher: ValueId, slot: ValueId) -> ValueId {
        b.call_value(self.decrypt, vec![cipher, slot])
    }

    /// `addr`, as a `ptr<i64>`
    pub fn as_slot(&self, b: &mut Builder, addr: ValueId) -> ValueId {
        let m = b.module();
        let i64_ = m.types.i64();
        let p64 = m.types.ptr(i64_);
        let ty = m.ty_of(addr);
        if ty == p64 {
            addr
        } else {
            assert!(m.types.is_pointer(ty), "Slot address is not a pointer");
            b.bitcast(addr, p64)
        }
    }

    /// The `ptr<i64>` slot `off` bytes past `base`, which is either a pointer or a 64-bit address
    pub fn slot_at(&self, b: &mut Builder, base: ValueId, off: u64) -> ValueId {
        let m = b.module();
        let ty = m.ty_of(base);
        let is_pointer = m.types.is_pointer(ty);
        assert!(
            is_pointer || m.types.is_int(ty, 64),
            "Slot base must be a pointer or a 64-bit address"
        );
        let i64_ = m.types.i64();
        let p64 = m.types.ptr(i64_);
        let base = if is_pointer { b.ptr_to_int(base) } else { base };
        let addr = if off == 0 {
            base
        } else {
            let off = b.const_i64(off);
            b.add(base, off)
        };
        b.int_to_ptr(addr, p64)
    }

    /// Store the ciphertext of zero into the slot `off` bytes past `base`
    pub fn store_zero(&self, b: &mut Builder, base: ValueId, off: u64) {
        let slot = self.slot_at(b, base, off);
        let zero = b.const_i64(0);
        let enc = self.encrypt(b, zero, slot);
        b.store(enc, slot);
    }

    /// The slot `off` bytes past `dst` holds ciphertext bound to the same offset past `src`;
    /// re-bind it to its own address
    pub fn rekey(&self, b: &mut Builder, dst: ValueId, src: ValueId, off: u64) {
        let dslot = self.slot_at(b, dst, off);
        let sslot = self.slot_at(b, src, off);
        let stale = b.load(dslot);
        let plain = self.decrypt(b, stale, sslot);
        let enc = self.encrypt(b, plain, dslot);
        b.store(enc, dslot);
    }
}

/// The source of the bitcast (instruction or constant expression) producing `v`, if any
pub fn bitcast_source(m: &Module, v: ValueId) -> Option<ValueId> {
    match &m.value(v).kind {
        ValueKind::Expr(ConstExpr::Cast {
            op: CastOp::BitCast,
            src,
        }) => Some(*src),
        ValueKind::Result(i) => match &m.inst(*i).kind {
            InstKind::Cast {
                op: CastOp::BitCast,
                src,
            } => Some(*src),
            _ => None,
        },
        _ => None,
    }
}

/// The struct type that every bitcast of `v` to a struct pointer agrees on, if there is exactly
/// one such type
pub fn unique_struct_cast_user(m: &Module, v: ValueId) -> Option<TypeId> {
    let targets: BTreeSet<TypeId> = m
        .users(v)
        .into_iter()
        .filter(|&u| {
            matches!(
                m.inst(u).kind,
                InstKind::Cast {
                    op: CastOp::BitCast,
                    ..
                }
            )
        })
        .filter_map(|u| m.types.pointee(m.ty_of(m.result(u))))
        .filter(|&t| m.types.is_struct(t))
        .collect();
    if targets.len() == 1 {
        targets.into_iter().next()
    } else {
        None
    }
}

/// `ty` with every enclosing array peeled off
pub fn strip_arrays(types: &TypeTable, mut ty: TypeId) -> TypeId {
    while let Type::Array { element, .. } = types.get(ty) {
        ty = *element;
    }
    ty
}

fn sorted<'x>(it: impl Iterator<Item = &'x InstId>) -> Vec<InstId> {
    let mut v: Vec<InstId> = it.cloned().collect();
    v.sort();
    v
}

/// Number of rewrites of each kind
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct LoadStoreCounts {
    pub loads: usize,
    pub stores: usize,
}

/// Shared state of one module's rewrite
pub struct Instrumenter<'a> {
    pub(crate) m: &'a mut Module,
    pub(crate) c: &'a Classification,
    pub(crate) ann: &'a AnnotationConfig,
    pub(crate) cfg: &'a PassConfig,
    pub(crate) offsets: OffsetResolver<'a>,
    pub(crate) cipher: Cipher,
}

impl<'a> Instrumenter<'a> {
    /// Prepare to rewrite `m`, declaring the cipher primitives if needed
    pub fn new(
        m: &'a mut Module,
        c: &'a Classification,
        ann: &'a AnnotationConfig,
        cfg: &'a PassConfig,
    ) -> Self {
        let i64_ = m.types.i64();
        let p64 = m.types.ptr(i64_);
        let cipher = Cipher {
            encrypt: m.get_or_declare_function(ENCRYPT, i64_, vec![i64_, p64]),
            decrypt: m.get_or_declare_function(DECRYPT, i64_, vec![i64_, p64]),
        };
        Self {
            m,
            c,
            ann,
            cfg,
            offsets: OffsetResolver::new(c, ann, cfg.guard_self_referential_types),
            cipher,
        }
    }

    pub fn module(&self) -> &Module {
        self.m
    }

    /// Every function pointer slot of the globals defined in this unit
    pub fn global_records(&mut self) -> Vec<GlobalFpRecord> {
        self.offsets.global_records(self.m)
    }

    pub(crate) fn offsets_of(&mut self, ty: TypeId) -> BTreeSet<u64> {
        self.offsets.offsets_of(&self.m.types, ty)
    }

    /// Is `i` still in the module, and not produced or rewritten by instrumentation?
    pub(crate) fn is_fresh(&self, i: InstId) -> bool {
        let inst = self.m.inst(i);
        inst.block.is_some() && !inst.instrumented
    }

    /// Starting at the end of `cur`, chain one block per offset that runs `emit` only when the
    /// slot `[start + off, start + off + 8)` ends within `len`. Returns the block the chain falls
    /// through to, left without a terminator.
    pub(crate) fn guarded_slots(
        &mut self,
        mut cur: BlockId,
        name: &str,
        start: Option<ValueId>,
        len: ValueId,
        offsets: &BTreeSet<u64>,
        mut emit: impl FnMut(&mut Builder, u64),
    ) -> BlockId {
        for &off in offsets {
            let slot = self.m.add_block_after(cur, &format!("{}.slot", name));
            let next = self.m.add_block_after(slot, &format!("{}.next", name));
            let mut b = Builder::at_end(self.m, cur).instrumenting();
            let mut end = b.const_i64(off + POINTER_SIZE);
            if let Some(start) = start {
                end = b.add(start, end);
            }
            let covered = b.icmp(CmpPred::Ule, end, len);
            b.cond_br(covered, slot, next);
            let mut b = Builder::at_end(self.m, slot).instrumenting();
            emit(&mut b, off);
            b.br(next);
            cur = next;
        }
        cur
    }

    /// Direct calls not yet handled by instrumentation, with their callee's name
    pub(crate) fn fresh_calls(&self) -> Vec<(InstId, String)> {
        self.m
            .all_insts()
            .into_iter()
            .filter(|&i| self.is_fresh(i))
            .filter_map(|i| self.m.called_name(i).map(|n| (i, n.to_owned())))
            .collect()
    }

    fn skips_load_store(&self, i: InstId) -> bool {
        let f = self.m.parent_function(i);
        self.ann.skips_load_store(&self.m.function(f).name)
    }

    /// Decrypt every tag-bearing load right after it, and encrypt every tag-bearing store's value
    /// right before it
    pub fn rewrite_loads_and_stores(&mut self) -> LoadStoreCounts {
        let mut counts = LoadStoreCounts::default();
        for i in sorted(self.c.tagged_loads()) {
            if self.is_fresh(i) && !self.skips_load_store(i) && self.rewrite_load(i) {
                counts.loads += 1;
            }
        }
        for i in sorted(self.c.tagged_stores()) {
            if self.is_fresh(i) && !self.skips_load_store(i) && self.rewrite_store(i) {
                counts.stores += 1;
            }
        }
        info!("Rewrote tag-bearing loads and stores";
              "loads" => counts.loads, "stores" => counts.stores);
        counts
    }

    /// Is `ty` a slot type the cipher can operate on?
    fn slot_kind(&self, ty: TypeId) -> Option<bool> {
        if self.m.types.is_pointer(ty) {
            Some(true)
        } else if self.m.types.is_int(ty, 64) {
            Some(false)
        } else {
            None
        }
    }

    fn rewrite_load(&mut self, i: InstId) -> bool {
        let addr = match &self.m.inst(i).kind {
            InstKind::Load { addr } => *addr,
            k => panic!("Tag-bearing load is a {:?}", k),
        };
        let loaded = self.m.result(i);
        let ty = self.m.ty_of(loaded);
        let is_pointer = match self.slot_kind(ty) {
            Some(p) => p,
            None => {
                warn!("Skipping tag-bearing load of a non-scalar slot"; "type" => self.m.types.name(ty));
                return false;
            }
        };
        let cipher = self.cipher;
        let mut b = Builder::after(self.m, i).instrumenting();
        let raw = if is_pointer { b.ptr_to_int(loaded) } else { loaded };
        let slot = cipher.as_slot(&mut b, addr);
        let plain = cipher.decrypt(&mut b, raw, slot);
        let decrypt_call = b.module().producer(plain);
        let restored = if is_pointer {
            b.int_to_ptr(plain, ty)
        } else {
            plain
        };
        let raw_user = if is_pointer {
            self.m.producer(raw)
        } else {
            decrypt_call
        };
        self.m
            .replace_uses_with_if(loaded, restored, |u| Some(u) != raw_user);
        self.m.inst_mut(i).instrumented = true;
        true
    }

    fn rewrite_store(&mut self, i: InstId) -> bool {
        let (value, addr) = match &self.m.inst(i).kind {
            InstKind::Store { value, addr } => (*value, *addr),
            k => panic!("Tag-bearing store is a {:?}", k),
        };
        let ty = self.m.ty_of(value);
        let is_pointer = match self.slot_kind(ty) {
            Some(p) => p,
            None => {
                warn!("Skipping tag-bearing store of a non-scalar slot"; "type" => self.m.types.name(ty));
                return false;
            }
        };
        let cipher = self.cipher;
        let mut b = Builder::before(self.m, i).instrumenting();
        let plain = if is_pointer { b.ptr_to_int(value) } else { value };
        let slot = cipher.as_slot(&mut b, addr);
        let enc = cipher.encrypt(&mut b, plain, slot);
        let inst = self.m.inst_mut(i);
        inst.kind = InstKind::Store {
            value: enc,
            addr: slot,
        };
        inst.instrumented = true;
        true
    }

    /// For each configured function whose parameters overflow the register-passed slots and whose
    /// last parameter is a function pointer, swap the first and last parameters at the declaration
    /// and at every direct call site
    pub fn reorder_params(&mut self) -> usize {
        let mut count = 0;
        for name in self.ann.param_reorder_functions() {
            let f = match self.m.function_named(name) {
                Some(f) => f,
                None => continue,
            };
            let func = self.m.function(f);
            if func.attrs.contains(&FnAttr::FpParamsReordered) {
                continue;
            }
            let n = func.params.len();
            if n <= self.cfg.register_param_slots {
                continue;
            }
            let last = func.params[n - 1];
            if !(self.m.types.is_func_ptr(self.m.ty_of(last)) || self.c.is_tagged_fp(last)) {
                debug!("Not reordering parameters: last one is not a function pointer";
                       "function" => name);
                continue;
            }
            self.m.swap_params(f, 0, n - 1);
            let calls: Vec<InstId> = self
                .m
                .all_insts()
                .into_iter()
                .filter(|&i| self.m.called_function(i) == Some(f))
                .collect();
            for i in calls {
                if let InstKind::Call { args, .. } = &mut self.m.inst_mut(i).kind {
                    args.swap(0, n - 1);
                }
            }
            self.m.function_mut(f).attrs.insert(FnAttr::FpParamsReordered);
            debug!("Reordered parameters"; "function" => name, "params" => n);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;
    use crate::propagation::classify;

    fn instrument<T>(
        text: &str,
        ann: &AnnotationConfig,
        f: impl FnOnce(&mut Instrumenter) -> T,
    ) -> (Module, T) {
        let mut m = parse_module(text).unwrap();
        let cfg = PassConfig::default();
        let c = classify(&m, ann, &cfg);
        let r = {
            let mut ins = Instrumenter::new(&mut m, &c, ann, &cfg);
            f(&mut ins)
        };
        m.confirm_valid();
        (m, r)
    }

    const SLOTS: &str = r#"
unit "t.c"
struct %struct.ops { i64, ptr<fn(i64) -> i64> }
define @call_it(%o: ptr<%struct.ops>, %x: i64) -> i64 {
entry:
  %slot: ptr<ptr<fn(i64) -> i64>> = fieldaddr %struct.ops, %o, 0:i64, 1:i32
  %fn: ptr<fn(i64) -> i64> = load %slot
  %r: i64 = call %fn(%x)
  ret %r
}
define @set_it(%o: ptr<%struct.ops>, %h: ptr<fn(i64) -> i64>) -> void {
entry:
  %slot: ptr<ptr<fn(i64) -> i64>> = fieldaddr %struct.ops, %o, 0:i64, 1:i32
  store %h, %slot
  ret
}
"#;

    #[test]
    fn loads_are_decrypted_and_stores_encrypted() {
        let (m, counts) = instrument(SLOTS, &AnnotationConfig::new(), |ins| {
            ins.rewrite_loads_and_stores()
        });
        assert_eq!(counts, LoadStoreCounts { loads: 1, stores: 1 });
        let call_it = m.function_named("call_it").unwrap();
        let callees: Vec<&str> = m
            .func_insts(call_it)
            .into_iter()
            .filter_map(|i| m.called_name(i))
            .collect();
        assert_eq!(callees, vec![DECRYPT]);
        // The indirect call now goes through the decrypted pointer
        let fn_ = m.value_named("fn").unwrap();
        let users = m.users(fn_);
        assert_eq!(users.len(), 1);
        assert!(matches!(
            m.inst(users[0]).kind,
            InstKind::Cast {
                op: CastOp::PtrToInt,
                ..
            }
        ));
        let set_it = m.function_named("set_it").unwrap();
        let store = m
            .func_insts(set_it)
            .into_iter()
            .find(|&i| matches!(m.inst(i).kind, InstKind::Store { .. }))
            .unwrap();
        assert!(m.inst(store).instrumented);
        if let InstKind::Store { value, .. } = m.inst(store).kind {
            let producer = m.producer(value).unwrap();
            assert_eq!(m.called_name(producer), Some(ENCRYPT));
        }
    }

    #[test]
    fn skipped_functions_are_left_alone() {
        let ann = AnnotationConfig::new().with_load_store_skip_name("call_it");
        let (_, counts) = instrument(SLOTS, &ann, |ins| ins.rewrite_loads_and_stores());
        assert_eq!(counts, LoadStoreCounts { loads: 0, stores: 1 });
    }

    #[test]
    fn trailing_function_pointer_moves_first() {
        let text = r#"
unit "kernel/params.c"
declare @cb(i64) -> i64
define @parse_one(%a: i64, %b: i64, %c: i64, %h: ptr<fn(i64) -> i64>) -> i64 {
entry:
  %r: i64 = call %h(%a)
  ret %r
}
define @user() -> i64 {
entry:
  %r2: i64 = call @parse_one(1:i64, 2:i64, 3:i64, @cb)
  ret %r2
}
"#;
        let ann = AnnotationConfig::new().with_param_reorder("parse_one");
        let mut cfg = PassConfig::default();
        cfg.register_param_slots = 3;
        let mut m = parse_module(text).unwrap();
        let c = classify(&m, &ann, &cfg);
        let n = Instrumenter::new(&mut m, &c, &ann, &cfg).reorder_params();
        assert_eq!(n, 1);
        m.confirm_valid();
        let f = m.function_named("parse_one").unwrap();
        assert!(m.function(f).attrs.contains(&FnAttr::FpParamsReordered));
        assert_eq!(m.name_of(m.function(f).params[0]), Some("h"));
        let user = m.function_named("user").unwrap();
        let call = m.func_insts(user)[0];
        let cb = m.function(m.function_named("cb").unwrap()).addr;
        assert_eq!(m.call_args(call)[0], cb);

        // A second run does not swap back
        let c = classify(&m, &ann, &cfg);
        assert_eq!(Instrumenter::new(&mut m, &c, &ann, &cfg).reorder_params(), 0);
        assert_eq!(m.name_of(m.function(f).params[0]), Some("h"));
    }
}

//! Zeroed memory holding function pointer slots.
//!
//! A zero in a slot is plaintext like any other value, and would decrypt to garbage. After a
//! zeroing allocation or a zero-fill, every slot of the zeroed object is overwritten with the
//! ciphertext of zero for that slot's address.

use crate::annotations::{SitePatch, ZeroingAlloc};
use crate::builder::Builder;
use crate::bulk_copy::{as_byte_ptr, as_i64};
use crate::instrument::{bitcast_source, unique_struct_cast_user, Instrumenter};
use crate::ir::{CastOp, CmpPred, InstId, InstKind, ValueId};
use crate::log::*;
use crate::types::{TypeId, POINTER_SIZE};
use std::collections::BTreeSet;

/// Number of rewrites of each kind
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ZeroInitCounts {
    pub allocations: usize,
    pub fills: usize,
}

impl<'a> Instrumenter<'a> {
    /// Name of the function and block containing `i`
    pub(crate) fn site_of(&self, i: InstId) -> (&str, &str) {
        let f = self.m.parent_function(i);
        let b = self.m.inst(i).block.expect("Placed instruction");
        (&self.m.function(f).name, &self.m.block(b).name)
    }

    fn struct_override(&self, i: InstId, for_alloc: bool) -> Option<TypeId> {
        let (here_function, here_block) = self.site_of(i);
        self.ann.site_patches().iter().find_map(|p| {
            let (f, b, s) = match p {
                SitePatch::AllocType {
                    function,
                    block,
                    struct_name,
                } if for_alloc => (function, block, struct_name),
                SitePatch::ZeroFillType {
                    function,
                    block,
                    struct_name,
                } if !for_alloc => (function, block, struct_name),
                _ => return None,
            };
            if f == here_function && b == here_block {
                self.m.types.struct_named(s)
            } else {
                None
            }
        })
    }

    fn zeroes_memory(&self, call: InstId, kind: ZeroingAlloc) -> bool {
        match kind {
            ZeroingAlloc::Always => true,
            ZeroingAlloc::OnFlag { flag_arg, bit } => {
                match self.m.call_args(call).get(flag_arg) {
                    Some(&flag) => self.m.const_value(flag).map_or(true, |c| c & bit != 0),
                    None => false,
                }
            }
        }
    }

    /// Encrypted zeroes after every zeroing allocation and zero-fill of an object with function
    /// pointer slots
    pub fn rewrite_zero_inits(&mut self) -> ZeroInitCounts {
        let mut counts = ZeroInitCounts::default();
        for (call, name) in self.fresh_calls() {
            if let Some(kind) = self.ann.zeroing_alloc(&name) {
                if self.zeroes_memory(call, kind) && self.rewrite_allocation(call) {
                    counts.allocations += 1;
                }
            } else if self.ann.is_zero_fill(&name) && self.rewrite_fill(call) {
                counts.fills += 1;
            }
        }
        info!("Rewrote zero initializations";
              "allocations" => counts.allocations, "fills" => counts.fills);
        counts
    }

    fn rewrite_allocation(&mut self, call: InstId) -> bool {
        let ptr = match self.m.inst(call).result {
            Some(r) => r,
            None => return false,
        };
        let ty = self
            .struct_override(call, true)
            .or_else(|| unique_struct_cast_user(self.m, ptr));
        let offsets = match ty {
            Some(ty) => self.offsets_of(ty),
            None => return false,
        };
        if offsets.is_empty() {
            return false;
        }
        self.m.inst_mut(call).instrumented = true;
        self.zero_init_if_nonnull(call, ptr, &offsets);
        true
    }

    /// After `anchor`, if `ptr` is not null, store encrypted zeroes at each of `offsets` past it
    pub(crate) fn zero_init_if_nonnull(&mut self, anchor: InstId, ptr: ValueId, offsets: &BTreeSet<u64>) {
        let cipher = self.cipher;
        let next = self
            .m
            .next_inst(anchor)
            .expect("Allocation should not end its block");
        let head = self.m.inst(anchor).block.expect("Allocation is placed");
        let tail = self.m.split_block(next, "fpguard.zero.end");
        let init = self.m.add_block_after(head, "fpguard.zero.init");
        let br = *self.m.block(head).insts.last().expect("Split leaves a branch");
        self.m.erase_inst(br);

        let ty = self.m.ty_of(ptr);
        let null = self.m.null(ty);
        let mut b = Builder::at_end(self.m, head).instrumenting();
        let nonnull = b.icmp(CmpPred::Ne, ptr, null);
        b.cond_br(nonnull, init, tail);

        let mut b = Builder::at_end(self.m, init).instrumenting();
        for &off in offsets {
            cipher.store_zero(&mut b, ptr, off);
        }
        b.br(tail);
    }

    /// The zeroed object's type, for a zero-fill of `dst`
    fn filled_type(&self, call: InstId, dst: ValueId) -> Option<TypeId> {
        if let Some(ty) = self.struct_override(call, false) {
            return Some(ty);
        }
        let m = &*self.m;
        if let Some(src) = bitcast_source(m, dst) {
            m.types.pointee(m.ty_of(src))
        } else if m.producer(dst).is_some() {
            unique_struct_cast_user(m, dst)
        } else {
            None
        }
    }

    /// Offsets of a fixed-size zero-fill right after a cast of a value with a known name prefix
    fn prefixed_fill_offsets(&self, call: InstId, len: Option<u64>) -> BTreeSet<u64> {
        let m = &*self.m;
        let cast_src = match m.prev_inst(call).map(|p| &m.inst(p).kind) {
            Some(InstKind::Cast {
                op: CastOp::BitCast,
                src,
            }) => *src,
            _ => return BTreeSet::new(),
        };
        let name = m.name_of(cast_src).unwrap_or("");
        self.ann
            .site_patches()
            .iter()
            .filter_map(|p| match p {
                SitePatch::PrefixedZeroFill {
                    value_prefix,
                    len: l,
                    offset,
                } if Some(*l) == len && name.starts_with(value_prefix.as_str()) => Some(*offset),
                _ => None,
            })
            .collect()
    }

    fn rewrite_fill(&mut self, call: InstId) -> bool {
        let (function, _) = self.site_of(call);
        if self.ann.zero_fill_excluded(function) {
            return false;
        }
        let (dst, value, len) = match self.m.call_args(call) {
            [dst, value, len, ..] => (*dst, *value, *len),
            _ => return false,
        };
        if self.m.const_value(value) != Some(0) {
            return false;
        }
        let const_len = self.m.const_value(len);
        let mut offsets = match self.filled_type(call, dst) {
            Some(ty) => self.offsets_of(ty),
            None => BTreeSet::new(),
        };
        if offsets.is_empty() {
            offsets = self.prefixed_fill_offsets(call, const_len);
        }
        if let Some(len) = const_len {
            offsets.retain(|&o| o + POINTER_SIZE <= len);
        }
        if offsets.is_empty() {
            return false;
        }

        let cipher = self.cipher;
        let i8_ = self.m.types.i8();
        let p8 = self.m.types.ptr(i8_);
        let i32_ = self.m.types.i32();
        let i64_ = self.m.types.i64();
        let replacement = self.ann.zero_fill_replacement();
        let memset = self.m.get_or_declare_function(replacement, p8, vec![p8, i32_, i64_]);
        let mut b = Builder::after(self.m, call).instrumenting();
        let dst8 = as_byte_ptr(&mut b, dst);
        let zero = b.module().const_int(i32_, 0);
        let len = as_i64(&mut b, len);
        let fill = b.call(memset, vec![dst8, zero, len]);
        self.m.erase_inst(call);
        if const_len.is_some() {
            let mut b = Builder::after(self.m, fill).instrumenting();
            for &off in &offsets {
                cipher.store_zero(&mut b, dst, off);
            }
        } else {
            self.zero_slots_within(fill, dst, len, &offsets);
        }
        true
    }

    /// After `fill`, store encrypted zeroes at each of `offsets` past `dst` whose slot ends within
    /// the runtime length `len`
    fn zero_slots_within(&mut self, fill: InstId, dst: ValueId, len: ValueId, offsets: &BTreeSet<u64>) {
        let cipher = self.cipher;
        let next = self
            .m
            .next_inst(fill)
            .expect("Zero-fill should not end its block");
        let head = self.m.inst(fill).block.expect("Zero-fill is placed");
        let tail = self.m.split_block(next, "fpguard.fill.end");
        let br = *self.m.block(head).insts.last().expect("Split leaves a branch");
        self.m.erase_inst(br);
        let last = self.guarded_slots(head, "fpguard.fill", None, len, offsets, |b, off| {
            cipher.store_zero(b, dst, off)
        });
        Builder::at_end(self.m, last).instrumenting().br(tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationConfig;
    use crate::ir::Module;
    use crate::parser::parse_module;
    use crate::pass_config::PassConfig;
    use crate::propagation::classify;

    fn rewrite(text: &str, ann: &AnnotationConfig) -> (Module, ZeroInitCounts) {
        let mut m = parse_module(text).unwrap();
        let cfg = PassConfig::default();
        let c = classify(&m, ann, &cfg);
        let n = Instrumenter::new(&mut m, &c, ann, &cfg).rewrite_zero_inits();
        m.confirm_valid();
        (m, n)
    }

    fn callees(m: &Module, f: &str) -> Vec<String> {
        let f = m.function_named(f).unwrap();
        m.func_insts(f)
            .into_iter()
            .filter_map(|i| m.called_name(i).map(|s| s.to_owned()))
            .collect()
    }

    const ZEROED: &str = r#"
unit "t.c"
struct %struct.ops { i64, ptr<fn() -> void>, ptr<fn() -> void> }
declare @kzalloc(i64, i32) -> ptr<i8>
declare @__kmalloc(i64, i32) -> ptr<i8>
declare @llvm.memset.p0i8.i64(ptr<i8>, i8, i64, i1) -> void
define @make() -> ptr<%struct.ops> {
entry:
  %p: ptr<i8> = call @kzalloc(24:i64, 3264:i32)
  %o: ptr<%struct.ops> = bitcast %p
  ret %o
}
define @make_flagged(%gfp: i32) -> ptr<%struct.ops> {
entry:
  %p: ptr<i8> = call @__kmalloc(24:i64, 3520:i32)
  %q: ptr<i8> = call @__kmalloc(24:i64, 3264:i32)
  %r: ptr<i8> = call @__kmalloc(24:i64, %gfp)
  %o: ptr<%struct.ops> = bitcast %p
  %o2: ptr<%struct.ops> = bitcast %q
  %o3: ptr<%struct.ops> = bitcast %r
  ret %o
}
define @clear(%o: ptr<%struct.ops>) -> void {
entry:
  %b: ptr<i8> = bitcast %o
  call @llvm.memset.p0i8.i64(%b, 0:i8, 16:i64, 0:i1)
  ret
}
define @fill(%o: ptr<%struct.ops>) -> void {
entry:
  %b: ptr<i8> = bitcast %o
  call @llvm.memset.p0i8.i64(%b, 1:i8, 24:i64, 0:i1)
  ret
}
"#;

    #[test]
    fn zeroing_allocations_get_guarded_encrypted_zeroes() {
        let (m, counts) = rewrite(ZEROED, &AnnotationConfig::new());
        assert_eq!(counts.allocations, 3);
        let make = m.function_named("make").unwrap();
        let names: Vec<&str> = m
            .function(make)
            .blocks
            .iter()
            .map(|&b| m.block(b).name.as_str())
            .collect();
        assert_eq!(names, vec!["entry", "fpguard.zero.init", "fpguard.zero.end"]);
        assert_eq!(callees(&m, "make"), vec!["kzalloc", "encrypt", "encrypt"]);
        // 0xcc0 lacks the zeroing bit
        assert_eq!(
            callees(&m, "make_flagged")
                .iter()
                .filter(|c| *c == "encrypt")
                .count(),
            4
        );
    }

    #[test]
    fn zero_fills_are_replaced_and_truncated() {
        let (m, counts) = rewrite(ZEROED, &AnnotationConfig::new());
        assert_eq!(counts.fills, 1);
        // Only the slot at 8 lies within the 16 cleared bytes
        assert_eq!(callees(&m, "clear"), vec!["__memset", "encrypt"]);
        assert_eq!(
            callees(&m, "fill"),
            vec!["llvm.memset.p0i8.i64".to_string()]
        );
    }

    #[test]
    fn zero_fill_exclusions_and_prefixed_fills() {
        let text = r#"
unit "lib/xarray.c"
declare @llvm.memset.p0i8.i64(ptr<i8>, i8, i64, i1) -> void
define @radix_tree_node_rcu_free(%b: ptr<i8>) -> void {
entry:
  call @llvm.memset.p0i8.i64(%b, 0:i8, 16:i64, 0:i1)
  ret
}
define @xa_init(%xa_alloc.x: ptr<i64>) -> void {
entry:
  %b: ptr<i8> = bitcast %xa_alloc.x
  call @llvm.memset.p0i8.i64(%b, 0:i8, 16:i64, 0:i1)
  ret
}
"#;
        let ann = AnnotationConfig::kernel();
        let (m, counts) = rewrite(text, &ann);
        assert_eq!(counts.fills, 1);
        assert_eq!(
            callees(&m, "radix_tree_node_rcu_free"),
            vec!["llvm.memset.p0i8.i64".to_string()]
        );
        assert_eq!(callees(&m, "xa_init"), vec!["__memset", "encrypt"]);
    }
}

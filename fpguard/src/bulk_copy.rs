//! Bulk copies of memory holding function pointer slots.
//!
//! A byte-wise copy moves ciphertext bound to the source address into the destination, where it
//! no longer decrypts. After each such copy, a loop walks the copied range element by element and
//! re-binds every slot to its new address. The per-processor replica setup gets a call to the
//! replica copy hook after its first copy, for the same reason.

use crate::annotations::CopyRoutine;
use crate::builder::Builder;
use crate::instrument::{bitcast_source, strip_arrays, Instrumenter};
use crate::ir::{CastOp, CmpPred, InstId, InstKind, ValueId};
use crate::log::*;
use crate::types::{Type, TypeId, POINTER_SIZE};
use std::collections::BTreeSet;

/// Name of the per-processor replica copy hook `(dst: ptr<i8>, src: ptr<i8>) -> void`, called
/// once per replica by the setup code
pub const PERCPU_COPY_HOOK: &str = "fpguard_percpu_copy";

struct CopySite {
    call: InstId,
    dst: ValueId,
    src: ValueId,
    len: ValueId,
    routine: CopyRoutine,
}

impl<'a> Instrumenter<'a> {
    /// The object type behind a copy operand, looking through pointer casts and arrays
    fn copied_type(&self, v: ValueId, is_result: bool) -> Option<TypeId> {
        let m = &*self.m;
        let ptr = if let Some(src) = bitcast_source(m, v) {
            src
        } else if is_result {
            m.users(v)
                .into_iter()
                .find(|&u| {
                    matches!(
                        m.inst(u).kind,
                        InstKind::Cast {
                            op: CastOp::BitCast,
                            ..
                        }
                    )
                })
                .map_or(v, |u| m.result(u))
        } else {
            v
        };
        m.types
            .pointee(m.ty_of(ptr))
            .map(|t| strip_arrays(&m.types, t))
    }

    fn copy_sites(&self) -> Vec<CopySite> {
        self.fresh_calls()
            .into_iter()
            .filter_map(|(call, name)| {
                let routine = self.ann.copy_routine(&name)?;
                let args = self.m.call_args(call);
                let (dst, src, len) = match routine {
                    CopyRoutine::Duplicate => (self.m.inst(call).result?, *args.first()?, *args.get(1)?),
                    _ => (*args.first()?, *args.get(1)?, *args.get(2)?),
                };
                Some(CopySite {
                    call,
                    dst,
                    src,
                    len,
                    routine,
                })
            })
            .collect()
    }

    /// Insert the replica copy hook after the first bulk copy of each per-processor setup
    /// function. Returns the number of hooks inserted.
    pub fn insert_percpu_copy_hooks(&mut self) -> usize {
        if !self.ann.is_percpu_setup_unit(&self.m.unit) {
            return 0;
        }
        let mut count = 0;
        for f in self.m.functions().collect::<Vec<_>>() {
            if !self.ann.is_percpu_setup_function(&self.m.function(f).name) {
                continue;
            }
            let insts = self.m.func_insts(f);
            if insts
                .iter()
                .any(|&i| self.m.called_name(i) == Some(PERCPU_COPY_HOOK))
            {
                continue;
            }
            let first_copy = insts.into_iter().find(|&i| {
                self.m
                    .called_name(i)
                    .map_or(false, |n| self.ann.is_copy_intrinsic(n))
            });
            let call = match first_copy {
                Some(c) => c,
                None => {
                    debug!("No bulk copy in per-processor setup function";
                           "function" => &self.m.function(f).name);
                    continue;
                }
            };
            let (dst, src) = {
                let args = self.m.call_args(call);
                (args[0], args[1])
            };
            let i8_ = self.m.types.i8();
            let p8 = self.m.types.ptr(i8_);
            let void = self.m.types.void();
            let hook = self.m.get_or_declare_function(PERCPU_COPY_HOOK, void, vec![p8, p8]);
            let mut b = Builder::after(self.m, call).instrumenting();
            let dst = as_byte_ptr(&mut b, dst);
            let src = as_byte_ptr(&mut b, src);
            b.call(hook, vec![dst, src]);
            count += 1;
        }
        count
    }

    /// Re-key the function pointer slots moved by every bulk copy. Returns the number of copies
    /// rewritten.
    pub fn rewrite_bulk_copies(&mut self) -> usize {
        let mut count = 0;
        for site in self.copy_sites() {
            if self.rewrite_copy(site) {
                count += 1;
            }
        }
        info!("Rewrote bulk copies"; "count" => count);
        count
    }

    fn rewrite_copy(&mut self, site: CopySite) -> bool {
        let is_dup = site.routine == CopyRoutine::Duplicate;
        let dty = self.copied_type(site.dst, is_dup);
        let sty = self.copied_type(site.src, false);
        let doffs = dty.map(|t| self.offsets_of(t)).unwrap_or_default();
        let soffs = sty.map(|t| self.offsets_of(t)).unwrap_or_default();
        if doffs.is_empty() && soffs.is_empty() {
            return false;
        }
        let mut offsets = if soffs.len() > doffs.len() { soffs } else { doffs };
        let const_len = self.m.const_value(site.len);
        if let Some(len) = const_len {
            offsets.retain(|&o| o + POINTER_SIZE <= len);
        }
        if offsets.is_empty() {
            return false;
        }
        let step = [dty, sty]
            .iter()
            .flatten()
            .filter_map(|&t| self.m.types.size_of(t))
            .max()
            .unwrap_or(POINTER_SIZE)
            .max(1);

        let call = match &site.routine {
            CopyRoutine::Intrinsic { replacement } => self.replace_intrinsic(&site, replacement),
            CopyRoutine::Plain | CopyRoutine::Duplicate => site.call,
        };
        self.m.inst_mut(call).instrumented = true;
        self.emit_rekey_loop(call, site.dst, site.src, site.len, &offsets, step);
        trace!("Rewrote bulk copy";
               "function" => &self.m.function(self.m.parent_function(call)).name,
               "offsets" => ?offsets, "step" => step);
        true
    }

    /// Replace an intrinsic copy by a call to the plain routine `replacement`
    fn replace_intrinsic(&mut self, site: &CopySite, replacement: &str) -> InstId {
        let i8_ = self.m.types.i8();
        let p8 = self.m.types.ptr(i8_);
        let i64_ = self.m.types.i64();
        let f = self.m.get_or_declare_function(replacement, p8, vec![p8, p8, i64_]);
        let mut b = Builder::after(self.m, site.call).instrumenting();
        let dst = as_byte_ptr(&mut b, site.dst);
        let src = as_byte_ptr(&mut b, site.src);
        let len = as_i64(&mut b, site.len);
        let new = b.call(f, vec![dst, src, len]);
        self.m.erase_inst(site.call);
        new
    }

    /// Split the block after `call`, and loop over the copied range in `step`-sized elements,
    /// re-keying every slot at `offsets` within an element. Unless the length is known to cover
    /// whole elements, each slot is only re-keyed if it lies entirely within the copied range.
    fn emit_rekey_loop(
        &mut self,
        call: InstId,
        dst: ValueId,
        src: ValueId,
        len: ValueId,
        offsets: &BTreeSet<u64>,
        step: u64,
    ) {
        let cipher = self.cipher;
        let i64_ = self.m.types.i64();
        let whole_elements = self.m.const_value(len).map_or(false, |l| l % step == 0);
        let (counter, len) = {
            let mut b = Builder::before(self.m, call).instrumenting();
            let len = as_i64(&mut b, len);
            let counter = b.alloca(i64_);
            let zero = b.const_i64(0);
            b.store(zero, counter);
            (counter, len)
        };
        let next = self
            .m
            .next_inst(call)
            .expect("Copy call should not end its block");
        let head = self.m.inst(call).block.expect("Copy call is placed");
        let tail = self.m.split_block(next, "fpguard.copy.end");
        let cond = self.m.add_block_after(head, "fpguard.copy.cond");
        let body = self.m.add_block_after(cond, "fpguard.copy.body");
        let br = *self.m.block(head).insts.last().expect("Split leaves a branch");
        self.m.inst_mut(br).kind = InstKind::Br { target: cond };
        self.m.inst_mut(br).instrumented = true;

        let mut b = Builder::at_end(self.m, cond).instrumenting();
        let k = b.load(counter);
        let more = b.icmp(CmpPred::Ult, k, len);
        b.cond_br(more, body, tail);

        let mut b = Builder::at_end(self.m, body).instrumenting();
        let k = b.load(counter);
        let dst_base = b.ptr_to_int(dst);
        let dst_elem = b.add(dst_base, k);
        let src_base = b.ptr_to_int(src);
        let src_elem = b.add(src_base, k);
        let last = if whole_elements {
            for &off in offsets {
                cipher.rekey(&mut b, dst_elem, src_elem, off);
            }
            body
        } else {
            self.guarded_slots(body, "fpguard.copy", Some(k), len, offsets, |b, off| {
                cipher.rekey(b, dst_elem, src_elem, off)
            })
        };

        let mut b = Builder::at_end(self.m, last).instrumenting();
        let step = b.const_i64(step);
        let k_next = b.add(k, step);
        b.store(k_next, counter);
        b.br(cond);
    }
}

/// `v`, as a `ptr<i8>`
pub(crate) fn as_byte_ptr(b: &mut Builder, v: ValueId) -> ValueId {
    let m = b.module();
    let i8_ = m.types.i8();
    let p8 = m.types.ptr(i8_);
    if m.ty_of(v) == p8 {
        v
    } else {
        b.bitcast(v, p8)
    }
}

/// `v`, zero-extended to 64 bits
pub(crate) fn as_i64(b: &mut Builder, v: ValueId) -> ValueId {
    let m = b.module();
    let i64_ = m.types.i64();
    let bits = match m.types.get(m.ty_of(v)) {
        Type::Int { bits } => *bits,
        t => panic!("Length of non-integer type {:?}", t),
    };
    if bits == 64 {
        return v;
    }
    if let Some(c) = m.const_value(v) {
        return m.const_i64(c);
    }
    b.zext(v, i64_)
}

#[cfg(test)]
mod tests {
    use crate::annotations::AnnotationConfig;
    use crate::instrument::Instrumenter;
    use crate::ir::Module;
    use crate::parser::parse_module;
    use crate::pass_config::PassConfig;
    use crate::propagation::classify;

    fn rewrite(text: &str, ann: &AnnotationConfig) -> (Module, usize) {
        let mut m = parse_module(text).unwrap();
        let cfg = PassConfig::default();
        let c = classify(&m, ann, &cfg);
        let n = Instrumenter::new(&mut m, &c, ann, &cfg).rewrite_bulk_copies();
        m.confirm_valid();
        (m, n)
    }

    const COPY: &str = r#"
unit "t.c"
struct %struct.ops { i64, ptr<fn() -> void>, i64 }
declare @llvm.memcpy.p0i8.p0i8.i64(ptr<i8>, ptr<i8>, i64, i1) -> void
declare @kmemdup(ptr<i8>, i64, i32) -> ptr<i8>
define @clone(%d: ptr<%struct.ops>, %s: ptr<%struct.ops>) -> void {
entry:
  %d8: ptr<i8> = bitcast %d
  %s8: ptr<i8> = bitcast %s
  call @llvm.memcpy.p0i8.p0i8.i64(%d8, %s8, 24:i64, 0:i1)
  ret
}
define @dup(%s: ptr<%struct.ops>) -> ptr<%struct.ops> {
entry:
  %s8: ptr<i8> = bitcast %s
  %n: ptr<i8> = call @kmemdup(%s8, 24:i64, 3264:i32)
  %o: ptr<%struct.ops> = bitcast %n
  ret %o
}
define @bytes(%d: ptr<i8>, %s: ptr<i8>) -> void {
entry:
  call @llvm.memcpy.p0i8.p0i8.i64(%d, %s, 16:i64, 0:i1)
  ret
}
"#;

    #[test]
    fn typed_copies_get_a_rekey_loop() {
        let (m, n) = rewrite(COPY, &AnnotationConfig::new());
        assert_eq!(n, 2);
        let clone = m.function_named("clone").unwrap();
        let names: Vec<&str> = m
            .function(clone)
            .blocks
            .iter()
            .map(|&b| m.block(b).name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["entry", "fpguard.copy.cond", "fpguard.copy.body", "fpguard.copy.end"]
        );
        let callees: Vec<&str> = m
            .func_insts(clone)
            .into_iter()
            .filter_map(|i| m.called_name(i))
            .collect();
        assert_eq!(callees, vec!["__memcpy", "decrypt", "encrypt"]);
        let bytes = m.function_named("bytes").unwrap();
        assert_eq!(m.function(bytes).blocks.len(), 1);
    }

    #[test]
    fn rewriting_twice_changes_nothing() {
        let (mut m, _) = rewrite(COPY, &AnnotationConfig::new());
        let before = m.to_string();
        let ann = AnnotationConfig::new();
        let cfg = PassConfig::default();
        let c = classify(&m, &ann, &cfg);
        let n = Instrumenter::new(&mut m, &c, &ann, &cfg).rewrite_bulk_copies();
        assert_eq!(n, 0);
        assert_eq!(m.to_string(), before);
    }

    #[test]
    fn percpu_hook_follows_first_copy() {
        let text = r#"
unit "mm/percpu.c"
declare @llvm.memcpy.p0i8.p0i8.i64(ptr<i8>, ptr<i8>, i64, i1) -> void
define @pcpu_embed_first_chunk(%d: ptr<i8>, %s: ptr<i8>, %n: i64) -> void {
entry:
  call @llvm.memcpy.p0i8.p0i8.i64(%d, %s, %n, 0:i1)
  call @llvm.memcpy.p0i8.p0i8.i64(%s, %d, %n, 0:i1)
  ret
}
"#;
        let ann = AnnotationConfig::new()
            .with_percpu_setup("mm/percpu.c", &["pcpu_embed_first_chunk"]);
        let mut m = parse_module(text).unwrap();
        let cfg = PassConfig::default();
        let c = classify(&m, &ann, &cfg);
        let mut ins = Instrumenter::new(&mut m, &c, &ann, &cfg);
        assert_eq!(ins.insert_percpu_copy_hooks(), 1);
        assert_eq!(ins.insert_percpu_copy_hooks(), 0);
        let f = m.function_named("pcpu_embed_first_chunk").unwrap();
        let callees: Vec<&str> = m
            .func_insts(f)
            .into_iter()
            .filter_map(|i| m.called_name(i))
            .collect();
        assert_eq!(
            callees,
            vec![
                "llvm.memcpy.p0i8.p0i8.i64",
                super::PERCPU_COPY_HOOK,
                "llvm.memcpy.p0i8.p0i8.i64"
            ]
        );
    }
}

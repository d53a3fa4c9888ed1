//! The named-site catalogue: allocation and copy patterns that the type and tag driven rewrites
//! cannot see through, such as an allocation whose type only appears after a later cast, or a
//! reallocation whose old and new objects are both live across the call.
//!
//! Every patch fails soft. When its unit, function, block or instruction cannot be found, it logs
//! at debug level and leaves the module untouched.

use crate::annotations::{CopyRoutine, SitePatch};
use crate::builder::Builder;
use crate::instrument::Instrumenter;
use crate::ir::{BlockId, FuncId, InstId, InstKind, ValueId};
use crate::log::*;
use std::collections::BTreeSet;

impl<'a> Instrumenter<'a> {
    /// Apply every catalogue entry matching this unit. Returns the number of sites patched.
    pub fn apply_site_patches(&mut self) -> usize {
        let ann = self.ann;
        let mut count = 0;
        for p in ann.site_patches() {
            let patched = match p {
                SitePatch::ZeroInitAtNamedValues {
                    unit,
                    function,
                    struct_name,
                    sites,
                } => self
                    .site_function(unit, function)
                    .map_or(0, |f| self.zero_init_at_named_values(f, struct_name, sites)),
                SitePatch::StagedRealloc {
                    unit,
                    function,
                    block,
                    routine,
                    struct_name,
                } => self
                    .site_block(unit, function, block)
                    .map_or(0, |b| self.staged_realloc(b, routine, struct_name)),
                SitePatch::ZeroInitAfterNamedCast {
                    unit,
                    function,
                    block,
                    value,
                } => self
                    .site_block(unit, function, block)
                    .map_or(0, |b| self.zero_init_after_named_cast(b, value)),
                SitePatch::ZeroInitAfterAllocCast {
                    unit,
                    function,
                    block,
                    routine,
                } => self
                    .site_block(unit, function, block)
                    .map_or(0, |b| self.zero_init_after_alloc_cast(b, routine)),
                SitePatch::ZeroInitAfterStructCast {
                    unit,
                    function,
                    block,
                    struct_name,
                } => self
                    .site_block(unit, function, block)
                    .map_or(0, |b| self.zero_init_after_struct_cast(b, struct_name)),
                SitePatch::RekeyAfterCopy {
                    unit,
                    function,
                    routine,
                    struct_name,
                } => self
                    .site_function(unit, function)
                    .map_or(0, |f| self.rekey_after_copy(f, routine, struct_name)),
                // Consulted by the zero-initialization rewrite itself
                SitePatch::AllocType { .. }
                | SitePatch::ZeroFillType { .. }
                | SitePatch::PrefixedZeroFill { .. } => 0,
            };
            if patched > 0 {
                debug!("Applied site patch"; "patch" => ?p, "sites" => patched);
            }
            count += patched;
        }
        info!("Applied named-site patches"; "sites" => count);
        count
    }

    fn site_function(&self, unit: &str, function: &str) -> Option<FuncId> {
        if !self.m.unit.contains(unit) {
            return None;
        }
        let f = self.m.function_named(function);
        if f.is_none() {
            debug!("Site patch function not found"; "unit" => unit, "function" => function);
        }
        f
    }

    fn site_block(&self, unit: &str, function: &str, block: &str) -> Option<BlockId> {
        let f = self.site_function(unit, function)?;
        let b = self.m.block_named(f, block);
        if b.is_none() {
            debug!("Site patch block not found"; "function" => function, "block" => block);
        }
        b
    }

    fn struct_offsets(&mut self, struct_name: &str) -> Option<BTreeSet<u64>> {
        let ty = match self.m.types.struct_named(struct_name) {
            Some(ty) => ty,
            None => {
                debug!("Site patch struct not found"; "struct" => struct_name);
                return None;
            }
        };
        let offsets = self.offsets_of(ty);
        if offsets.is_empty() {
            None
        } else {
            Some(offsets)
        }
    }

    /// Store encrypted zeroes right after `anchor`, unless that was done already
    fn zero_init_after(&mut self, anchor: InstId, base: ValueId, offsets: &BTreeSet<u64>) -> usize {
        if self
            .m
            .next_inst(anchor)
            .map_or(false, |n| self.m.inst(n).instrumented)
        {
            return 0;
        }
        let cipher = self.cipher;
        let mut b = Builder::after(self.m, anchor).instrumenting();
        for &off in offsets {
            cipher.store_zero(&mut b, base, off);
        }
        1
    }

    fn first_call_in(&self, b: BlockId, routine: &str) -> Option<InstId> {
        self.m
            .block(b)
            .insts
            .iter()
            .cloned()
            .find(|&i| self.m.called_name(i) == Some(routine))
    }

    fn first_cast_in(&self, b: BlockId, pred: impl Fn(ValueId, ValueId) -> bool) -> Option<InstId> {
        self.m.block(b).insts.iter().cloned().find(|&i| match &self.m.inst(i).kind {
            InstKind::Cast { src, .. } => pred(*src, self.m.result(i)),
            _ => false,
        })
    }

    fn zero_init_at_named_values(
        &mut self,
        f: FuncId,
        struct_name: &str,
        sites: &[(String, String)],
    ) -> usize {
        let offsets = match self.struct_offsets(struct_name) {
            Some(o) => o,
            None => return 0,
        };
        let cipher = self.cipher;
        let mut count = 0;
        for (block, value) in sites {
            let b = self.m.block_named(f, block);
            let base = self
                .m
                .func_insts(f)
                .into_iter()
                .filter_map(|i| self.m.inst(i).result)
                .find(|&r| self.m.name_of(r) == Some(value.as_str()));
            let (b, base) = match (b, base) {
                (Some(b), Some(base)) => (b, base),
                _ => {
                    debug!("Site patch value or block not found"; "block" => block, "value" => value);
                    continue;
                }
            };
            let first = match self.m.block(b).insts.first() {
                Some(&i) => i,
                None => continue,
            };
            if self.m.inst(first).instrumented {
                continue;
            }
            let mut bld = Builder::before(self.m, first).instrumenting();
            for &off in &offsets {
                cipher.store_zero(&mut bld, base, off);
            }
            count += 1;
        }
        count
    }

    fn staged_realloc(&mut self, b: BlockId, routine: &str, struct_name: &str) -> usize {
        let call = match self.first_call_in(b, routine) {
            Some(c) if !self.m.inst(c).instrumented => c,
            Some(_) => return 0,
            None => {
                debug!("Reallocation not found"; "routine" => routine);
                return 0;
            }
        };
        let offsets = match self.struct_offsets(struct_name) {
            Some(o) => o,
            None => return 0,
        };
        let old = self.m.call_args(call)[0];
        let new = self.m.result(call);
        let cipher = self.cipher;
        let plains: Vec<(u64, ValueId)> = {
            let mut bld = Builder::before(self.m, call).instrumenting();
            offsets
                .iter()
                .map(|&off| {
                    let slot = cipher.slot_at(&mut bld, old, off);
                    let stale = bld.load(slot);
                    (off, cipher.decrypt(&mut bld, stale, slot))
                })
                .collect()
        };
        let mut bld = Builder::after(self.m, call).instrumenting();
        for (off, plain) in plains {
            let slot = cipher.slot_at(&mut bld, new, off);
            let enc = cipher.encrypt(&mut bld, plain, slot);
            bld.store(enc, slot);
        }
        self.m.inst_mut(call).instrumented = true;
        1
    }

    fn zero_init_after_named_cast(&mut self, b: BlockId, value: &str) -> usize {
        let m = &*self.m;
        let cast = match self.first_cast_in(b, |src, _| m.name_of(src) == Some(value)) {
            Some(c) => c,
            None => {
                debug!("Cast of named value not found"; "value" => value);
                return 0;
            }
        };
        let ptr = self.m.result(cast);
        let offsets = match self.m.types.pointee(self.m.ty_of(ptr)) {
            Some(ty) => self.offsets_of(ty),
            None => return 0,
        };
        if offsets.is_empty() {
            return 0;
        }
        self.zero_init_after(cast, ptr, &offsets)
    }

    fn zero_init_after_alloc_cast(&mut self, b: BlockId, routine: &str) -> usize {
        let call = match self.first_call_in(b, routine) {
            Some(c) if !self.m.inst(c).instrumented => c,
            Some(_) => return 0,
            None => {
                debug!("Allocation not found"; "routine" => routine);
                return 0;
            }
        };
        let cast = match self.m.next_inst(call) {
            Some(n) if matches!(self.m.inst(n).kind, InstKind::Cast { .. }) => n,
            _ => {
                debug!("Allocation not followed by a cast"; "routine" => routine);
                return 0;
            }
        };
        let ptr = self.m.result(cast);
        let offsets = match self.m.types.pointee(self.m.ty_of(ptr)) {
            Some(ty) => self.offsets_of(ty),
            None => return 0,
        };
        if offsets.is_empty() {
            return 0;
        }
        self.m.inst_mut(call).instrumented = true;
        self.zero_init_if_nonnull(cast, ptr, &offsets);
        1
    }

    fn zero_init_after_struct_cast(&mut self, b: BlockId, struct_name: &str) -> usize {
        let ty = self.m.types.struct_named(struct_name);
        let m = &*self.m;
        let cast = match self.first_cast_in(b, |_, r| ty.is_some() && m.types.pointee(m.ty_of(r)) == ty) {
            Some(c) => c,
            None => {
                debug!("Cast to struct pointer not found"; "struct" => struct_name);
                return 0;
            }
        };
        let offsets = match self.struct_offsets(struct_name) {
            Some(o) => o,
            None => return 0,
        };
        let ptr = self.m.result(cast);
        self.zero_init_after(cast, ptr, &offsets)
    }

    fn rekey_after_copy(&mut self, f: FuncId, routine: &str, struct_name: &str) -> usize {
        let ann = self.ann;
        let is_routine = |name: &str| {
            name == routine
                || matches!(ann.copy_routine(name),
                            Some(CopyRoutine::Intrinsic { replacement }) if replacement == routine)
        };
        let call = self
            .m
            .func_insts(f)
            .into_iter()
            .find(|&i| self.m.called_name(i).map_or(false, is_routine));
        let call = match call {
            Some(c) if !self.m.inst(c).instrumented => c,
            Some(_) => return 0,
            None => {
                debug!("Copy not found"; "routine" => routine);
                return 0;
            }
        };
        let offsets = match self.struct_offsets(struct_name) {
            Some(o) => o,
            None => return 0,
        };
        let (dst, src) = {
            let args = self.m.call_args(call);
            (args[0], args[1])
        };
        let cipher = self.cipher;
        let mut b = Builder::after(self.m, call).instrumenting();
        for &off in &offsets {
            cipher.rekey(&mut b, dst, src, off);
        }
        self.m.inst_mut(call).instrumented = true;
        1
    }
}

#[cfg(test)]
mod tests {
    use crate::annotations::{AnnotationConfig, SitePatch};
    use crate::instrument::Instrumenter;
    use crate::ir::Module;
    use crate::parser::parse_module;
    use crate::pass_config::PassConfig;
    use crate::propagation::classify;

    fn patch(text: &str, ann: &AnnotationConfig) -> (Module, usize) {
        let mut m = parse_module(text).unwrap();
        let cfg = PassConfig::default();
        let c = classify(&m, ann, &cfg);
        let n = Instrumenter::new(&mut m, &c, ann, &cfg).apply_site_patches();
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

    fn count(m: &Module, f: &str, callee: &str) -> usize {
        callees(m, f).iter().filter(|c| *c == callee).count()
    }

    const SITES: &str = r#"
unit "kernel/params.c"
struct %struct.attrs { i64, ptr<fn() -> void>, ptr<fn() -> void> }
declare @krealloc(ptr<i8>, i64, i32) -> ptr<i8>
declare @kzalloc(i64, i32) -> ptr<i8>
declare @__memcpy(ptr<i8>, ptr<i8>, i64) -> ptr<i8>
define @add_param(%old: ptr<i8>) -> ptr<i8> {
entry:
  br grow
grow:
  %new: ptr<i8> = call @krealloc(%old, 48:i64, 3264:i32)
  ret %new
}
define @setup(%n: i64) -> ptr<%struct.attrs> {
entry:
  %a: ptr<i8> = call @kzalloc(%n, 3264:i32)
  %s: ptr<%struct.attrs> = bitcast %a
  %add.ptr: ptr<i8> = call @kzalloc(%n, 3264:i32)
  %t: ptr<%struct.attrs> = bitcast %add.ptr
  ret %s
}
define @populate(%mem: ptr<i8>) -> void {
entry:
  %and.i: i64 = ptrtoint %mem
  br fill
fill:
  ret
}
define @clone(%d: ptr<i8>, %s: ptr<i8>) -> void {
entry:
  %r: ptr<i8> = call @__memcpy(%d, %s, 24:i64)
  ret
}
"#;

    fn catalogue() -> AnnotationConfig {
        AnnotationConfig::new()
            .with_site_patch(SitePatch::StagedRealloc {
                unit: "params.c".into(),
                function: "add_param".into(),
                block: "grow".into(),
                routine: "krealloc".into(),
                struct_name: "struct.attrs".into(),
            })
            .with_site_patch(SitePatch::ZeroInitAfterAllocCast {
                unit: "params.c".into(),
                function: "setup".into(),
                block: "entry".into(),
                routine: "kzalloc".into(),
            })
            .with_site_patch(SitePatch::ZeroInitAfterNamedCast {
                unit: "params.c".into(),
                function: "setup".into(),
                block: "fpguard.zero.end".into(),
                value: "add.ptr".into(),
            })
            .with_site_patch(SitePatch::ZeroInitAtNamedValues {
                unit: "params.c".into(),
                function: "populate".into(),
                struct_name: "struct.attrs".into(),
                sites: vec![("fill".into(), "and.i".into())],
            })
            .with_site_patch(SitePatch::RekeyAfterCopy {
                unit: "params.c".into(),
                function: "clone".into(),
                routine: "__memcpy".into(),
                struct_name: "struct.attrs".into(),
            })
    }

    #[test]
    fn catalogue_entries_patch_their_sites() {
        let (m, n) = patch(SITES, &catalogue());
        assert_eq!(n, 5);
        // Decrypt from the old object before the call, encrypt into the new one after
        assert_eq!(
            callees(&m, "add_param"),
            vec!["decrypt", "decrypt", "krealloc", "encrypt", "encrypt"]
        );
        assert_eq!(count(&m, "setup", "encrypt"), 4);
        assert_eq!(count(&m, "populate", "encrypt"), 2);
        assert_eq!(callees(&m, "clone"), vec!["__memcpy", "decrypt", "encrypt", "decrypt", "encrypt"]);
    }

    #[test]
    fn patches_apply_once() {
        let ann = catalogue();
        let (mut m, _) = patch(SITES, &ann);
        let before = m.to_string();
        let cfg = PassConfig::default();
        let c = classify(&m, &ann, &cfg);
        assert_eq!(Instrumenter::new(&mut m, &c, &ann, &cfg).apply_site_patches(), 0);
        assert_eq!(m.to_string(), before);
    }

    #[test]
    fn other_units_and_missing_sites_are_left_alone() {
        let text = SITES.replace("kernel/params.c", "kernel/other.c");
        let (m, n) = patch(&text, &catalogue());
        assert_eq!(n, 0);
        assert_eq!(callees(&m, "add_param"), vec!["krealloc"]);

        let ann = AnnotationConfig::new().with_site_patch(SitePatch::ZeroInitAfterStructCast {
            unit: "params.c".into(),
            function: "setup".into(),
            block: "no.such.block".into(),
            struct_name: "struct.attrs".into(),
        });
        let (_, n) = patch(SITES, &ann);
        assert_eq!(n, 0);
    }
}

//! Per-function local tag fixes, for idioms the generic propagation rules cannot see through.
//!
//! A patch runs once per function, right before the function's first scan, and only ever adds
//! tags. A patch that finds nothing to match does nothing.

use crate::annotations::TagPatch;
use crate::ir::{CastOp, FuncId, InstKind};
use crate::log::*;
use crate::propagation::{Propagator, Rule};

pub(crate) fn apply(p: &mut Propagator, f: FuncId, patch: &TagPatch) {
    let m = p.module();
    let fname = &m.function(f).name;
    let rule = Rule::Patch(fname.clone());
    let mut matched = 0;
    match patch {
        TagPatch::AliasedSlot => {
            for i in m.func_insts(f) {
                let addr = match &m.inst(i).kind {
                    InstKind::Load { addr } | InstKind::Store { addr, .. } => *addr,
                    _ => continue,
                };
                let src = match m.producer(addr).map(|c| &m.inst(c).kind) {
                    Some(InstKind::Cast {
                        op: CastOp::BitCast,
                        src,
                    }) => *src,
                    _ => continue,
                };
                if m.types.is_ptr_to_func_ptr(m.ty_of(src)) || p.state().is_tagged_fpp(src) {
                    if p.insert_fpp(addr, rule.clone(), Some(src)) {
                        matched += 1;
                    }
                }
            }
        }
        TagPatch::NamedSource(names) => {
            for i in m.func_insts(f) {
                if let InstKind::Cast {
                    op: CastOp::BitCast,
                    src,
                } = &m.inst(i).kind
                {
                    let named = m
                        .name_of(*src)
                        .map_or(false, |n| names.iter().any(|x| x == n));
                    if named && p.insert_fpp(m.result(i), rule.clone(), Some(*src)) {
                        matched += 1;
                    }
                }
            }
        }
        TagPatch::IndexedStore(name) => {
            for i in m.func_insts(f) {
                if !matches!(m.inst(i).kind, InstKind::FieldAddr { .. })
                    || m.name_of(m.result(i)) != Some(name.as_str())
                {
                    continue;
                }
                match m.next_inst(i).map(|n| (n, &m.inst(n).kind)) {
                    Some((n, InstKind::Store { value, .. })) if p.is_8byte(*value) => {
                        p.mark_store(n);
                        matched += 1;
                    }
                    _ => {
                        debug!("Indexed store patch found no following store";
                               "function" => fname, "value" => name);
                    }
                }
            }
        }
    }
    if matched == 0 {
        debug!("Tag patch did not match"; "function" => fname, "patch" => ?patch);
    } else {
        trace!("Applied tag patch"; "function" => fname, "matches" => matched);
    }
}

#[cfg(test)]
mod tests {
    use crate::annotations::{AnnotationConfig, TagPatch};
    use crate::parser::parse_module;
    use crate::pass_config::PassConfig;
    use crate::propagation::classify;

    #[test]
    fn aliased_slot_tags_punned_address() {
        let m = parse_module(
            r#"
unit "t.c"
define @f(%pp: ptr<ptr<fn() -> void>>) -> i64 {
entry:
  %raw: ptr<i64> = bitcast %pp
  %x: i64 = load %raw
  ret %x
}
"#,
        )
        .unwrap();
        let raw = m.value_named("raw").unwrap();
        let x = m.value_named("x").unwrap();

        let c = classify(&m, &AnnotationConfig::new(), &PassConfig::default());
        assert!(!c.is_tagged_fpp(raw));

        let ann = AnnotationConfig::new().with_tag_patch("f", TagPatch::AliasedSlot);
        let c = classify(&m, &ann, &PassConfig::default());
        assert!(c.is_tagged_fpp(raw));
        assert!(c.is_tagged_fp(x));

        let mut cfg = PassConfig::default();
        cfg.enable_tag_patches = false;
        let c = classify(&m, &ann, &cfg);
        assert!(!c.is_tagged_fpp(raw));
    }

    #[test]
    fn named_source_and_indexed_store() {
        let m = parse_module(
            r#"
unit "t.c"
struct %struct.regs { [4 x i64] }
define @g(%op14: ptr<i8>, %r: ptr<%struct.regs>, %v: i64) -> void {
entry:
  %c: ptr<i64> = bitcast %op14
  %arrayidx: ptr<i64> = fieldaddr %struct.regs, %r, 0:i64, 0:i32, 1:i64
  store %v, %arrayidx
  ret
}
"#,
        )
        .unwrap();
        let ann = AnnotationConfig::new().with_tag_patch("g", TagPatch::NamedSource(vec!["op14".into()]));
        let c = classify(&m, &ann, &PassConfig::default());
        assert!(c.is_tagged_fpp(m.value_named("c").unwrap()));
        assert_eq!(c.tagged_stores().count(), 0);

        let ann = AnnotationConfig::new().with_tag_patch("g", TagPatch::IndexedStore("arrayidx".into()));
        let c = classify(&m, &ann, &PassConfig::default());
        assert_eq!(c.tagged_stores().count(), 1);
        assert!(!c.is_tagged_fpp(m.value_named("c").unwrap()));
    }
}

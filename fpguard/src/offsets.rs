//! Byte offsets of function pointer slots, per type and per global variable.

use crate::annotations::AnnotationConfig;
use crate::containers::unordered::UnorderedMap;
use crate::ir::{GlobalId, Module};
use crate::log::*;
use crate::propagation::Classification;
use crate::types::{Type, TypeId, TypeTable, POINTER_SIZE};
use std::collections::BTreeSet;

/// Memoized per-type results
enum Memo {
    SentinelForRecursion,
    Known(BTreeSet<u64>),
}

/// One statically allocated function pointer slot: `offset` bytes into `global`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct GlobalFpRecord {
    pub global: GlobalId,
    pub offset: u64,
}

/// Turns a [`Classification`] into byte offsets, computing each type at most once. The memo
/// belongs to one module's run and must not outlive the classification it was built from.
///
/// The resolver does not hold on to the module, so that the instrumenter can keep querying it
/// while rewriting; types are never removed from a [`TypeTable`], which keeps the memo valid.
pub struct OffsetResolver<'a> {
    c: &'a Classification,
    ann: &'a AnnotationConfig,
    guard_self_referential: bool,
    memo: UnorderedMap<TypeId, Memo>,
}

impl<'a> OffsetResolver<'a> {
    pub fn new(c: &'a Classification, ann: &'a AnnotationConfig, guard_self_referential: bool) -> Self {
        Self {
            c,
            ann,
            guard_self_referential,
            memo: Default::default(),
        }
    }

    /// Offsets (within `[0, size_of(ty))`) holding function pointers in an object of type `ty`
    pub fn offsets_of(&mut self, types: &TypeTable, ty: TypeId) -> BTreeSet<u64> {
        match self.memo.get(&ty) {
            Some(Memo::Known(r)) => return r.clone(),
            Some(Memo::SentinelForRecursion) => {
                if self.guard_self_referential {
                    warn!("Self-referential aggregate treated as holding no function pointers";
                          "type" => types.name(ty));
                    return BTreeSet::new();
                } else {
                    panic!(
                        "Self-referential aggregate {} while resolving offsets",
                        types.name(ty)
                    );
                }
            }
            None => {}
        }
        self.memo.insert(ty, Memo::SentinelForRecursion);
        let r = self.compute(types, ty);
        trace!("Resolved offsets"; "type" => types.name(ty), "offsets" => ?r);
        self.memo.insert(ty, Memo::Known(r.clone()));
        r
    }

    fn compute(&mut self, types: &TypeTable, ty: TypeId) -> BTreeSet<u64> {
        if types.is_func_ptr(ty) {
            return [0].into_iter().collect();
        }
        match types.get(ty) {
            Type::Struct {
                name,
                body: Some(fields),
            } => {
                let mut r = BTreeSet::new();
                for (i, &fty) in fields.iter().enumerate() {
                    let off = types.field_offset(ty, i);
                    if let Some(prefix) = self.ann.offset_override(name, i) {
                        r.extend((0..prefix).map(|k| off + k * POINTER_SIZE));
                        continue;
                    }
                    if self.c.is_field_excluded(ty, i) {
                        continue;
                    }
                    if types.is_func_ptr(fty) || self.c.is_field_tagged(ty, i) {
                        r.insert(off);
                    }
                    if matches!(types.get(fty), Type::Struct { .. } | Type::Array { .. }) {
                        let inner = self.offsets_of(types, fty);
                        r.extend(inner.into_iter().map(|o| off + o));
                    }
                }
                r
            }
            Type::Array { element, count } => {
                let (element, count) = (*element, *count);
                let size = match types.size_of(element) {
                    Some(s) if count > 0 => s,
                    _ => return BTreeSet::new(),
                };
                let inner = self.offsets_of(types, element);
                (0..count)
                    .flat_map(|i| inner.iter().map(move |o| i * size + o))
                    .collect()
            }
            _ => BTreeSet::new(),
        }
    }

    /// Every function pointer slot of the globals defined in this module
    pub fn global_records(&mut self, m: &Module) -> Vec<GlobalFpRecord> {
        let mut r = vec![];
        for g in m.globals() {
            let global = m.global(g);
            if global.is_declaration() || self.ann.is_skipped_global(&global.name) {
                continue;
            }
            if self.c.is_tagged_fpp(global.addr) {
                r.push(GlobalFpRecord { global: g, offset: 0 });
            } else {
                let ty = global.ty;
                r.extend(
                    self.offsets_of(&m.types, ty)
                        .into_iter()
                        .map(|offset| GlobalFpRecord { global: g, offset }),
                );
            }
        }
        debug!("Collected global function pointer slots"; "count" => r.len());
        r
    }
}

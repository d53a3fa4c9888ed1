//! Function pointer provenance analysis.
//!
//! Classifies every 64-bit value of a module as a function pointer (FP), as the address of a
//! function-pointer-holding location (FPP), both, or neither. The analysis is a whole-module
//! fixpoint: every instruction of every function is re-scanned until a full round changes
//! nothing. When a rule tags the operand of an instruction, the operand's producer is queued and
//! re-classified right away (backward propagation), so a chain of casts ending in a function
//! pointer type is tagged in a single round.
//!
//! Tag sets only ever grow, and are bounded by the number of values, so the fixpoint terminates.

use crate::annotations::AnnotationConfig;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::Worklist;
use crate::ir::{CastOp, ConstExpr, FuncId, InstId, InstKind, Module, ValueId, ValueKind};
use crate::log::*;
use crate::pass_config::PassConfig;
use crate::tag_patches;
use crate::types::TypeId;
use std::collections::BTreeSet;

/// The two tags a value can carry
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Tag {
    /// Holds a function pointer
    Fp,
    /// Is the address of a location holding a function pointer
    Fpp,
    /// Is an address proven not to hold a tagged function pointer
    Excluded,
}

/// The rule that produced a tag
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Rule {
    Cast,
    PtrToInt,
    Compare,
    Select,
    Merge,
    Store,
    Load,
    Field { struct_ty: TypeId, field: usize },
    Patch(String),
}

/// One insertion into a tag set, for provenance debugging
#[derive(Clone, Debug)]
pub struct TagEvent {
    pub value: ValueId,
    pub tag: Tag,
    pub rule: Rule,
    /// The value whose tag (or static type) caused this one
    pub from: Option<ValueId>,
    pub round: usize,
}

/// The result of the analysis: read-only membership tests over values, instructions, and
/// struct fields.
#[derive(Clone, Debug, Default)]
pub struct Classification {
    fp: UnorderedSet<ValueId>,
    fpp: UnorderedSet<ValueId>,
    excluded: UnorderedSet<ValueId>,
    forced_fields: UnorderedSet<(TypeId, usize)>,
    excluded_fields: UnorderedSet<(TypeId, usize)>,
    learned_fields: UnorderedSet<(TypeId, usize)>,
    tagged_loads: UnorderedSet<InstId>,
    tagged_stores: UnorderedSet<InstId>,
    indirect_calls: UnorderedSet<InstId>,
    events: Vec<TagEvent>,
    rounds: usize,
}

impl Classification {
    pub fn is_tagged_fp(&self, v: ValueId) -> bool {
        self.fp.contains(&v)
    }

    pub fn is_tagged_fpp(&self, v: ValueId) -> bool {
        self.fpp.contains(&v)
    }

    pub fn is_excluded(&self, v: ValueId) -> bool {
        self.excluded.contains(&v)
    }

    /// Is field `field` of `struct_ty` known to hold a function pointer (forced or learned),
    /// and not excluded?
    pub fn is_field_tagged(&self, struct_ty: TypeId, field: usize) -> bool {
        !self.is_field_excluded(struct_ty, field)
            && (self.forced_fields.contains(&(struct_ty, field))
                || self.learned_fields.contains(&(struct_ty, field)))
    }

    pub fn is_field_excluded(&self, struct_ty: TypeId, field: usize) -> bool {
        self.excluded_fields.contains(&(struct_ty, field))
    }

    pub fn learned_fields(&self) -> impl Iterator<Item = &(TypeId, usize)> {
        self.learned_fields.iter()
    }

    /// Does this load read a function pointer slot?
    pub fn is_tag_bearing_load(&self, i: InstId) -> bool {
        self.tagged_loads.contains(&i)
    }

    /// Does this store write a function pointer slot?
    pub fn is_tag_bearing_store(&self, i: InstId) -> bool {
        self.tagged_stores.contains(&i)
    }

    pub fn tagged_loads(&self) -> impl Iterator<Item = &InstId> {
        self.tagged_loads.iter()
    }

    pub fn tagged_stores(&self) -> impl Iterator<Item = &InstId> {
        self.tagged_stores.iter()
    }

    pub fn indirect_calls(&self) -> impl Iterator<Item = &InstId> {
        self.indirect_calls.iter()
    }

    pub fn fp_values(&self) -> impl Iterator<Item = &ValueId> {
        self.fp.iter()
    }

    pub fn fpp_values(&self) -> impl Iterator<Item = &ValueId> {
        self.fpp.iter()
    }

    /// Every tag insertion, in order
    pub fn events(&self) -> &[TagEvent] {
        &self.events
    }

    /// Number of full rounds scanned (including the final, unchanging one)
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn num_fp(&self) -> usize {
        self.fp.len()
    }

    pub fn num_fpp(&self) -> usize {
        self.fpp.len()
    }

    pub fn num_excluded(&self) -> usize {
        self.excluded.len()
    }

    /// Is every tag of `self` also in `other`?
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.fp.is_subset(&other.fp)
            && self.fpp.is_subset(&other.fpp)
            && self.excluded.is_subset(&other.excluded)
            && self.learned_fields.is_subset(&other.learned_fields)
            && self.tagged_loads.is_subset(&other.tagged_loads)
            && self.tagged_stores.is_subset(&other.tagged_stores)
    }
}

/// How an operand was produced, viewed uniformly over instructions and constant expressions
enum Operator<'a> {
    BitCast { src: ValueId },
    PtrToInt { src: ValueId },
    FieldAddr { source_ty: TypeId, indices: &'a [ValueId] },
    Other,
}

/// The fixpoint engine. Use [`classify`] unless stepping rounds by hand.
pub struct Propagator<'a> {
    m: &'a Module,
    ann: &'a AnnotationConfig,
    cfg: &'a PassConfig,
    state: Classification,
    pending: Worklist<ValueId>,
    changed: bool,
    patched: UnorderedSet<FuncId>,
    merge_disabled: bool,
}

/// Run the analysis over `m` to its fixpoint
pub fn classify(m: &Module, ann: &AnnotationConfig, cfg: &PassConfig) -> Classification {
    Propagator::new(m, ann, cfg).run()
}

impl<'a> Propagator<'a> {
    pub fn new(m: &'a Module, ann: &'a AnnotationConfig, cfg: &'a PassConfig) -> Self {
        let mut state = Classification::default();
        let mut by_name: UnorderedMap<&str, TypeId> = Default::default();
        for s in m.types.structs() {
            if let Some(name) = m.types.struct_name(s) {
                by_name.insert(name, s);
            }
        }
        for (name, fields) in ann.forced_tags() {
            if let Some(&s) = by_name.get(name) {
                state.forced_fields.extend(fields.iter().map(|&f| (s, f)));
            }
        }
        for (&name, &s) in by_name.iter() {
            let nfields = m.types.struct_fields(s).map_or(0, |f| f.len());
            for f in 0..nfields {
                if ann.is_forced_exclusion(name, f) {
                    state.excluded_fields.insert((s, f));
                }
            }
        }
        Self {
            m,
            ann,
            cfg,
            state,
            pending: Worklist::new(),
            changed: false,
            patched: Default::default(),
            merge_disabled: ann.merge_disabled(&m.unit),
        }
    }

    /// The classification so far
    pub fn state(&self) -> &Classification {
        &self.state
    }

    /// Scan every instruction once. Returns `true` iff any tag set grew.
    pub fn round(&mut self) -> bool {
        self.changed = false;
        self.state.rounds += 1;
        for f in self.m.functions() {
            if self.cfg.enable_tag_patches && self.patched.insert(f) {
                if let Some(patch) = self.ann.tag_patch(&self.m.function(f).name) {
                    tag_patches::apply(self, f, patch);
                }
            }
            for i in self.m.func_insts(f) {
                self.visit(i);
                self.drain();
            }
        }
        self.changed
    }

    /// Scan until a full round changes nothing
    pub fn run(mut self) -> Classification {
        while self.round() {
            trace!("Propagation round changed tags";
                   "round" => self.state.rounds,
                   "fp" => self.state.fp.len(),
                   "fpp" => self.state.fpp.len());
        }
        debug!("Propagation reached fixpoint";
               "unit" => &self.m.unit,
               "rounds" => self.state.rounds,
               "fp" => self.state.fp.len(),
               "fpp" => self.state.fpp.len(),
               "excluded" => self.state.excluded.len(),
               "learned_fields" => self.state.learned_fields.len(),
               "tagged_loads" => self.state.tagged_loads.len(),
               "tagged_stores" => self.state.tagged_stores.len());
        self.state
    }

    pub(crate) fn module(&self) -> &'a Module {
        self.m
    }

    fn event(&mut self, value: ValueId, tag: Tag, rule: Rule, from: Option<ValueId>) {
        self.changed = true;
        let round = self.state.rounds;
        self.state.events.push(TagEvent {
            value,
            tag,
            rule,
            from,
            round,
        });
    }

    pub(crate) fn insert_fp(&mut self, v: ValueId, rule: Rule, from: Option<ValueId>) -> bool {
        if self.state.fp.insert(v) {
            self.event(v, Tag::Fp, rule, from);
            true
        } else {
            false
        }
    }

    pub(crate) fn insert_fpp(&mut self, v: ValueId, rule: Rule, from: Option<ValueId>) -> bool {
        if self.state.fpp.insert(v) {
            self.event(v, Tag::Fpp, rule, from);
            true
        } else {
            false
        }
    }

    fn insert_excluded(&mut self, v: ValueId, rule: Rule) {
        if self.state.excluded.insert(v) {
            self.event(v, Tag::Excluded, rule, None);
        }
    }

    pub(crate) fn mark_store(&mut self, i: InstId) {
        let value = match &self.m.inst(i).kind {
            InstKind::Store { value, .. } => *value,
            k => panic!("Marking non-store {:?} as a tag-bearing store", k),
        };
        assert!(
            self.is_8byte(value),
            "Tag-bearing store should be 64 bits wide"
        );
        self.state.tagged_stores.insert(i);
    }

    fn mark_load(&mut self, i: InstId) {
        let r = self.m.result(i);
        assert!(self.is_8byte(r), "Tag-bearing load should be 64 bits wide");
        self.state.tagged_loads.insert(i);
    }

    pub(crate) fn is_8byte(&self, v: ValueId) -> bool {
        self.m.types.is_8byte(self.m.ty_of(v))
    }

    fn is_fp_typed(&self, v: ValueId) -> bool {
        self.m.types.is_func_ptr(self.m.ty_of(v))
    }

    fn fp_or_tagged(&self, v: ValueId) -> bool {
        self.is_fp_typed(v) || self.state.is_tagged_fp(v)
    }

    /// Queue `v`'s producer for re-classification
    fn back(&mut self, v: ValueId) {
        self.pending.push(v);
    }

    fn drain(&mut self) {
        while let Some(v) = self.pending.pop() {
            assert!(
                self.state.is_tagged_fp(v) || self.state.is_tagged_fpp(v),
                "Backward propagation of an untagged value"
            );
            assert!(self.is_8byte(v), "Tagged values should be 64 bits wide");
            let m = self.m;
            match m.producer(v).map(|i| (i, &m.inst(i).kind)) {
                Some((i, InstKind::Cast { .. })) => self.visit_cast(i),
                Some((i, InstKind::Load { .. })) => self.visit_load(i),
                _ => self.visit_operator(v),
            }
        }
    }

    fn operator(&self, v: ValueId) -> Operator<'a> {
        let m = self.m;
        match &m.value(v).kind {
            ValueKind::Expr(ConstExpr::Cast {
                op: CastOp::BitCast,
                src,
            }) => Operator::BitCast { src: *src },
            ValueKind::Expr(ConstExpr::Cast {
                op: CastOp::PtrToInt,
                src,
            }) => Operator::PtrToInt { src: *src },
            ValueKind::Expr(ConstExpr::FieldAddr {
                source_ty, indices, ..
            }) => Operator::FieldAddr {
                source_ty: *source_ty,
                indices,
            },
            ValueKind::Result(i) => match &m.inst(*i).kind {
                InstKind::Cast {
                    op: CastOp::BitCast,
                    src,
                } => Operator::BitCast { src: *src },
                InstKind::Cast {
                    op: CastOp::PtrToInt,
                    src,
                } => Operator::PtrToInt { src: *src },
                InstKind::FieldAddr {
                    source_ty, indices, ..
                } => Operator::FieldAddr {
                    source_ty: *source_ty,
                    indices,
                },
                _ => Operator::Other,
            },
            _ => Operator::Other,
        }
    }

    /// Classify an operand by how it was produced
    fn visit_operator(&mut self, v: ValueId) {
        match self.operator(v) {
            Operator::BitCast { src } => {
                if !self.is_8byte(v) || !self.is_8byte(src) {
                    return;
                }
                let (src_fp, dst_fp) = (self.is_fp_typed(src), self.is_fp_typed(v));
                let (src_tag, dst_tag) = (self.state.is_tagged_fp(src), self.state.is_tagged_fp(v));
                if src_tag && !(dst_fp || dst_tag) {
                    self.insert_fp(v, Rule::Cast, Some(src));
                } else if dst_tag && !(src_fp || src_tag) {
                    if self.insert_fp(src, Rule::Cast, Some(v)) {
                        self.back(src);
                    }
                } else if src_fp && !dst_fp {
                    self.insert_fp(v, Rule::Cast, Some(src));
                } else if dst_fp && !src_fp {
                    if self.insert_fp(src, Rule::Cast, Some(v)) {
                        self.back(src);
                    }
                }
            }
            Operator::PtrToInt { src } => {
                if self.fp_or_tagged(src) && !self.state.is_tagged_fp(v) {
                    self.insert_fp(v, Rule::PtrToInt, Some(src));
                }
            }
            Operator::FieldAddr { source_ty, indices } => {
                self.visit_field_addr(v, source_ty, indices)
            }
            Operator::Other => {}
        }
    }

    fn visit(&mut self, i: InstId) {
        let m = self.m;
        match &m.inst(i).kind {
            InstKind::Cast { .. } => self.visit_cast(i),
            InstKind::Cmp { lhs, rhs, .. } => self.visit_pair(*lhs, *rhs, Rule::Compare),
            InstKind::Select {
                on_true, on_false, ..
            } => self.visit_pair(*on_true, *on_false, Rule::Select),
            InstKind::Phi { .. } => self.visit_phi(i),
            InstKind::Store { .. } => self.visit_store(i),
            InstKind::Load { .. } => self.visit_load(i),
            InstKind::FieldAddr {
                source_ty, indices, ..
            } => self.visit_field_addr(m.result(i), *source_ty, indices),
            InstKind::Call { callee, .. } => {
                if m.called_function(i).is_none() {
                    self.visit_operator(*callee);
                    self.state.indirect_calls.insert(i);
                }
            }
            InstKind::Binary { .. }
            | InstKind::Alloca { .. }
            | InstKind::Br { .. }
            | InstKind::CondBr { .. }
            | InstKind::Ret { .. } => {}
        }
    }

    fn visit_cast(&mut self, i: InstId) {
        let src = match &self.m.inst(i).kind {
            InstKind::Cast { src, .. } => *src,
            _ => unreachable!(),
        };
        let dst = self.m.result(i);
        self.visit_operator(src);
        if !self.is_8byte(dst) || !self.is_8byte(src) {
            return;
        }
        let src_fp = self.fp_or_tagged(src);
        let dst_fp = self.fp_or_tagged(dst);
        if src_fp && !dst_fp {
            self.insert_fp(dst, Rule::Cast, Some(src));
        } else if dst_fp && !src_fp {
            self.insert_fp(src, Rule::Cast, Some(dst));
            self.back(src);
        }
    }

    /// Comparisons and selects: the two operands carry the same kind of value
    fn visit_pair(&mut self, lhs: ValueId, rhs: ValueId, rule: Rule) {
        self.visit_operator(lhs);
        self.visit_operator(rhs);
        if self.m.is_constant_data(lhs) || self.m.is_constant_data(rhs) {
            return;
        }
        if !self.is_8byte(lhs) || !self.is_8byte(rhs) {
            return;
        }
        let (lhs_fp, rhs_fp) = (self.fp_or_tagged(lhs), self.fp_or_tagged(rhs));
        if lhs_fp && !rhs_fp {
            self.insert_fp(rhs, rule, Some(lhs));
            self.back(rhs);
        } else if rhs_fp && !lhs_fp {
            self.insert_fp(lhs, rule, Some(rhs));
            self.back(lhs);
        }
    }

    fn visit_phi(&mut self, i: InstId) {
        if self.merge_disabled {
            return;
        }
        let r = self.m.result(i);
        if self.is_fp_typed(r) || !self.is_8byte(r) {
            return;
        }
        let incoming: Vec<ValueId> = match &self.m.inst(i).kind {
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            _ => unreachable!(),
        };
        let tagged = self.state.is_tagged_fp(r) || incoming.iter().any(|&v| self.state.is_tagged_fp(v));
        if !tagged {
            return;
        }
        for v in incoming {
            if self.m.is_constant_data(v) {
                continue;
            }
            if self.insert_fp(v, Rule::Merge, Some(r)) {
                self.back(v);
            }
        }
        self.insert_fp(r, Rule::Merge, None);
    }

    fn visit_store(&mut self, i: InstId) {
        let (value, addr) = match &self.m.inst(i).kind {
            InstKind::Store { value, addr } => (*value, *addr),
            _ => unreachable!(),
        };
        if !self.is_8byte(value) {
            return;
        }
        self.visit_operator(value);
        self.visit_operator(addr);
        if self.state.is_excluded(addr) {
            return;
        }
        let value_fp = self.is_fp_typed(value);
        let value_tag = self.state.is_tagged_fp(value);
        let addr_tag = self.state.is_tagged_fpp(addr);
        if value_fp {
            self.mark_store(i);
        } else if value_tag && !addr_tag {
            self.mark_store(i);
            self.insert_fpp(addr, Rule::Store, Some(value));
            self.back(addr);
        } else if addr_tag {
            self.mark_store(i);
            if self.insert_fp(value, Rule::Store, Some(addr)) {
                self.back(value);
            }
        }
    }

    fn visit_load(&mut self, i: InstId) {
        let addr = match &self.m.inst(i).kind {
            InstKind::Load { addr } => *addr,
            _ => unreachable!(),
        };
        let r = self.m.result(i);
        if !self.is_8byte(r) {
            return;
        }
        self.visit_operator(addr);
        if self.state.is_excluded(addr) {
            return;
        }
        if self.is_fp_typed(r) {
            self.mark_load(i);
        } else if self.state.is_tagged_fpp(addr) {
            self.mark_load(i);
            self.insert_fp(r, Rule::Load, Some(addr));
        } else if self.state.is_tagged_fp(r) {
            self.mark_load(i);
            self.insert_fpp(addr, Rule::Load, Some(r));
            self.back(addr);
        }
    }

    fn visit_field_addr(&mut self, v: ValueId, source_ty: TypeId, indices: &[ValueId]) {
        let target_is_8byte = self
            .m
            .types
            .pointee(self.m.ty_of(v))
            .map_or(false, |t| self.m.types.is_8byte(t));
        if !target_is_8byte {
            return;
        }
        let (struct_ty, field) = match self.m.field_path(source_ty, indices) {
            Ok(crate::ir::FieldPath {
                field: Some(sf), ..
            }) => sf,
            Ok(_) => return,
            Err(e) => panic!("Malformed field address: {}", e),
        };
        let rule = Rule::Field { struct_ty, field };
        if self.state.is_field_excluded(struct_ty, field) {
            self.insert_excluded(v, rule);
            return;
        }
        if self.state.is_field_tagged(struct_ty, field) {
            self.insert_fpp(v, rule.clone(), None);
        }
        if self.cfg.enable_learned_field_tags
            && self.state.is_tagged_fpp(v)
            && self.state.learned_fields.insert((struct_ty, field))
        {
            debug!("Learned function pointer field";
                   "struct" => self.m.types.name(struct_ty),
                   "field" => field);
            self.changed = true;
        }
    }
}

/// Fields of `struct_ty` that the classification treats as function pointer slots
pub fn tagged_fields(c: &Classification, m: &Module, struct_ty: TypeId) -> BTreeSet<usize> {
    let n = m.types.struct_fields(struct_ty).map_or(0, |f| f.len());
    (0..n).filter(|&f| c.is_field_tagged(struct_ty, f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn classify_text(text: &str, ann: &AnnotationConfig) -> (Module, Classification) {
        let m = parse_module(text).unwrap();
        let c = classify(&m, ann, &PassConfig::default());
        (m, c)
    }

    fn value_named(m: &Module, name: &str) -> ValueId {
        m.value_named(name)
            .unwrap_or_else(|| panic!("No value named {}", name))
    }

    #[test]
    fn cast_chain_back_propagates() {
        let (m, c) = classify_text(
            r#"
unit "t.c"
declare @use(ptr<fn() -> void>) -> void
define @f(%raw: ptr<i8>) -> void {
entry:
  %a: i64 = ptrtoint %raw
  %b: ptr<i8> = inttoptr %a
  %fp: ptr<fn() -> void> = bitcast %b
  call @use(%fp)
  ret
}
"#,
            &AnnotationConfig::new(),
        );
        assert!(c.is_tagged_fp(value_named(&m, "b")));
        assert!(c.is_tagged_fp(value_named(&m, "a")));
        assert!(c.is_tagged_fp(value_named(&m, "raw")));
        assert!(!c.is_tagged_fp(value_named(&m, "fp")));
    }

    #[test]
    fn store_of_tagged_value_tags_address_and_learns_field() {
        let (m, c) = classify_text(
            r#"
unit "t.c"
struct %struct.holder { i64, i64 }
define @f(%h: ptr<%struct.holder>, %cb: ptr<fn() -> void>) -> void {
entry:
  %v: i64 = ptrtoint %cb
  %slot: ptr<i64> = fieldaddr %struct.holder, %h, 0:i64, 1:i32
  store %v, %slot
  ret
}
define @g(%h: ptr<%struct.holder>) -> i64 {
entry:
  %slot2: ptr<i64> = fieldaddr %struct.holder, %h, 0:i64, 1:i32
  %x: i64 = load %slot2
  ret %x
}
"#,
            &AnnotationConfig::new(),
        );
        let holder = m.types.struct_named("struct.holder").unwrap();
        assert!(c.is_tagged_fpp(value_named(&m, "slot")));
        assert!(c.is_field_tagged(holder, 1));
        assert!(!c.is_field_tagged(holder, 0));
        // Learned in @f, used in @g in a later round
        assert!(c.is_tagged_fpp(value_named(&m, "slot2")));
        assert!(c.is_tagged_fp(value_named(&m, "x")));
        assert_eq!(c.tagged_stores().count(), 1);
        assert_eq!(c.tagged_loads().count(), 1);
        assert!(c.rounds() >= 2);
    }

    #[test]
    fn exclusion_beats_forced_tag() {
        let text = r#"
unit "t.c"
struct %struct.act { i64, i64 }
define @f(%a: ptr<%struct.act>, %v: i64) -> void {
entry:
  %s: ptr<i64> = fieldaddr %struct.act, %a, 0:i64, 0:i32
  store %v, %s
  ret
}
"#;
        let ann = AnnotationConfig::new()
            .with_forced_tag("struct.act", 0)
            .with_forced_exclusion("struct.act", 0);
        let (m, c) = classify_text(text, &ann);
        let s = value_named(&m, "s");
        assert!(c.is_excluded(s));
        assert!(!c.is_tagged_fpp(s));
        assert!(!c.is_tagged_fp(value_named(&m, "v")));
        assert_eq!(c.tagged_stores().count(), 0);
        let act = m.types.struct_named("struct.act").unwrap();
        assert!(!c.is_field_tagged(act, 0));

        let (m, c) = classify_text(text, &AnnotationConfig::new().with_forced_tag("struct.act", 0));
        assert!(c.is_tagged_fpp(value_named(&m, "s")));
        assert!(c.is_tagged_fp(value_named(&m, "v")));
    }

    #[test]
    fn merge_tags_all_non_constant_incoming() {
        let text = r#"
unit "kernel/x.c"
define @f(%c: i1, %a: i64, %fp: ptr<fn() -> void>) -> void {
entry:
  %b: i64 = ptrtoint %fp
  br %c, l, r
l:
  br join
r:
  br join
join:
  %m: i64 = phi [%a, l], [%b, r], [0:i64, entry]
  ret
}
"#;
        let (m, c) = classify_text(text, &AnnotationConfig::new());
        assert!(c.is_tagged_fp(value_named(&m, "m")));
        assert!(c.is_tagged_fp(value_named(&m, "a")));

        let ann = AnnotationConfig::new().with_merge_disabled_unit("kernel/x.c");
        let (m, c) = classify_text(text, &ann);
        assert!(!c.is_tagged_fp(value_named(&m, "m")));
        assert!(!c.is_tagged_fp(value_named(&m, "a")));
    }

    #[test]
    fn rounds_are_monotone_and_terminate() {
        let m = parse_module(crate::tests::CALLBACK_THROUGH_VOID_POINTER).unwrap();
        let ann = crate::tests::callback_annotations();
        let cfg = PassConfig::default();
        let mut p = Propagator::new(&m, &ann, &cfg);
        let mut prev = p.state().clone();
        let mut rounds = 0;
        while p.round() {
            assert!(prev.is_subset_of(p.state()));
            prev = p.state().clone();
            rounds += 1;
            assert!(rounds <= m.num_values(), "Fixpoint failed to terminate");
        }
        assert!(prev.is_subset_of(p.state()));
        assert!(p.state().num_fp() > 0);
    }
}

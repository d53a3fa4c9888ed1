//! Statically initialized function pointer slots.
//!
//! The initial contents of globals are plaintext in the image. A per-unit routine, run once at
//! boot by the dispatcher walking [`GLOBAL_INIT_SECTION`], encrypts every such slot in place.
//! Globals replicated per processor get a second routine, registered in [`PERCPU_COPY_SECTION`],
//! that re-keys a replica after its bytes were copied from the template.

use crate::builder::Builder;
use crate::instrument::Instrumenter;
use crate::ir::{FnAttr, FuncId, Initializer};
use crate::log::*;
use crate::offsets::GlobalFpRecord;

/// Section collecting the addresses of the per-unit initializer routines
pub const GLOBAL_INIT_SECTION: &str = ".init.fpguard_ginit";
/// Section collecting the addresses of the per-unit replica copy routines
pub const PERCPU_COPY_SECTION: &str = ".fpguard.percpu_copy";
/// Section of the synthesized initializer routines
pub const INIT_TEXT_SECTION: &str = ".init.text";

/// The unit name, usable within a symbol
fn unit_symbol(unit: &str) -> String {
    unit.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub fn global_init_name(unit: &str) -> String {
    format!("__fpguard_ginit_{}", unit_symbol(unit))
}

pub fn percpu_copy_name(unit: &str) -> String {
    format!("__fpguard_percpu_copy_{}", unit_symbol(unit))
}

impl<'a> Instrumenter<'a> {
    /// Store the address of `f` into a new global `name` placed in `section`
    fn register(&mut self, f: FuncId, name: &str, section: &str) {
        let addr = self.m.function(f).addr;
        let ty = self.m.ty_of(addr);
        self.m.add_global(
            name,
            ty,
            Some(Initializer::Value(addr)),
            Some(section.to_owned()),
            true,
        );
    }

    /// Synthesize and register the unit's initializer routine, encrypting every slot of
    /// `records` in place. Returns the number of slots encrypted.
    pub fn synthesize_global_init(&mut self, records: &[GlobalFpRecord]) -> usize {
        if self.ann.skips_global_init(&self.m.unit) {
            debug!("Global initializer synthesis skipped for unit"; "unit" => &self.m.unit);
            return 0;
        }
        let name = global_init_name(&self.m.unit);
        if records.is_empty() || self.m.function_named(&name).is_some() {
            return 0;
        }
        let void = self.m.types.void();
        let fnty = self.m.types.func(void, vec![]);
        let f = self.m.declare_function(&name, fnty, &[]);
        {
            let func = self.m.function_mut(f);
            func.section = Some(INIT_TEXT_SECTION.to_owned());
            func.attrs.insert(FnAttr::Cold);
            func.attrs.insert(FnAttr::NoUnwind);
        }
        let entry = self.m.add_block(f, "entry");

        let cipher = self.cipher;
        for r in records {
            self.m.global_mut(r.global).unnamed_addr = false;
            let base = self.m.global(r.global).addr;
            let mut b = Builder::at_end(self.m, entry).instrumenting();
            let slot = cipher.slot_at(&mut b, base, r.offset);
            let plain = b.load(slot);
            let enc = cipher.encrypt(&mut b, plain, slot);
            b.store(enc, slot);
        }
        Builder::at_end(self.m, entry).instrumenting().ret(None);

        let ptr_name = format!("__fpguard_ginit_ptr_{}", unit_symbol(&self.m.unit));
        self.register(f, &ptr_name, GLOBAL_INIT_SECTION);
        info!("Synthesized global initializer"; "routine" => &name, "slots" => records.len());
        records.len()
    }

    /// Synthesize and register the unit's replica copy routine `(dst, src)`, re-keying the slots
    /// of every per-processor global in `records` from the template at `src` to the replica at
    /// `dst`. Returns the number of slots re-keyed.
    pub fn synthesize_percpu_copy(&mut self, records: &[GlobalFpRecord]) -> usize {
        let percpu: Vec<GlobalFpRecord> = records
            .iter()
            .filter(|r| {
                self.m
                    .global(r.global)
                    .section
                    .as_deref()
                    .map_or(false, |s| self.ann.is_percpu_section(s))
            })
            .cloned()
            .collect();
        let name = percpu_copy_name(&self.m.unit);
        if percpu.is_empty() || self.m.function_named(&name).is_some() {
            return 0;
        }
        let void = self.m.types.void();
        let i8_ = self.m.types.i8();
        let p8 = self.m.types.ptr(i8_);
        let fnty = self.m.types.func(void, vec![p8, p8]);
        let f = self.m.declare_function(&name, fnty, &["dst", "src"]);
        self.m.function_mut(f).attrs.insert(FnAttr::NoUnwind);
        let (dst, src) = {
            let params = &self.m.function(f).params;
            (params[0], params[1])
        };
        let entry = self.m.add_block(f, "entry");

        let cipher = self.cipher;
        let mut b = Builder::at_end(self.m, entry).instrumenting();
        let dst_base = b.ptr_to_int(dst);
        let src_base = b.ptr_to_int(src);
        for r in &percpu {
            let g = b.module().global(r.global).addr;
            let template = b.ptr_to_int(g);
            let within = b.sub(template, src_base);
            let replica = b.add(dst_base, within);
            cipher.rekey(&mut b, replica, template, r.offset);
        }
        b.ret(None);

        let ptr_name = format!("__fpguard_percpu_copy_ptr_{}", unit_symbol(&self.m.unit));
        self.register(f, &ptr_name, PERCPU_COPY_SECTION);
        info!("Synthesized per-processor copy routine"; "routine" => &name, "slots" => percpu.len());
        percpu.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationConfig;
    use crate::instrument::{DECRYPT, ENCRYPT};
    use crate::parser::parse_module;
    use crate::pass_config::PassConfig;
    use crate::propagation::classify;

    const GLOBALS: &str = r#"
unit "drivers/net/foo-bar.c"
struct %struct.ops { i64, ptr<fn() -> void> }
declare @handler() -> void
global @ops : %struct.ops = { 0, @handler } internal unnamed_addr
global @pcpu_ops : %struct.ops = zeroinit section ".data..percpu"
global @ext : %struct.ops
"#;

    fn callees(m: &crate::ir::Module, f: FuncId) -> Vec<&str> {
        m.func_insts(f)
            .into_iter()
            .filter_map(|i| m.called_name(i))
            .collect()
    }

    #[test]
    fn initializer_encrypts_and_registers() {
        let mut m = parse_module(GLOBALS).unwrap();
        let ann = AnnotationConfig::new();
        let cfg = PassConfig::default();
        let c = classify(&m, &ann, &cfg);
        let mut ins = Instrumenter::new(&mut m, &c, &ann, &cfg);
        let records = ins.global_records();
        assert_eq!(records.len(), 2);
        assert_eq!(ins.synthesize_global_init(&records), 2);
        assert_eq!(ins.synthesize_global_init(&records), 0);
        m.confirm_valid();

        let name = global_init_name("drivers/net/foo-bar.c");
        assert_eq!(name, "__fpguard_ginit_drivers_net_foo_bar_c");
        let f = m.function_named(&name).unwrap();
        let func = m.function(f);
        assert_eq!(func.section.as_deref(), Some(INIT_TEXT_SECTION));
        assert!(func.attrs.contains(&FnAttr::Cold));
        assert_eq!(callees(&m, f), vec![ENCRYPT, ENCRYPT]);
        let ops = m.global_named("ops").unwrap();
        assert!(!m.global(ops).unnamed_addr);

        let ptr = m
            .global_named("__fpguard_ginit_ptr_drivers_net_foo_bar_c")
            .unwrap();
        let g = m.global(ptr);
        assert_eq!(g.section.as_deref(), Some(GLOBAL_INIT_SECTION));
        assert_eq!(g.initializer, Some(Initializer::Value(func.addr)));
    }

    #[test]
    fn skipped_units_get_no_initializer() {
        let mut m = parse_module(GLOBALS).unwrap();
        let ann = AnnotationConfig::new().with_global_init_skipped_unit("drivers/net/");
        let cfg = PassConfig::default();
        let c = classify(&m, &ann, &cfg);
        let mut ins = Instrumenter::new(&mut m, &c, &ann, &cfg);
        let records = ins.global_records();
        assert_eq!(ins.synthesize_global_init(&records), 0);
        assert!(m.function_named(&global_init_name(&m.unit)).is_none());
    }

    #[test]
    fn percpu_routine_rekeys_replica_slots() {
        let mut m = parse_module(GLOBALS).unwrap();
        let ann = AnnotationConfig::new();
        let cfg = PassConfig::default();
        let c = classify(&m, &ann, &cfg);
        let mut ins = Instrumenter::new(&mut m, &c, &ann, &cfg);
        let records = ins.global_records();
        assert_eq!(ins.synthesize_percpu_copy(&records), 1);
        assert_eq!(ins.synthesize_percpu_copy(&records), 0);
        m.confirm_valid();
        let f = m.function_named(&percpu_copy_name(&m.unit)).unwrap();
        assert_eq!(callees(&m, f), vec![DECRYPT, ENCRYPT]);
        let ptr = m
            .global_named("__fpguard_percpu_copy_ptr_drivers_net_foo_bar_c")
            .unwrap();
        assert_eq!(m.global(ptr).section.as_deref(), Some(PERCPU_COPY_SECTION));
    }
}

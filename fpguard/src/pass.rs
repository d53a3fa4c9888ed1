//! The hardening pipeline for one compilation unit: classification, then each rewrite family in
//! turn.

use crate::annotations::AnnotationConfig;
use crate::instrument::{Instrumenter, LoadStoreCounts};
use crate::ir::Module;
use crate::log::*;
use crate::pass_config::PassConfig;
use crate::propagation::{classify, Classification};
use crate::zero_init::ZeroInitCounts;

/// Number of sites handled by each rewrite family
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct RewriteCounts {
    pub global_slots: usize,
    pub global_init_slots: usize,
    pub load_store: LoadStoreCounts,
    pub percpu_hooks: usize,
    pub bulk_copies: usize,
    pub percpu_slots: usize,
    pub zero_init: ZeroInitCounts,
    pub site_patches: usize,
    pub reordered_functions: usize,
}

impl RewriteCounts {
    /// Total number of rewritten sites. Zero exactly when the module was left untouched (apart
    /// from the cipher declarations).
    pub fn total(&self) -> usize {
        self.global_init_slots
            + self.load_store.loads
            + self.load_store.stores
            + self.percpu_hooks
            + self.bulk_copies
            + self.percpu_slots
            + self.zero_init.allocations
            + self.zero_init.fills
            + self.site_patches
            + self.reordered_functions
    }
}

/// The outcome of hardening one module
#[derive(Debug)]
pub struct HardeningReport {
    pub classification: Classification,
    pub rewrites: RewriteCounts,
}

/// Classify `m` and rewrite it in place so function pointer slots only hold address-bound
/// ciphertext. Running it again on its own output changes nothing.
pub fn harden_module(m: &mut Module, ann: &AnnotationConfig, cfg: &PassConfig) -> HardeningReport {
    info!("Hardening module"; "unit" => &m.unit);
    let classification = classify(m, ann, cfg);

    let rewrites = {
        let mut ins = Instrumenter::new(m, &classification, ann, cfg);
        let mut r = RewriteCounts::default();
        let records = ins.global_records();
        r.global_slots = records.len();
        if cfg.enable_global_init {
            r.global_init_slots = ins.synthesize_global_init(&records);
        }
        if cfg.enable_load_store {
            r.load_store = ins.rewrite_loads_and_stores();
        }
        if cfg.enable_percpu_copy {
            // Must see the copy intrinsics before the bulk copy rewrite replaces them
            r.percpu_hooks = ins.insert_percpu_copy_hooks();
        }
        if cfg.enable_bulk_copy {
            r.bulk_copies = ins.rewrite_bulk_copies();
        }
        if cfg.enable_percpu_copy {
            r.percpu_slots = ins.synthesize_percpu_copy(&records);
        }
        if cfg.enable_zero_init {
            r.zero_init = ins.rewrite_zero_inits();
        }
        if cfg.enable_site_patches {
            r.site_patches = ins.apply_site_patches();
        }
        if cfg.enable_param_reorder {
            r.reordered_functions = ins.reorder_params();
        }
        r
    };

    if let Err(e) = m.try_confirm_valid() {
        panic!("Hardening produced a malformed module: {}", e);
    }
    info!("Hardened module";
          "unit" => &m.unit,
          "rewrites" => rewrites.total(),
          "global_slots" => rewrites.global_slots,
          "rounds" => classification.rounds());
    HardeningReport {
        classification,
        rewrites,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{callback_annotations, CALLBACK_THROUGH_VOID_POINTER};

    #[test]
    fn disabled_families_are_skipped() {
        let mut m = crate::parser::parse_module(CALLBACK_THROUGH_VOID_POINTER).unwrap();
        let ann = callback_annotations();
        let cfg = PassConfig::from(vec![
            crate::pass_config::CommandLinePassConfig::DisableLoadStore,
            crate::pass_config::CommandLinePassConfig::DisableGlobalInit,
        ]);
        let report = harden_module(&mut m, &ann, &cfg);
        assert_eq!(report.rewrites.load_store, LoadStoreCounts::default());
        assert_eq!(report.rewrites.global_init_slots, 0);
        assert!(report.classification.num_fp() > 0);
    }
}

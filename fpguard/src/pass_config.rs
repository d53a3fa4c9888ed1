//! Run-time switches for the hardening pipeline.
//!
//! A [`PassConfig`] is built once (by default, or from command line `-Z` flags) and handed to
//! [`harden_module`](crate::pass::harden_module); nothing reads it globally.

/// Switches for each stage of the pipeline
#[derive(Clone, Debug)]
pub struct PassConfig {
    /// Synthesize the per-unit initializer routine encrypting statically initialized slots
    pub enable_global_init: bool,
    /// Rewrite tag-bearing loads and stores
    pub enable_load_store: bool,
    /// Re-key function pointers moved by bulk copies
    pub enable_bulk_copy: bool,
    /// Synthesize the per-processor replica copy routine, and call the copy hook in the
    /// per-processor setup unit
    pub enable_percpu_copy: bool,
    /// Store encrypted zeroes after zeroing allocations and zero-fills
    pub enable_zero_init: bool,
    /// Apply the named-site catalogue
    pub enable_site_patches: bool,
    /// Move trailing function pointer parameters into a register-passed slot
    pub enable_param_reorder: bool,
    /// Number of parameters passed in registers
    pub register_param_slots: usize,
    /// Record (struct, field) pairs reached through FPP-tagged field addresses, so every other
    /// access of that field gets tagged too
    pub enable_learned_field_tags: bool,
    /// Treat self-referential aggregates as holding no function pointers (with a warning),
    /// rather than aborting
    pub guard_self_referential_types: bool,
    /// Apply per-function tag patches before the fixpoint
    pub enable_tag_patches: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            enable_global_init: true,
            enable_load_store: true,
            enable_bulk_copy: true,
            enable_percpu_copy: true,
            enable_zero_init: true,
            enable_site_patches: true,
            enable_param_reorder: true,
            register_param_slots: 8,
            enable_learned_field_tags: true,
            guard_self_referential_types: true,
            enable_tag_patches: true,
        }
    }
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Pipeline configuration parameters
pub enum CommandLinePassConfig {
    DisableGlobalInit,
    DisableLoadStore,
    DisableBulkCopy,
    DisablePercpuCopy,
    DisableZeroInit,
    DisableSitePatches,
    DisableParamReorder,
    DisableLearnedFieldTags,
    DisableSelfReferentialTypeGuard,
    DisableTagPatches,
}

impl From<Vec<CommandLinePassConfig>> for PassConfig {
    fn from(v: Vec<CommandLinePassConfig>) -> Self {
        use CommandLinePassConfig::*;
        let mut r = PassConfig::default();
        for v in v {
            match v {
                DisableGlobalInit => {
                    r.enable_global_init = false;
                }
                DisableLoadStore => {
                    r.enable_load_store = false;
                }
                DisableBulkCopy => {
                    r.enable_bulk_copy = false;
                }
                DisablePercpuCopy => {
                    r.enable_percpu_copy = false;
                }
                DisableZeroInit => {
                    r.enable_zero_init = false;
                }
                DisableSitePatches => {
                    r.enable_site_patches = false;
                }
                DisableParamReorder => {
                    r.enable_param_reorder = false;
                }
                DisableLearnedFieldTags => {
                    r.enable_learned_field_tags = false;
                }
                DisableSelfReferentialTypeGuard => {
                    r.guard_self_referential_types = false;
                }
                DisableTagPatches => {
                    r.enable_tag_patches = false;
                }
            }
        }
        r
    }
}

//! Curated, immutable annotation data steering the analysis and the rewrites.
//!
//! [`AnnotationConfig::new`] knows only the memory routines (copy, zero-fill, zeroing
//! allocators) every unit may call. [`AnnotationConfig::kernel`] (shared process-wide as
//! [`KERNEL_ANNOTATIONS`](static@KERNEL_ANNOTATIONS)) adds the hand-verified exceptions for the
//! kernel: forced field tags and exclusions, per-function tag patches, and the named-site
//! catalogue. Entries are reviewed independently of the generic algorithm; anything keyed by
//! front-end assigned names must be revisited whenever the front end changes.

use crate::containers::unordered::UnorderedMap;
use std::collections::BTreeSet;

/// A local, name-keyed tag fix applied to a single function before the fixpoint runs
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TagPatch {
    /// A load or store through a pointer cast whose source is a pointer to a function pointer
    /// (or an already FPP-tagged address) tags the cast as FPP. Covers type-punned access to a
    /// function pointer slot through an untyped pointer.
    AliasedSlot,
    /// A cast whose source value carries one of these front-end names is tagged FPP
    NamedSource(Vec<String>),
    /// The store immediately following a field address with this front-end name is tag-bearing
    IndexedStore(String),
}

/// A structural exception for the rewrites that the type/tag-driven rules cannot see through.
/// Units are matched by substring of the compilation unit's name; everything else exactly.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SitePatch {
    /// Zeroing allocations in `(function, block)` produce a `struct_name`
    AllocType {
        function: String,
        block: String,
        struct_name: String,
    },
    /// Zero-fills in `(function, block)` cover a `struct_name`
    ZeroFillType {
        function: String,
        block: String,
        struct_name: String,
    },
    /// At the start of each `(block, value)` site, a fresh `struct_name` lives at the integer
    /// address held by the named value
    ZeroInitAtNamedValues {
        unit: String,
        function: String,
        struct_name: String,
        sites: Vec<(String, String)>,
    },
    /// A reallocation through `routine` in `block`: slots are decrypted from the old object
    /// before the call, and re-encrypted into the new one after it
    StagedRealloc {
        unit: String,
        function: String,
        block: String,
        routine: String,
        struct_name: String,
    },
    /// A zero-fill of exactly `len` bytes immediately preceded by a cast of a value whose name
    /// starts with `value_prefix` holds a function pointer at `offset`
    PrefixedZeroFill {
        value_prefix: String,
        len: u64,
        offset: u64,
    },
    /// The first cast of the value named `value` in `(function, block)` points to a fresh,
    /// zeroed object of the cast's pointee type
    ZeroInitAfterNamedCast {
        unit: String,
        function: String,
        block: String,
        value: String,
    },
    /// The first call to `routine` in `(function, block)` is followed by a cast giving the
    /// zeroed object's type
    ZeroInitAfterAllocCast {
        unit: String,
        function: String,
        block: String,
        routine: String,
    },
    /// The first cast to a `struct_name` pointer in `(function, block)` points to a fresh,
    /// zeroed object
    ZeroInitAfterStructCast {
        unit: String,
        function: String,
        block: String,
        struct_name: String,
    },
    /// After the first call to `routine` in `function`, a `struct_name` has been byte-copied
    /// from argument 1 to argument 0 and must be re-keyed
    RekeyAfterCopy {
        unit: String,
        function: String,
        routine: String,
        struct_name: String,
    },
}

/// How a bulk-copy routine is called
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CopyRoutine {
    /// A compiler intrinsic `(dst, src, len, ..)`, to be replaced by a call to `replacement`
    Intrinsic { replacement: String },
    /// A plain routine `(dst, src, len)`
    Plain,
    /// `(src, len)`, returning the freshly allocated destination
    Duplicate,
}

/// How an allocation routine decides to zero its memory
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZeroingAlloc {
    Always,
    /// Zeroes when argument `flag_arg` has `bit` set (or is not a constant)
    OnFlag { flag_arg: usize, bit: u64 },
}

/// The literal slots of `struct_name`'s field `field`: the first `prefix` 8-byte elements
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OffsetOverride {
    pub struct_name: String,
    pub field: usize,
    pub prefix: u64,
}

#[derive(Clone, Debug)]
pub struct AnnotationConfig {
    forced_tags: UnorderedMap<String, BTreeSet<usize>>,
    forced_exclusions: UnorderedMap<String, BTreeSet<usize>>,
    tag_patches: UnorderedMap<String, TagPatch>,
    merge_disabled_units: Vec<String>,
    offset_overrides: Vec<OffsetOverride>,
    skipped_global_fragments: Vec<String>,
    load_store_skip_prefixes: Vec<String>,
    load_store_skip_names: Vec<String>,
    copy_intrinsics: Vec<(String, String)>,
    copy_routines: Vec<String>,
    duplicate_routines: Vec<String>,
    zeroing_allocs: UnorderedMap<String, ZeroingAlloc>,
    zero_fill_prefix: String,
    zero_fill_replacement: String,
    zero_fill_excluded_functions: Vec<String>,
    percpu_sections: Vec<String>,
    percpu_setup_unit: Option<String>,
    percpu_setup_functions: Vec<String>,
    global_init_skipped_units: Vec<String>,
    param_reorder_functions: Vec<String>,
    site_patches: Vec<SitePatch>,
}

lazy_static::lazy_static! {
    /// The curated kernel annotations, shared read-only across runs
    pub static ref KERNEL_ANNOTATIONS: AnnotationConfig = AnnotationConfig::kernel();
}

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

impl AnnotationConfig {
    /// Routine tables only, without any curated exception
    pub fn new() -> Self {
        Self {
            forced_tags: Default::default(),
            forced_exclusions: Default::default(),
            tag_patches: Default::default(),
            merge_disabled_units: vec![],
            offset_overrides: vec![],
            skipped_global_fragments: vec![],
            load_store_skip_prefixes: vec![],
            load_store_skip_names: vec![],
            copy_intrinsics: vec![
                ("llvm.memcpy".into(), "__memcpy".into()),
                ("llvm.memmove".into(), "memmove".into()),
            ],
            copy_routines: strings(&["__memcpy", "memcpy", "memmove", "__memmove"]),
            duplicate_routines: strings(&["kmemdup"]),
            zeroing_allocs: [
                ("kzalloc".to_string(), ZeroingAlloc::Always),
                (
                    "kmem_cache_alloc".to_string(),
                    ZeroingAlloc::OnFlag {
                        flag_arg: 1,
                        bit: 0x100,
                    },
                ),
                (
                    "__kmalloc".to_string(),
                    ZeroingAlloc::OnFlag {
                        flag_arg: 1,
                        bit: 0x100,
                    },
                ),
            ]
            .into_iter()
            .collect(),
            zero_fill_prefix: "llvm.memset".into(),
            zero_fill_replacement: "__memset".into(),
            zero_fill_excluded_functions: vec![],
            percpu_sections: strings(&[
                ".data..percpu..first",
                ".data..percpu..page_aligned",
                ".data..percpu..read_mostly",
                ".data..percpu",
                ".data..percpu..shared_aligned",
            ]),
            percpu_setup_unit: None,
            percpu_setup_functions: vec![],
            global_init_skipped_units: vec![],
            param_reorder_functions: vec![],
            site_patches: vec![],
        }
    }

    /// The hand-verified kernel tables
    pub fn kernel() -> Self {
        let mut r = Self::new()
            .with_forced_tag("struct.of_device_id", 3)
            .with_forced_tag("struct.thread_struct", 0)
            .with_forced_tag("struct.thread_struct", 1)
            .with_forced_tag("struct.block_device", 5)
            .with_forced_tag("struct.block_device", 6)
            .with_forced_exclusion("struct.sigaction", 0)
            .with_tag_patch("kfree_rcu_work", TagPatch::NamedSource(strings(&["func"])))
            .with_tag_patch(
                "neigh_timer_handler",
                TagPatch::NamedSource(strings(&["output.i195", "connected_output.i"])),
            )
            .with_tag_patch(
                "proc_pident_instantiate",
                TagPatch::NamedSource(strings(&["op14"])),
            )
            .with_tag_patch(
                "copy_thread_tls",
                TagPatch::IndexedStore("arrayidx".into()),
            )
            .with_merge_disabled_unit("arch/riscv/kernel/stacktrace.c")
            .with_offset_override("struct.thread_struct", 2, 1)
            .with_skipped_global_fragment("__exitcall_")
            .with_load_store_skip_prefix("__vdso")
            .with_load_store_skip_name("kernel_thread")
            .with_zero_fill_excluded_function("radix_tree_node_rcu_free")
            .with_percpu_setup(
                "mm/percpu.c",
                &["pcpu_embed_first_chunk", "pcpu_page_first_chunk"],
            )
            .with_global_init_skipped_unit("arch/riscv/mm/init.c")
            .with_param_reorder("parse_one")
            .with_param_reorder("ndo_dflt_bridge_getlink");

        for f in [
            "of_irq_init",
            "process_one_work",
            "rtnetlink_rcv_msg",
            "__netlink_kernel_create",
            "__netlink_dump_start",
            "netlink_create",
            "printk_late_init",
            "msi_create_irq_domain",
            "crypto_ahash_finup",
            "crypto_ahash_digest",
            "ahash_save_req",
            "ahash_op_unaligned_done",
            "crypto_ahash_init_tfm",
            "ahash_def_finup",
            "ahash_def_finup_done1",
            "ahash_def_finup_done2",
            "print_cpu",
            "print_tickdevice",
            "blk_insert_flush",
            "blk_flush_complete_seq",
            "__cpuhp_state_remove_instance",
            "__cpuhp_remove_state_cpuslocked",
            "gpiochip_add_data_with_key",
            "gpiochip_irqchip_remove",
            "gpiochip_irqchip_add_key",
            "kthread_func",
            "of_clk_init",
            "skb_segment",
            "serial8250_register_8250_port",
            "serial8250_probe",
            "io_wq_create",
            "__neigh_update",
            "__regmap_init",
            "regmap_reinit_cache",
            "qdisc_alloc",
            "__ata_scsi_queuecmd",
            "rhashtable_insert_slow",
            "rht_deferred_worker",
            "rt_dst_clone",
            "tcp_gso_segment",
            "arp_constructor",
            "inet_create",
            "inet_frag_kill",
            "inet_frag_find",
            "ocores_i2c_probe",
            "nvmem_register",
        ] {
            r = r.with_tag_patch(f, TagPatch::AliasedSlot);
        }

        let alloc_type = |function: &str, block: &str, struct_name: &str| SitePatch::AllocType {
            function: function.into(),
            block: block.into(),
            struct_name: struct_name.into(),
        };
        for p in [
            alloc_type("rtnl_register_internal", "if.else66", "struct.rtnl_link"),
            alloc_type("add_sysfs_param", "if.then14", "struct.module_param_attrs"),
            alloc_type("spi_alloc_device", "if.end", "struct.spi_device"),
            alloc_type("__spi_alloc_controller", "if.end", "struct.spi_controller"),
            SitePatch::ZeroFillType {
                function: "__alloc_skb".into(),
                block: "if.end16".into(),
                struct_name: "struct.sk_buff".into(),
            },
            SitePatch::StagedRealloc {
                unit: "kernel/params.c".into(),
                function: "add_sysfs_param".into(),
                block: "if.end31".into(),
                routine: "krealloc".into(),
                struct_name: "struct.module_param_attrs".into(),
            },
            SitePatch::PrefixedZeroFill {
                value_prefix: "xa_alloc".into(),
                len: 16,
                offset: 8,
            },
            SitePatch::ZeroInitAtNamedValues {
                unit: "drivers/of/fdt.c".into(),
                function: "populate_properties".into(),
                struct_name: "struct.property".into(),
                sites: vec![
                    ("if.end31".into(), "and.i".into()),
                    ("if.end67.thread134".into(), "and.i131".into()),
                ],
            },
            SitePatch::ZeroInitAfterNamedCast {
                unit: "crypto/api.c".into(),
                function: "crypto_create_tfm".into(),
                block: "if.end".into(),
                value: "add.ptr".into(),
            },
            SitePatch::ZeroInitAfterAllocCast {
                unit: "kernel/module.c".into(),
                function: "mod_sysfs_setup".into(),
                block: "for.end.i".into(),
                routine: "kzalloc".into(),
            },
            SitePatch::ZeroInitAfterStructCast {
                unit: "net/core/dev.c".into(),
                function: "alloc_netdev_mqs".into(),
                block: "if.end30".into(),
                struct_name: "struct.net_device".into(),
            },
            SitePatch::RekeyAfterCopy {
                unit: "net/core/sock.c".into(),
                function: "sk_clone_lock".into(),
                routine: "__memcpy".into(),
                struct_name: "struct.sock".into(),
            },
        ] {
            r = r.with_site_patch(p);
        }
        r
    }

    pub fn with_forced_tag(mut self, struct_name: &str, field: usize) -> Self {
        self.forced_tags
            .entry(struct_name.to_owned())
            .or_default()
            .insert(field);
        self
    }

    pub fn with_forced_exclusion(mut self, struct_name: &str, field: usize) -> Self {
        self.forced_exclusions
            .entry(struct_name.to_owned())
            .or_default()
            .insert(field);
        self
    }

    pub fn with_tag_patch(mut self, function: &str, patch: TagPatch) -> Self {
        self.tag_patches.insert(function.to_owned(), patch);
        self
    }

    pub fn with_merge_disabled_unit(mut self, unit: &str) -> Self {
        self.merge_disabled_units.push(unit.to_owned());
        self
    }

    pub fn with_offset_override(mut self, struct_name: &str, field: usize, prefix: u64) -> Self {
        self.offset_overrides.push(OffsetOverride {
            struct_name: struct_name.to_owned(),
            field,
            prefix,
        });
        self
    }

    pub fn with_skipped_global_fragment(mut self, fragment: &str) -> Self {
        self.skipped_global_fragments.push(fragment.to_owned());
        self
    }

    pub fn with_load_store_skip_prefix(mut self, prefix: &str) -> Self {
        self.load_store_skip_prefixes.push(prefix.to_owned());
        self
    }

    pub fn with_load_store_skip_name(mut self, name: &str) -> Self {
        self.load_store_skip_names.push(name.to_owned());
        self
    }

    pub fn with_zero_fill_excluded_function(mut self, function: &str) -> Self {
        self.zero_fill_excluded_functions.push(function.to_owned());
        self
    }

    pub fn with_percpu_setup(mut self, unit: &str, functions: &[&str]) -> Self {
        self.percpu_setup_unit = Some(unit.to_owned());
        self.percpu_setup_functions = strings(functions);
        self
    }

    pub fn with_global_init_skipped_unit(mut self, unit: &str) -> Self {
        self.global_init_skipped_units.push(unit.to_owned());
        self
    }

    pub fn with_param_reorder(mut self, function: &str) -> Self {
        self.param_reorder_functions.push(function.to_owned());
        self
    }

    pub fn with_site_patch(mut self, patch: SitePatch) -> Self {
        self.site_patches.push(patch);
        self
    }

    /// Forced field tags, by struct name
    pub fn forced_tags(&self) -> impl Iterator<Item = (&str, &BTreeSet<usize>)> {
        self.forced_tags.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_forced_tag(&self, struct_name: &str, field: usize) -> bool {
        self.forced_tags
            .get(struct_name)
            .map_or(false, |s| s.contains(&field))
    }

    pub fn is_forced_exclusion(&self, struct_name: &str, field: usize) -> bool {
        self.forced_exclusions
            .get(struct_name)
            .map_or(false, |s| s.contains(&field))
    }

    pub fn tag_patch(&self, function: &str) -> Option<&TagPatch> {
        self.tag_patches.get(function)
    }

    pub fn merge_disabled(&self, unit: &str) -> bool {
        self.merge_disabled_units.iter().any(|u| unit.contains(u.as_str()))
    }

    /// Element prefix of the literal offset override for `(struct_name, field)`, if any
    pub fn offset_override(&self, struct_name: &str, field: usize) -> Option<u64> {
        self.offset_overrides
            .iter()
            .find(|o| o.struct_name == struct_name && o.field == field)
            .map(|o| o.prefix)
    }

    pub fn is_skipped_global(&self, name: &str) -> bool {
        self.skipped_global_fragments
            .iter()
            .any(|f| name.contains(f.as_str()))
    }

    pub fn skips_load_store(&self, function: &str) -> bool {
        self.load_store_skip_prefixes
            .iter()
            .any(|p| function.starts_with(p.as_str()))
            || self.load_store_skip_names.iter().any(|n| n == function)
    }

    pub fn copy_routine(&self, name: &str) -> Option<CopyRoutine> {
        if let Some((_, r)) = self
            .copy_intrinsics
            .iter()
            .find(|(p, _)| name.starts_with(p.as_str()))
        {
            Some(CopyRoutine::Intrinsic {
                replacement: r.clone(),
            })
        } else if self.copy_routines.iter().any(|r| r == name) {
            Some(CopyRoutine::Plain)
        } else if self.duplicate_routines.iter().any(|r| r == name) {
            Some(CopyRoutine::Duplicate)
        } else {
            None
        }
    }

    /// Is `name` the intrinsic bulk copy (not move) routine?
    pub fn is_copy_intrinsic(&self, name: &str) -> bool {
        self.copy_intrinsics
            .first()
            .map_or(false, |(p, _)| name.starts_with(p.as_str()))
    }

    pub fn zeroing_alloc(&self, name: &str) -> Option<ZeroingAlloc> {
        self.zeroing_allocs.get(name).cloned()
    }

    pub fn is_zero_fill(&self, name: &str) -> bool {
        name.starts_with(self.zero_fill_prefix.as_str())
    }

    pub fn zero_fill_replacement(&self) -> &str {
        &self.zero_fill_replacement
    }

    pub fn zero_fill_excluded(&self, function: &str) -> bool {
        self.zero_fill_excluded_functions.iter().any(|f| f == function)
    }

    pub fn is_percpu_section(&self, section: &str) -> bool {
        self.percpu_sections.iter().any(|s| s == section)
    }

    pub fn is_percpu_setup_unit(&self, unit: &str) -> bool {
        self.percpu_setup_unit
            .as_ref()
            .map_or(false, |u| unit.contains(u.as_str()))
    }

    pub fn is_percpu_setup_function(&self, function: &str) -> bool {
        self.percpu_setup_functions.iter().any(|f| f == function)
    }

    pub fn skips_global_init(&self, unit: &str) -> bool {
        self.global_init_skipped_units
            .iter()
            .any(|u| unit.contains(u.as_str()))
    }

    pub fn param_reorder_functions(&self) -> &[String] {
        &self.param_reorder_functions
    }

    pub fn site_patches(&self) -> &[SitePatch] {
        &self.site_patches
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_tables() {
        let k = &*KERNEL_ANNOTATIONS;
        assert!(k.is_forced_tag("struct.thread_struct", 1));
        assert!(!k.is_forced_tag("struct.thread_struct", 2));
        assert!(k.is_forced_exclusion("struct.sigaction", 0));
        assert_eq!(k.tag_patch("skb_segment"), Some(&TagPatch::AliasedSlot));
        assert_eq!(
            k.tag_patch("copy_thread_tls"),
            Some(&TagPatch::IndexedStore("arrayidx".into()))
        );
        assert!(k.merge_disabled("/src/linux/arch/riscv/kernel/stacktrace.c"));
        assert_eq!(k.offset_override("struct.thread_struct", 2), Some(1));
        assert!(k.is_skipped_global("__exitcall_foo_exit"));
        assert!(k.skips_load_store("__vdso_gettimeofday"));
        assert!(k.skips_load_store("kernel_thread"));
        assert!(!k.skips_load_store("kernel_threads"));
        assert!(k.skips_global_init("arch/riscv/mm/init.c"));
        assert_eq!(k.param_reorder_functions().len(), 2);
    }

    #[test]
    fn routine_tables() {
        let c = AnnotationConfig::new();
        assert_eq!(
            c.copy_routine("llvm.memcpy.p0i8.p0i8.i64"),
            Some(CopyRoutine::Intrinsic {
                replacement: "__memcpy".into()
            })
        );
        assert!(c.is_copy_intrinsic("llvm.memcpy.p0i8.p0i8.i64"));
        assert!(!c.is_copy_intrinsic("llvm.memmove.p0i8.p0i8.i64"));
        assert_eq!(c.copy_routine("memmove"), Some(CopyRoutine::Plain));
        assert_eq!(c.copy_routine("kmemdup"), Some(CopyRoutine::Duplicate));
        assert_eq!(c.copy_routine("strcpy"), None);
        assert_eq!(c.zeroing_alloc("kzalloc"), Some(ZeroingAlloc::Always));
        assert!(c.is_zero_fill("llvm.memset.p0i8.i64"));
        assert!(c.is_percpu_section(".data..percpu"));
        assert!(c.site_patches().is_empty());
        assert!(c.tag_patch("skb_segment").is_none());
    }
}

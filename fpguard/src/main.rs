use fpguard::*;

use std::path::PathBuf;

use clap::Parser;

/// Which curated annotation tables to harden with
#[derive(clap::ArgEnum, Clone, Copy, Debug)]
enum Annotations {
    /// The hand-verified kernel tables
    Kernel,
    /// Routine tables only, without any curated exception
    None,
}

/// Harden function pointers in kernel compilation units
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Classify and rewrite one compilation unit, given in textual form
    Harden {
        /// Path to the textual module
        input: PathBuf,
        /// Path to write the hardened module to (defaults to stdout)
        #[clap(long)]
        output: Option<PathBuf>,
        /// Annotation tables to use
        #[clap(long, arg_enum, default_value = "kernel")]
        annotations: Annotations,
        /// Number of parameters passed in registers, for parameter reordering
        #[clap(long)]
        register_param_slots: Option<usize>,
        /// Output the provenance of every function pointer tag as a GraphViz `.dot` file to the
        /// given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to disable parts of the pipeline
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<pass_config::CommandLinePassConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Harden {
            input,
            output,
            annotations: tables,
            register_param_slots,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            let mut cfg = pass_config::PassConfig::from(advanced_config);
            if let Some(n) = register_param_slots {
                cfg.register_param_slots = n;
            }
            let empty = annotations::AnnotationConfig::new();
            let ann = match tables {
                Annotations::Kernel => &*annotations::KERNEL_ANNOTATIONS,
                Annotations::None => &empty,
            };

            let text = match std::fs::read_to_string(&input) {
                Ok(t) => t,
                Err(e) => {
                    log::crit!("Input could not be read"; "path" => ?input, "error" => %e);
                    std::process::exit(1);
                }
            };
            let mut m = match parser::parse_module(&text) {
                Ok(m) => m,
                Err(e) => {
                    log::crit!("Input could not be parsed"; "path" => ?input, "error" => e);
                    std::process::exit(1);
                }
            };

            let report = pass::harden_module(&mut m, ann, &cfg);

            if let Some(path) = debug_output_graphviz {
                use std::io::Write;
                write!(
                    std::fs::File::create(path).unwrap(),
                    "{}",
                    report.classification.generate_dot(&m)
                )
                .unwrap();
            }

            if let Some(path) = output {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", m).unwrap();
            } else {
                print!("{}", m);
            }

            log::info!("Done";
                       "fp" => report.classification.num_fp(),
                       "fpp" => report.classification.num_fpp(),
                       "rewrites" => report.rewrites.total());
        }
    }
}

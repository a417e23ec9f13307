// Command-line entry point for Hookweave.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hookweave::application::config::{PipelineConfig, CONFIG_FILE};
use hookweave::application::Pipeline;
use hookweave::domain::injector::ConflictPolicy;
use hookweave::domain::registry::Registry;
use hookweave::infrastructure::{concurrency, logging, CargoCompiler, ProjectLoader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More log output (-v debug for hookweave, -vv everything)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Instrument the program and build it
    Build {
        #[command(flatten)]
        opts: PipelineArgs,

        /// Extra arguments passed to `cargo build`
        #[arg(last = true)]
        cargo_args: Vec<String>,
    },
    /// Print the declarations the rules match, as JSON
    Match {
        #[command(flatten)]
        opts: PipelineArgs,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load and validate rule files, then list their rules
    Rules {
        /// Rule files (.toml or .json)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Program root (directory holding Cargo.toml)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Configuration file (default: <path>/hookweave.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule files, in addition to those in the configuration
    #[arg(short, long = "rules")]
    rules: Vec<PathBuf>,

    /// Rule ids to disable for this build ("all" disables every rule)
    #[arg(long = "disable")]
    disable: Vec<String>,

    /// Rule ids that keep a runtime on/off switch
    #[arg(long = "runtime-toggle")]
    runtime_toggle: Vec<String>,

    #[arg(long, value_enum)]
    conflict_policy: Option<PolicyArg>,

    /// Keep instrumentation on declarations unreachable from entry points
    #[arg(long)]
    no_prune: bool,

    #[arg(long)]
    offline: bool,

    #[arg(long)]
    locked: bool,

    #[arg(long)]
    target_dir: Option<PathBuf>,

    /// Keep the working copy and write prettified instrumented sources
    #[arg(long)]
    keep_work_dir: bool,

    /// Worker threads (default: one per core)
    #[arg(short, long)]
    jobs: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Abort,
    Skip,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Abort => ConflictPolicy::Abort,
            PolicyArg::Skip => ConflictPolicy::Skip,
        }
    }
}

impl PipelineArgs {
    /// File configuration with command-line flags applied on top.
    fn config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::discover(&self.path)
                .with_context(|| format!("Failed to load {}", self.path.join(CONFIG_FILE).display()))?,
        };
        config.rules.extend(self.rules.iter().cloned());
        config.disabled_rules.extend(self.disable.iter().cloned());
        config.runtime_toggle.extend(self.runtime_toggle.iter().cloned());
        if let Some(policy) = self.conflict_policy {
            config.conflict_policy = policy.into();
        }
        config.prune_unreachable &= !self.no_prune;
        config.offline |= self.offline;
        config.locked |= self.locked;
        config.keep_work_dir |= self.keep_work_dir;
        if self.target_dir.is_some() {
            config.target_dir = self.target_dir.clone();
        }
        if self.jobs.is_some() {
            config.workers = self.jobs;
        }
        Ok(config)
    }
}

fn program_root(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("Program root {} not found", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Build { opts, cargo_args } => {
            let mut config = opts.config()?;
            config.cargo_args.extend(cargo_args);
            concurrency::init_thread_pool(config.workers)?;
            let root = program_root(&opts.path)?;

            let pipeline = Pipeline::new(&ProjectLoader, &CargoCompiler, &config);
            let result = pipeline.build(&root).context("Instrumented build failed")?;

            for warning in &result.warnings {
                eprintln!("{}", warning);
            }
            for artifact in &result.artifacts {
                if let Some(exe) = &artifact.executable {
                    println!("{}", exe.display());
                }
            }
            if let Some(dir) = &result.work_dir {
                println!("Working copy kept at {}", dir.display());
            }
        }
        Command::Match { opts, output } => {
            let config = opts.config()?;
            concurrency::init_thread_pool(config.workers)?;
            let root = program_root(&opts.path)?;

            let pipeline = Pipeline::new(&ProjectLoader, &CargoCompiler, &config);
            let analysis = pipeline.analyze(&root).context("Matching failed")?;
            let report = analysis.report()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, report)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("{} match(es) written to {}", analysis.matches.len(), path.display());
                }
                None => println!("{}", report),
            }
        }
        Command::Rules { files } => {
            let registry = Registry::load_files(&files).context("Invalid rule files")?;
            for rule in registry.rules() {
                println!("{:<28} {}  [{}]", rule.id, rule.selector(), rule.version);
            }
            println!("{} rule(s), {} hook crate(s)", registry.len(), registry.hook_crates().len());
        }
    }
    Ok(())
}

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use sealpack::config::{self, Overrides, Settings};
use sealpack::hasher::Sha256Digester;
use sealpack::pipeline::events::{NullSink, PackSink, StdoutSink};
use sealpack::pipeline::{Pipeline, SOURCE_HASH_FILE, SeaConfig};
use sealpack::planner::Plan;
use sealpack::runner::SystemRunner;
use sealpack::shim::{self, AssetNames, DescriptorAssets, FallbackFiles, NoAssets, Verdict};
use sealpack::targets::Target;
use sealpack::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct PackageArgs {
    /// Path to a build definition TOML
    build: PathBuf,
    /// Compiled entry file (overrides package.entry)
    #[arg(long)]
    entry: Option<PathBuf>,
    /// Output directory (overrides workspace.out_dir)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Base name of the produced executables
    #[arg(long)]
    name: Option<String>,
    /// Restrict to these targets (repeatable): linux, macos, win
    #[arg(long = "target", value_name = "TARGET")]
    targets: Vec<Target>,
    /// Max number of targets packaged concurrently (0 = use CPU count)
    #[arg(long)]
    max_parallel: Option<usize>,
}

impl PackageArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            entry: self.entry.clone(),
            out_dir: self.out_dir.clone(),
            name: self.name.clone(),
            targets: self.targets.clone(),
            max_parallel: self.max_parallel,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pre-compile hook: render the integrity shim into the output directory
    Shim {
        #[command(flatten)]
        args: PackageArgs,
    },
    /// Load config and print the packaging plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Post-compile hook: build, sign and fingerprint one executable per target
    Package {
        #[command(flatten)]
        args: PackageArgs,
    },
    /// Check a source or executable against its recorded fingerprint
    Verify {
        #[command(subcommand)]
        what: VerifyCommand,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum VerifyCommand {
    /// Compiled source against a hash.txt (default: next to the source)
    Source {
        file: PathBuf,
        #[arg(long)]
        hash: Option<PathBuf>,
    },
    /// The assets listed by a SEA config, as they would be embedded
    Descriptor { config: PathBuf },
    /// A finalized executable against its `-hash.txt` sidecar
    Binary { path: PathBuf },
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    if let Err(e) = sealpack::logging::init(args.log_json) {
        eprintln!("{e}");
    }

    match run(args.cmd) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), "{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cmd: Command) -> Result<ExitCode> {
    match cmd {
        Command::Shim { args } => cmd_shim(&args),
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Package { args } => cmd_package(&args),
        Command::Verify { what } => Ok(cmd_verify(what)),
        Command::Resolve { build } => cmd_resolve(&build),
    }
}

fn pipeline(settings: &Settings, sink: Arc<dyn PackSink>) -> Pipeline {
    let runner = SystemRunner::new(settings.timeout, sink.clone());
    Pipeline::new(
        Arc::new(runner),
        Arc::new(Sha256Digester),
        Arc::new(settings.provisioner()),
        sink,
        settings.options.clone(),
    )
}

fn cmd_shim(args: &PackageArgs) -> Result<ExitCode> {
    let doc = config::load(&args.build)?;
    let settings = config::resolve(&doc, &args.overrides(), false)?;
    let path = pipeline(&settings, Arc::new(NullSink)).prepare_shim(&settings.request)?;
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_plan(path: &Path, dot: bool) -> Result<ExitCode> {
    let doc = config::load(path)?;
    let settings = config::resolve(&doc, &Overrides::default(), false)?;
    let plan = Plan::for_request(&settings.request)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(ExitCode::SUCCESS);
    }
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<26}  {:<8} {:<16}  {}",
            i + 1,
            task.id,
            task.scope,
            task.phase,
            task.label
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_package(args: &PackageArgs) -> Result<ExitCode> {
    let doc = config::load(&args.build)?;
    let settings = config::resolve(&doc, &args.overrides(), true)?;
    let report = pipeline(&settings, Arc::new(StdoutSink::default()))
        .package(settings.request.clone())?;
    println!("REPORT: {}", report.request.report_path().display());
    report.check()?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_resolve(path: &Path) -> Result<ExitCode> {
    let doc = config::load(path)?;
    print!("{}", doc.to_toml()?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_verify(what: VerifyCommand) -> ExitCode {
    let digester = Sha256Digester;
    let result = match what {
        VerifyCommand::Source { file, hash } => verify_source(&digester, &file, hash),
        VerifyCommand::Descriptor { config } => verify_descriptor(&digester, &config),
        VerifyCommand::Binary { path } => verify_binary(&digester, &path),
    };
    if let Ok(v) = &result {
        println!("{}", verdict_label(v));
    }
    shim::verify::guard(result);
    ExitCode::SUCCESS
}

fn verdict_label(v: &Verdict) -> &'static str {
    match v {
        Verdict::Verified => "verified",
        Verdict::Tampered { .. } => "tampered",
        Verdict::Unpackaged => "unpackaged",
    }
}

fn verify_source(digester: &Sha256Digester, file: &Path, hash: Option<PathBuf>) -> Result<Verdict> {
    let mut files = shim::fallback_for(file);
    if let Some(h) = hash {
        files.hash = h;
    }
    let names = AssetNames::new(sealpack::util::file_name_string(file)?);
    shim::verify::verify(digester, &NoAssets, &names, Some(&files))
}

fn verify_descriptor(digester: &Sha256Digester, descriptor: &Path) -> Result<Verdict> {
    let cfg = SeaConfig::read(descriptor)?;
    let main_name = sealpack::util::file_name_string(&cfg.main)?;
    let source = if cfg.assets.contains_key(&main_name) {
        main_name
    } else {
        cfg.assets
            .keys()
            .find(|k| k.as_str() != SOURCE_HASH_FILE)
            .cloned()
            .ok_or_else(|| {
                Error::integrity(format!(
                    "{} embeds no source asset",
                    descriptor.display()
                ))
            })?
    };
    let assets = DescriptorAssets::load(descriptor)?;
    shim::verify::verify(digester, &assets, &AssetNames::new(source), None)
}

fn verify_binary(digester: &Sha256Digester, path: &Path) -> Result<Verdict> {
    let name = sealpack::util::file_name_string(path)?;
    let files = FallbackFiles {
        source: path.to_path_buf(),
        hash: path.with_file_name(format!("{name}-hash.txt")),
    };
    match shim::verify::verify_files(digester, &files)? {
        Verdict::Unpackaged => Err(Error::integrity(format!(
            "no fingerprint record at {}",
            files.hash.display()
        ))),
        v => Ok(v),
    }
}

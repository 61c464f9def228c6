use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::hasher::{self, Digester, FingerprintRecord, Subject};
use crate::runner::{CommandRunner, CommandSpec, Invocation, ToolFailure};
use crate::runtime::RuntimeProvisioner;
use crate::shim::{self, ShimTemplate};
use crate::targets::Target;
use crate::toolchain::ToolchainConfig;
use crate::util;

pub mod descriptor;
pub mod events;
mod report;
mod request;
mod stage;

pub use descriptor::SeaConfig;
pub use events::{PackEvent, PackSink};
pub use report::{PackagingReport, TargetOutcome};
pub use request::{
    BuildRequest, ModuleKind, REPORT_FILE, SOURCE_HASH_FILE, StageArtifact, WORK_DIR_NAME,
};
pub use stage::{Stage, TargetState};

/// Why a single stage of a single target failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    Tool(ToolFailure),
    Io(String),
    /// A command exited cleanly but did not leave its expected output behind.
    Missing(PathBuf),
}

impl StageError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StageError::Tool(f) => f.exit_code(),
            _ => None,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Tool(t) => write!(f, "{t}"),
            StageError::Io(msg) => f.write_str(msg),
            StageError::Missing(p) => write!(f, "expected output {} was not produced", p.display()),
        }
    }
}

impl std::error::Error for StageError {}

impl From<ToolFailure> for StageError {
    fn from(f: ToolFailure) -> Self {
        StageError::Tool(f)
    }
}

impl From<Error> for StageError {
    fn from(e: Error) -> Self {
        StageError::Io(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub toolchain: ToolchainConfig,
    pub disable_experimental_warning: bool,
    /// Targets packaged at once. 0 means one per CPU.
    pub max_parallel: usize,
    /// Keep `<out>/.sealpack/<target>/` after a target succeeds.
    pub keep_work: bool,
    pub shim: ShimTemplate,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            toolchain: ToolchainConfig::default(),
            disable_experimental_warning: false,
            max_parallel: 1,
            keep_work: false,
            shim: ShimTemplate::Builtin,
        }
    }
}

pub struct Pipeline {
    runner: Arc<dyn CommandRunner>,
    digester: Arc<dyn Digester>,
    provisioner: Arc<dyn RuntimeProvisioner>,
    sink: Arc<dyn PackSink>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        digester: Arc<dyn Digester>,
        provisioner: Arc<dyn RuntimeProvisioner>,
        sink: Arc<dyn PackSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            runner,
            digester,
            provisioner,
            sink,
            options,
        }
    }

    /// Pre-compile hook: render the integrity shim so the bundler can add it
    /// as an extra entry. The entry file does not have to exist yet.
    pub fn prepare_shim(&self, request: &BuildRequest) -> Result<PathBuf> {
        if request.output_dir.as_os_str().is_empty() {
            return Err(Error::config("output directory is not set"));
        }
        shim::write_shim(request, &self.options.shim)
    }

    /// Post-compile hook. Configuration problems and a failing source
    /// fingerprint abort the run; target failures are reported in the
    /// returned report.
    pub fn package(&self, request: BuildRequest) -> Result<PackagingReport> {
        request.validate()?;
        let started_at = Utc::now();
        util::ensure_dir(&request.output_dir)?;

        let source = hasher::stamp(
            &*self.digester,
            Subject::Source,
            &request.entry_file,
            &request.source_hash_path(),
        )?;
        tracing::info!(
            entry = %request.entry_file.display(),
            digest = %source.digest,
            "source fingerprinted"
        );
        self.sink.emit(PackEvent::SourceFingerprinted {
            digest: source.digest.clone(),
            record: source.record.clone(),
        });

        let targets = Target::ordered(&request.targets);
        let targets = self.run_targets(&request, &source, &targets);

        if targets.iter().all(TargetOutcome::succeeded) && !self.options.keep_work {
            // Only succeeds once every per-target dir is gone; a download
            // cache keeps it alive.
            let _ = fs::remove_dir(request.work_dir());
        }

        let report = PackagingReport {
            tool_version: env!("CARGO_PKG_VERSION"),
            started_at,
            finished_at: Utc::now(),
            request,
            source,
            targets,
        };
        util::write_json_pretty(&report.request.report_path(), &report)?;

        let succeeded = report.succeeded_count();
        let failed = report.targets.len() - succeeded;
        tracing::info!(succeeded, failed, "packaging finished");
        self.sink.emit(PackEvent::Done {
            ok: failed == 0,
            succeeded,
            failed,
        });
        Ok(report)
    }

    fn workers(&self, targets: usize) -> usize {
        let n = if self.options.max_parallel == 0 {
            num_cpus::get().max(1)
        } else {
            self.options.max_parallel
        };
        n.min(targets).max(1)
    }

    fn run_targets(
        &self,
        req: &BuildRequest,
        source: &FingerprintRecord,
        targets: &[Target],
    ) -> Vec<TargetOutcome> {
        let workers = self.workers(targets.len());
        if workers <= 1 {
            return targets
                .iter()
                .map(|t| self.run_target(req, source, *t))
                .collect();
        }

        let queue = Mutex::new(targets.iter().copied().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel::<TargetOutcome>();
        std::thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                s.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut q) => q.pop_front(),
                            Err(_) => None,
                        };
                        let Some(target) = next else {
                            break;
                        };
                        let _ = tx.send(self.run_target(req, source, target));
                    }
                });
            }
        });
        drop(tx);

        let mut by_target: BTreeMap<Target, TargetOutcome> =
            rx.into_iter().map(|o| (o.target, o)).collect();
        targets
            .iter()
            .filter_map(|t| by_target.remove(t))
            .collect()
    }

    fn run_target(
        &self,
        req: &BuildRequest,
        source: &FingerprintRecord,
        target: Target,
    ) -> TargetOutcome {
        let start = Instant::now();
        let artifacts = req.artifacts(target);
        self.sink.emit(PackEvent::TargetStarted { target });
        tracing::info!(platform = %target, "packaging target");

        let mut state = TargetState::Pending;
        let mut binary = None;
        for stage in Stage::sequence(target.spec()) {
            self.sink.emit(PackEvent::StageStarted { target, stage });
            let t0 = Instant::now();
            let res = self.run_stage(stage, target, req, source, &artifacts);
            let ok = res.is_ok();
            self.sink.emit(PackEvent::StageFinished {
                target,
                stage,
                ok,
                elapsed_ms: t0.elapsed().as_millis(),
            });
            match res {
                Ok(record) => {
                    if record.is_some() {
                        binary = record;
                    }
                    state = stage.reached();
                }
                Err(e) => {
                    tracing::warn!(platform = %target, %stage, "stage failed: {e}");
                    state = TargetState::Failed {
                        stage,
                        exit_code: e.exit_code(),
                        error: format!("{target}.{stage}: {e}"),
                    };
                    break;
                }
            }
        }

        let elapsed_ms = start.elapsed().as_millis();
        let error = match &state {
            TargetState::Failed { error, .. } => Some(error.clone()),
            _ => None,
        };
        if error.is_some() {
            binary = None;
            self.discard_outputs(target, &artifacts);
        } else if !self.options.keep_work {
            if let Err(e) = fs::remove_dir_all(&artifacts.work_dir) {
                tracing::debug!(platform = %target, "failed to remove work dir: {e}");
            }
        }

        self.sink.emit(PackEvent::TargetFinished {
            target,
            ok: error.is_none(),
            error_log: error.as_ref().map(|_| artifacts.error_log()),
            error,
            elapsed_ms,
        });
        TargetOutcome {
            target,
            state,
            binary,
            elapsed_ms,
        }
    }

    /// A failed target must not leave a binary or sidecar that looks
    /// finished. Working files stay for inspection.
    fn discard_outputs(&self, target: Target, artifacts: &StageArtifact) {
        for p in [&artifacts.final_binary, &artifacts.hash_file] {
            if let Err(e) = util::remove_file_if_exists(p) {
                tracing::warn!(platform = %target, "{e}");
            }
        }
    }

    fn invoke(
        &self,
        target: Target,
        stage: Stage,
        command: &CommandSpec,
        artifacts: &StageArtifact,
    ) -> std::result::Result<(), StageError> {
        self.runner.run(&Invocation {
            target,
            stage,
            command,
            artifacts,
        })?;
        Ok(())
    }

    fn run_stage(
        &self,
        stage: Stage,
        target: Target,
        req: &BuildRequest,
        source: &FingerprintRecord,
        artifacts: &StageArtifact,
    ) -> std::result::Result<Option<FingerprintRecord>, StageError> {
        let tc = &self.options.toolchain;
        match stage {
            Stage::Configure => {
                util::remove_file_if_exists(&artifacts.final_binary)?;
                util::remove_file_if_exists(&artifacts.hash_file)?;
                util::ensure_dir(&artifacts.work_dir)?;
                util::remove_file_if_exists(&artifacts.blob_file)?;
                util::remove_file_if_exists(&artifacts.host_binary)?;
                util::remove_file_if_exists(&artifacts.error_log())?;
                self.descriptor(req, source, artifacts)?
                    .write(&artifacts.config_file)?;
            }
            Stage::GeneratePayload => {
                self.invoke(
                    target,
                    stage,
                    &tc.generate_blob(&artifacts.config_file),
                    artifacts,
                )?;
                require(&artifacts.blob_file)?;
            }
            Stage::CopyRuntime => {
                self.provisioner
                    .provision(target, artifacts, &*self.runner)?;
                require(&artifacts.host_binary)?;
            }
            Stage::StripSignature => {
                self.invoke(
                    target,
                    stage,
                    &tc.strip_signature(&artifacts.host_binary),
                    artifacts,
                )?;
            }
            Stage::InjectPayload => {
                self.invoke(
                    target,
                    stage,
                    &tc.inject(target.spec(), &artifacts.host_binary, &artifacts.blob_file),
                    artifacts,
                )?;
            }
            Stage::Sign => {
                self.invoke(target, stage, &tc.sign(&artifacts.host_binary), artifacts)?;
            }
            Stage::Finalize => {
                fs::rename(&artifacts.host_binary, &artifacts.final_binary).map_err(|e| {
                    StageError::Io(format!(
                        "failed to move {} -> {}: {e}",
                        artifacts.host_binary.display(),
                        artifacts.final_binary.display()
                    ))
                })?;
            }
            Stage::Fingerprint => {
                let record = hasher::stamp(
                    &*self.digester,
                    Subject::Binary,
                    &artifacts.final_binary,
                    &artifacts.hash_file,
                )?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn descriptor(
        &self,
        req: &BuildRequest,
        source: &FingerprintRecord,
        artifacts: &StageArtifact,
    ) -> std::result::Result<SeaConfig, StageError> {
        let main = absolute(&req.entry_file)?;
        let mut assets = BTreeMap::new();
        assets.insert(req.entry_asset_name()?, main.clone());
        assets.insert(SOURCE_HASH_FILE.to_string(), absolute(&source.record)?);
        Ok(SeaConfig {
            main,
            output: absolute(&artifacts.blob_file)?,
            assets,
            disable_experimental_warning: self.options.disable_experimental_warning,
        })
    }
}

fn require(path: &Path) -> std::result::Result<(), StageError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StageError::Missing(path.to_path_buf()))
    }
}

fn absolute(p: &Path) -> std::result::Result<PathBuf, StageError> {
    std::path::absolute(p)
        .map_err(|e| StageError::Io(format!("failed to resolve {}: {e}", p.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{Sha256Digester, sha256_hex};
    use crate::pipeline::events::NullSink;

    /// Stands in for node/postject/codesign by touching the files they would.
    struct FakeToolchain {
        fail: Option<(Target, Stage)>,
        calls: Mutex<Vec<(Target, Stage, String)>>,
    }

    impl FakeToolchain {
        fn new(fail: Option<(Target, Stage)>) -> Self {
            Self {
                fail,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for FakeToolchain {
        fn run(&self, inv: &Invocation<'_>) -> std::result::Result<(), ToolFailure> {
            self.calls.lock().expect("calls").push((
                inv.target,
                inv.stage,
                inv.command.to_string(),
            ));
            if self.fail == Some((inv.target, inv.stage)) {
                return Err(ToolFailure::Exit {
                    command: inv.command.to_string(),
                    code: Some(1),
                });
            }
            let art = inv.artifacts;
            match inv.stage {
                Stage::GeneratePayload => fs::write(&art.blob_file, b"BLOB").expect("blob"),
                Stage::CopyRuntime => fs::write(&art.host_binary, b"NODE").expect("runtime"),
                Stage::InjectPayload => {
                    let mut bin = fs::read(&art.host_binary).expect("host binary");
                    bin.extend(fs::read(&art.blob_file).expect("blob"));
                    fs::write(&art.host_binary, bin).expect("inject");
                }
                _ => {}
            }
            Ok(())
        }
    }

    struct HostCopy;

    impl RuntimeProvisioner for HostCopy {
        fn provision(
            &self,
            target: Target,
            artifacts: &StageArtifact,
            runner: &dyn CommandRunner,
        ) -> std::result::Result<(), StageError> {
            let cmd = CommandSpec::new("cp");
            runner.run(&Invocation {
                target,
                stage: Stage::CopyRuntime,
                command: &cmd,
                artifacts,
            })?;
            Ok(())
        }
    }

    fn pipeline(runner: Arc<FakeToolchain>, options: PipelineOptions) -> Pipeline {
        Pipeline::new(
            runner,
            Arc::new(Sha256Digester),
            Arc::new(HostCopy),
            Arc::new(NullSink),
            options,
        )
    }

    fn request(dir: &Path) -> BuildRequest {
        let entry = dir.join("app.js");
        fs::write(&entry, "hello").expect("entry");
        BuildRequest::new(entry, dir.join("dist"))
    }

    #[test]
    fn packages_every_target_in_matrix_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeToolchain::new(None));
        let req = request(tmp.path());
        let out = req.output_dir.clone();

        let report = pipeline(runner.clone(), PipelineOptions::default())
            .package(req)
            .expect("package");

        assert!(report.all_succeeded());
        assert_eq!(report.source.digest, sha256_hex(b"hello"));
        let order: Vec<Target> = report.targets.iter().map(|o| o.target).collect();
        assert_eq!(order, Target::ALL.to_vec());
        for name in ["app-linux", "app-macos", "app-win.exe"] {
            let bin = fs::read(out.join(name)).expect("final binary");
            assert_eq!(bin, b"NODEBLOB");
            assert_eq!(
                fs::read_to_string(out.join(format!("{name}-hash.txt"))).expect("sidecar"),
                sha256_hex(b"NODEBLOB")
            );
        }
        assert!(!out.join(WORK_DIR_NAME).exists(), "work dirs are cleaned up");
        assert!(out.join(REPORT_FILE).is_file());

        let calls = runner.calls.lock().expect("calls");
        let mac_sign = calls
            .iter()
            .filter(|(t, s, _)| *t == Target::Macos && *s == Stage::Sign)
            .count();
        let linux_sign = calls
            .iter()
            .filter(|(t, s, _)| *t == Target::Linux && *s == Stage::Sign)
            .count();
        assert_eq!((mac_sign, linux_sign), (1, 0));
    }

    #[test]
    fn failing_target_is_skipped_and_siblings_finish() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeToolchain::new(Some((Target::Macos, Stage::Sign))));
        let req = request(tmp.path());
        let out = req.output_dir.clone();

        let report = pipeline(runner, PipelineOptions::default())
            .package(req)
            .expect("package");

        assert!(!report.all_succeeded());
        let mac = report.outcome(Target::Macos).expect("macos outcome");
        match &mac.state {
            TargetState::Failed {
                stage, exit_code, ..
            } => {
                assert_eq!(*stage, Stage::Sign);
                assert_eq!(*exit_code, Some(1));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(!out.join("app-macos").exists());
        assert!(!out.join("app-macos-hash.txt").exists());
        assert!(out.join("app-linux").is_file());
        assert!(out.join("app-win.exe").is_file());
        assert!(out.join(".sealpack/macos/sea-config.json").is_file());
    }

    #[test]
    fn descriptor_lists_source_and_hash_assets() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeToolchain::new(Some((
            Target::Linux,
            Stage::GeneratePayload,
        ))));
        let mut req = request(tmp.path());
        req.targets = vec![Target::Linux];
        let out = req.output_dir.clone();

        let opts = PipelineOptions {
            disable_experimental_warning: true,
            ..PipelineOptions::default()
        };
        pipeline(runner, opts).package(req).expect("package");

        let cfg = SeaConfig::read(&out.join(".sealpack/linux/sea-config.json")).expect("read");
        assert!(cfg.main.ends_with("app.js"));
        assert!(cfg.output.ends_with("sea-prep.blob"));
        assert!(cfg.assets["app.js"].ends_with("app.js"));
        assert!(cfg.assets["hash.txt"].ends_with("dist/hash.txt"));
        assert!(cfg.disable_experimental_warning);
    }

    #[test]
    fn missing_blob_after_clean_exit_fails_the_stage() {
        struct SilentRunner;
        impl CommandRunner for SilentRunner {
            fn run(&self, inv: &Invocation<'_>) -> std::result::Result<(), ToolFailure> {
                if inv.stage == Stage::CopyRuntime {
                    fs::write(&inv.artifacts.host_binary, b"NODE").expect("runtime");
                }
                Ok(())
            }
        }

        let tmp = tempfile::tempdir().expect("tempdir");
        let mut req = request(tmp.path());
        req.targets = vec![Target::Win];
        let p = Pipeline::new(
            Arc::new(SilentRunner),
            Arc::new(Sha256Digester),
            Arc::new(HostCopy),
            Arc::new(NullSink),
            PipelineOptions::default(),
        );
        let report = p.package(req).expect("package");
        assert_eq!(
            report.targets[0].state.failed_stage(),
            Some(Stage::GeneratePayload)
        );
    }

    #[test]
    fn parallel_run_reports_in_matrix_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeToolchain::new(None));
        let mut req = request(tmp.path());
        req.targets = vec![Target::Win, Target::Linux, Target::Macos];

        let opts = PipelineOptions {
            max_parallel: 3,
            ..PipelineOptions::default()
        };
        let report = pipeline(runner, opts).package(req).expect("package");
        let order: Vec<Target> = report.targets.iter().map(|o| o.target).collect();
        assert_eq!(order, Target::ALL.to_vec());
        assert!(report.all_succeeded());
    }

    #[test]
    fn invalid_request_runs_no_stage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeToolchain::new(None));
        let req = BuildRequest::new(tmp.path().join("missing.js"), tmp.path().join("dist"));

        let err = pipeline(runner.clone(), PipelineOptions::default())
            .package(req)
            .expect_err("config error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(runner.calls.lock().expect("calls").is_empty());
        assert!(!tmp.path().join("dist").join(SOURCE_HASH_FILE).exists());
    }
}

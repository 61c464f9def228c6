use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::hasher::sha256_hex;
use crate::pipeline::{Stage, StageArtifact, StageError};
use crate::runner::{CommandRunner, Invocation};
use crate::targets::Target;
use crate::toolchain::ToolchainConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeSource {
    pub path: Option<String>,
    pub url: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Host,
    File {
        path: PathBuf,
        sha256: Option<String>,
    },
    Url {
        url: String,
        sha256: Option<String>,
    },
}

pub trait RuntimeProvisioner: Send + Sync {
    /// Leave a fresh, writable runtime binary at `artifacts.host_binary`.
    fn provision(
        &self,
        target: Target,
        artifacts: &StageArtifact,
        runner: &dyn CommandRunner,
    ) -> Result<(), StageError>;
}

pub struct ToolchainProvisioner {
    toolchain: ToolchainConfig,
    sources: BTreeMap<Target, ResolvedSource>,
    cache_dir: PathBuf,
    download_timeout: Duration,
}

impl ToolchainProvisioner {
    pub fn new(toolchain: ToolchainConfig, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            toolchain,
            sources: BTreeMap::new(),
            cache_dir: cache_dir.into(),
            download_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_source(mut self, target: Target, source: ResolvedSource) -> Self {
        self.sources.insert(target, source);
        self
    }

    pub fn source(&self, target: Target) -> &ResolvedSource {
        self.sources.get(&target).unwrap_or(&ResolvedSource::Host)
    }

    fn copy_from_host(
        &self,
        target: Target,
        artifacts: &StageArtifact,
        runner: &dyn CommandRunner,
    ) -> Result<(), StageError> {
        let cmd = self.toolchain.copy_host_runtime(&artifacts.host_binary);
        runner.run(&Invocation {
            target,
            stage: Stage::CopyRuntime,
            command: &cmd,
            artifacts,
        })?;
        Ok(())
    }

    fn download(
        &self,
        target: Target,
        url: &str,
        sha256: Option<&str>,
    ) -> Result<PathBuf, StageError> {
        let cached = self.cache_dir.join(format!(
            "node-{}-{}",
            target.label(),
            &sha256_hex(url.as_bytes())[..16]
        ));
        if cached.is_file() {
            match verify_checksum(&cached, sha256) {
                Ok(()) => {
                    tracing::debug!(platform = %target, path = %cached.display(), "runtime cache hit");
                    return Ok(cached);
                }
                Err(e) => {
                    tracing::warn!(platform = %target, "discarding cached runtime: {e}");
                    let _ = fs::remove_file(&cached);
                }
            }
        }

        tracing::info!(platform = %target, %url, "downloading runtime");
        let client = reqwest::blocking::Client::builder()
            .timeout(self.download_timeout)
            .build()
            .map_err(|e| StageError::Io(format!("failed to build HTTP client: {e}")))?;
        let res = client
            .get(url)
            .send()
            .map_err(|e| StageError::Io(format!("runtime download failed: {e}")))?;
        if !res.status().is_success() {
            return Err(StageError::Io(format!(
                "runtime download from {url} failed with status {}",
                res.status()
            )));
        }
        let body = res
            .bytes()
            .map_err(|e| StageError::Io(format!("runtime download body read failed: {e}")))?;
        if let Some(expected) = sha256 {
            let actual = sha256_hex(&body);
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(StageError::Io(format!(
                    "runtime from {url} has sha256 {actual}, expected {expected}"
                )));
            }
        }
        crate::util::atomic_write(&cached, &body).map_err(|e| StageError::Io(e.to_string()))?;
        Ok(cached)
    }
}

impl RuntimeProvisioner for ToolchainProvisioner {
    fn provision(
        &self,
        target: Target,
        artifacts: &StageArtifact,
        runner: &dyn CommandRunner,
    ) -> Result<(), StageError> {
        match self.source(target) {
            ResolvedSource::Host => self.copy_from_host(target, artifacts, runner),
            ResolvedSource::File { path, sha256 } => {
                verify_checksum(path, sha256.as_deref())?;
                copy_executable(path, &artifacts.host_binary)
            }
            ResolvedSource::Url { url, sha256 } => {
                let cached = self.download(target, url, sha256.as_deref())?;
                copy_executable(&cached, &artifacts.host_binary)
            }
        }
    }
}

fn verify_checksum(path: &Path, expected: Option<&str>) -> Result<(), StageError> {
    let Some(expected) = expected.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let bytes = fs::read(path)
        .map_err(|e| StageError::Io(format!("failed to read {}: {e}", path.display())))?;
    let actual = sha256_hex(&bytes);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(StageError::Io(format!(
            "runtime {} has sha256 {actual}, expected {expected}",
            path.display()
        )));
    }
    Ok(())
}

fn copy_executable(src: &Path, dest: &Path) -> Result<(), StageError> {
    fs::copy(src, dest).map_err(|e| {
        StageError::Io(format!(
            "failed to copy runtime {} -> {}: {e}",
            src.display(),
            dest.display()
        ))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755)).map_err(|e| {
            StageError::Io(format!("failed to chmod {}: {e}", dest.display()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ToolFailure;

    struct NoRunner;

    impl CommandRunner for NoRunner {
        fn run(&self, inv: &Invocation<'_>) -> Result<(), ToolFailure> {
            panic!("unexpected command: {}", inv.command);
        }
    }

    #[test]
    fn prefetched_file_is_copied_and_checked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let prebuilt = tmp.path().join("node-macos-arm64");
        fs::write(&prebuilt, b"runtime-bytes").expect("write runtime");
        let art = StageArtifact::new(tmp.path(), Target::Macos, "app");
        fs::create_dir_all(&art.work_dir).expect("work dir");

        let good = ToolchainProvisioner::new(ToolchainConfig::default(), tmp.path().join("cache"))
            .with_source(
                Target::Macos,
                ResolvedSource::File {
                    path: prebuilt.clone(),
                    sha256: Some(sha256_hex(b"runtime-bytes")),
                },
            );
        good.provision(Target::Macos, &art, &NoRunner)
            .expect("provision");
        assert_eq!(fs::read(&art.host_binary).expect("copied"), b"runtime-bytes");

        let bad = ToolchainProvisioner::new(ToolchainConfig::default(), tmp.path().join("cache"))
            .with_source(
                Target::Macos,
                ResolvedSource::File {
                    path: prebuilt,
                    sha256: Some("00".repeat(32)),
                },
            );
        let err = bad
            .provision(Target::Macos, &art, &NoRunner)
            .expect_err("checksum mismatch");
        assert!(err.to_string().contains("expected"), "{err}");
    }

    #[test]
    fn unconfigured_targets_use_the_host_runtime() {
        let p = ToolchainProvisioner::new(ToolchainConfig::default(), "/tmp/cache");
        assert_eq!(p.source(Target::Win), &ResolvedSource::Host);
    }
}

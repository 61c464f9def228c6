use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::targets::Target;

pub const SOURCE_HASH_FILE: &str = "hash.txt";
pub const WORK_DIR_NAME: &str = ".sealpack";
pub const REPORT_FILE: &str = "sealpack-report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// CommonJS output.
    #[default]
    Script,
    /// ES module output.
    Module,
}

/// Inputs of one packaging run. Immutable once handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRequest {
    pub entry_file: PathBuf,
    pub output_dir: PathBuf,
    pub base_name: String,
    pub module_kind: ModuleKind,
    pub typed: bool,
    pub targets: Vec<Target>,
}

impl BuildRequest {
    pub fn new(entry_file: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            entry_file: entry_file.into(),
            output_dir: output_dir.into(),
            base_name: "app".into(),
            module_kind: ModuleKind::Script,
            typed: false,
            targets: Target::ALL.to_vec(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::config("output directory is not set"));
        }
        if self.entry_file.as_os_str().is_empty() {
            return Err(Error::config("entry file is not set"));
        }
        if !self.entry_file.is_file() {
            return Err(Error::config(format!(
                "entry file {} does not exist (has the bundle been compiled?)",
                self.entry_file.display()
            )));
        }
        self.entry_asset_name()?;

        let base = self.base_name.trim();
        if base.is_empty() {
            return Err(Error::config("base output name is empty"));
        }
        if base.contains(['/', '\\']) || base == "." || base == ".." {
            return Err(Error::config(format!(
                "base output name '{}' must be a plain file name",
                self.base_name
            )));
        }

        if self.targets.is_empty() {
            return Err(Error::config("no targets selected"));
        }
        let mut seen = BTreeSet::new();
        for t in &self.targets {
            if !seen.insert(*t) {
                return Err(Error::config(format!("target '{t}' listed twice")));
            }
        }
        Ok(())
    }

    /// Logical name the compiled source is embedded under.
    pub fn entry_asset_name(&self) -> Result<String> {
        self.entry_file
            .file_name()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                Error::config(format!(
                    "entry file '{}' has no usable file name",
                    self.entry_file.display()
                ))
            })
    }

    pub fn source_hash_path(&self) -> PathBuf {
        self.output_dir.join(SOURCE_HASH_FILE)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.output_dir.join(WORK_DIR_NAME)
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_FILE)
    }

    pub fn artifacts(&self, target: Target) -> StageArtifact {
        StageArtifact::new(&self.output_dir, target, self.base_name.trim())
    }
}

/// Working paths of one target. Everything but the final binary and its
/// sidecar lives under `<out>/.sealpack/<target>/`, so targets never share a
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageArtifact {
    pub work_dir: PathBuf,
    pub config_file: PathBuf,
    pub blob_file: PathBuf,
    pub host_binary: PathBuf,
    pub final_binary: PathBuf,
    pub hash_file: PathBuf,
}

impl StageArtifact {
    pub fn new(output_dir: &Path, target: Target, base_name: &str) -> Self {
        let work_dir = output_dir.join(WORK_DIR_NAME).join(target.label());
        let suffix = target.spec().exe_suffix;
        let final_name = target.binary_name(base_name);
        Self {
            config_file: work_dir.join("sea-config.json"),
            blob_file: work_dir.join("sea-prep.blob"),
            host_binary: work_dir.join(format!("node-{}{suffix}", target.label())),
            final_binary: output_dir.join(&final_name),
            hash_file: output_dir.join(format!("{final_name}-hash.txt")),
            work_dir,
        }
    }

    pub fn error_log(&self) -> PathBuf {
        self.work_dir.join("error.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request_in(dir: &Path) -> BuildRequest {
        let entry = dir.join("app.js");
        fs::write(&entry, "hello").expect("write entry");
        BuildRequest::new(entry, dir.join("dist"))
    }

    #[test]
    fn missing_entry_is_a_config_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let req = BuildRequest::new(tmp.path().join("nope.js"), tmp.path());
        let err = req.validate().expect_err("missing entry");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn rejects_bad_base_names_and_duplicate_targets() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut req = request_in(tmp.path());
        req.validate().expect("defaults are valid");

        req.base_name = "../evil".into();
        assert!(req.validate().is_err());

        req.base_name = "app".into();
        req.targets = vec![Target::Linux, Target::Linux];
        let err = req.validate().expect_err("duplicate").to_string();
        assert!(err.contains("listed twice"), "{err}");

        req.targets.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn artifact_paths_are_namespaced_per_target() {
        let out = Path::new("/out");
        let win = StageArtifact::new(out, Target::Win, "app");
        assert_eq!(win.final_binary, out.join("app-win.exe"));
        assert_eq!(win.hash_file, out.join("app-win.exe-hash.txt"));
        assert_eq!(win.host_binary, out.join(".sealpack/win/node-win.exe"));

        let linux = StageArtifact::new(out, Target::Linux, "app");
        assert_ne!(linux.config_file, win.config_file);
        assert_ne!(linux.blob_file, win.blob_file);
    }
}

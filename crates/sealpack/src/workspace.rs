use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pipeline::{REPORT_FILE, SOURCE_HASH_FILE, WORK_DIR_NAME};
use crate::util;

fn default_root_dir() -> String {
    ".".into()
}

fn default_out_dir() -> String {
    "dist".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    /// Drop `<out>/.sealpack` left behind by earlier runs.
    Work,
    /// Also drop earlier outputs: executables that carry a `-hash.txt`
    /// sidecar, the source fingerprint and the report. Anything else in the
    /// output directory (the compiled bundle included) is left alone.
    Out,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    pub out_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            out_dir: default_out_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn work_dir(&self) -> PathBuf {
        self.out_dir.join(WORK_DIR_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir().join("cache")
    }

    /// Absolute paths are used as-is; relative ones are rooted at the
    /// workspace root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }
}

/// `base` anchors a relative `root_dir`; normally the build definition's
/// directory.
pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let root = resolve_user_path(base, &cfg.root_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths { root, out_dir })
}

pub fn init_dirs(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg, base)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Work => safe_remove_dir_all(&paths.root, &paths.work_dir())?,
        CleanMode::Out => {
            safe_remove_dir_all(&paths.root, &paths.work_dir())?;
            remove_previous_outputs(&paths.out_dir)?;
        }
    }

    fs::create_dir_all(&paths.out_dir).map_err(|e| {
        Error::io(format!(
            "failed to create out_dir {}: {e}",
            paths.out_dir.display()
        ))
    })?;
    Ok(paths)
}

fn remove_previous_outputs(out_dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(out_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::io(format!(
                "failed to read out_dir {}: {e}",
                out_dir.display()
            )));
        }
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == SOURCE_HASH_FILE || name == REPORT_FILE {
            util::remove_file_if_exists(&entry.path())?;
            continue;
        }
        if let Some(binary) = name.strip_suffix("-hash.txt").filter(|b| !b.is_empty()) {
            util::remove_file_if_exists(&out_dir.join(binary))?;
            util::remove_file_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::config(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::io(format!("failed to remove dir {}: {e}", dir_can.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_dirs_hang_off_the_root() {
        let cfg = WorkspaceConfig {
            root_dir: "project".into(),
            out_dir: "build/bin".into(),
            clean: CleanMode::None,
        };
        let ws = load_paths(&cfg, Path::new("/repo")).expect("paths");
        assert_eq!(ws.root, PathBuf::from("/repo/project"));
        assert_eq!(ws.out_dir, PathBuf::from("/repo/project/build/bin"));
        assert_eq!(ws.work_dir(), PathBuf::from("/repo/project/build/bin/.sealpack"));
        assert_eq!(
            ws.resolve("dist/app.js").expect("resolve"),
            PathBuf::from("/repo/project/dist/app.js")
        );
        assert_eq!(
            ws.resolve("/abs/app.js").expect("resolve"),
            PathBuf::from("/abs/app.js")
        );
    }

    #[test]
    fn parent_components_are_rejected() {
        let cfg = WorkspaceConfig {
            out_dir: "../elsewhere".into(),
            ..WorkspaceConfig::default()
        };
        assert!(load_paths(&cfg, Path::new("/repo")).is_err());
    }

    #[test]
    fn clean_work_keeps_finished_binaries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            clean: CleanMode::Work,
            ..WorkspaceConfig::default()
        };
        let first = init_dirs(&WorkspaceConfig::default(), tmp.path()).expect("init");
        fs::create_dir_all(first.work_dir().join("linux")).expect("work");
        fs::write(first.out_dir.join("app-linux"), "bin").expect("bin");

        let ws = init_dirs(&cfg, tmp.path()).expect("clean");
        assert!(!ws.work_dir().exists());
        assert!(ws.out_dir.join("app-linux").is_file());
    }

    #[test]
    fn clean_out_keeps_the_compiled_bundle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let first = init_dirs(&WorkspaceConfig::default(), tmp.path()).expect("init");
        let out = &first.out_dir;
        fs::create_dir_all(first.work_dir().join("macos")).expect("work");
        for name in [
            "app.js",
            "notes.txt",
            "hash.txt",
            "sealpack-report.json",
            "app-linux",
            "app-linux-hash.txt",
            "app-win.exe",
            "app-win.exe-hash.txt",
        ] {
            fs::write(out.join(name), name).expect("write");
        }

        let cfg = WorkspaceConfig {
            clean: CleanMode::Out,
            ..WorkspaceConfig::default()
        };
        let ws = init_dirs(&cfg, tmp.path()).expect("clean");
        let mut left: Vec<String> = fs::read_dir(&ws.out_dir)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["app.js".to_string(), "notes.txt".to_string()]);
    }

    #[test]
    fn refuses_to_remove_the_root_itself() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            root_dir: tmp.path().join("project").display().to_string(),
            out_dir: ".".into(),
            clean: CleanMode::Work,
        };
        fs::create_dir_all(tmp.path().join("project")).expect("root");
        // `.sealpack` sits inside the root, so this is allowed.
        init_dirs(&cfg, tmp.path()).expect("work dir is inside root");
        assert!(safe_remove_dir_all(tmp.path(), tmp.path()).is_err());
    }
}

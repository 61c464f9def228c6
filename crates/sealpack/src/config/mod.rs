use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::pipeline::{BuildRequest, ModuleKind, PipelineOptions};
use crate::runner::DEFAULT_TIMEOUT;
use crate::runtime::{ResolvedSource, RuntimeSource, ToolchainProvisioner};
use crate::shim::ShimTemplate;
use crate::targets::Target;
use crate::toolchain::ToolchainConfig;
use crate::workspace::{self, WorkspaceConfig, WorkspacePaths};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::config(format!(
                "invalid config at '{path}' in {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(parsed))
    }

    /// Directory relative workspace paths are anchored to.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.value)
            .map_err(|e| Error::msg(format!("failed to render resolved config: {e}")))
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(arr) = raw else {
        return Err(Error::config(format!(
            "'imports' in {} must be an array of paths",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            merge(&mut acc, load_value(&resolve_ref_path(file, &imp), stack)?);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file, v, stack)?;
    }
    Ok(())
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let parent = match value.as_table_mut().and_then(|t| t.remove("extends")) {
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            return Err(Error::config(format!(
                "'extends' in {} must be a path",
                path.display()
            )));
        }
        None => None,
    };
    if let Some(parent) = parent {
        out = load_value(&resolve_ref_path(path, &parent), stack)?;
    }

    inline_imports(path, &mut value, stack)?;
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Load a build definition, following root `extends` and table-level
/// `imports`. Local values win over merged ones.
pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

fn default_name() -> String {
    "app".into()
}

fn default_targets() -> Vec<Target> {
    Target::ALL.to_vec()
}

fn default_max_parallel() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

/// `[package]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Compiled entry file. Defaults to `<out>/<name>.js`.
    pub entry: Option<String>,
    pub name: String,
    pub module_kind: ModuleKind,
    pub typescript: bool,
    pub targets: Vec<Target>,
    pub max_parallel: usize,
    pub timeout_secs: u64,
    pub shim_template: Option<String>,
    pub disable_experimental_warning: bool,
    pub keep_work: bool,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            entry: None,
            name: default_name(),
            module_kind: ModuleKind::Script,
            typescript: false,
            targets: default_targets(),
            max_parallel: default_max_parallel(),
            timeout_secs: default_timeout_secs(),
            shim_template: None,
            disable_experimental_warning: false,
            keep_work: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildFile {
    pub workspace: WorkspaceConfig,
    pub package: PackageConfig,
    pub toolchain: ToolchainConfig,
    /// `[runtime.<target>]`
    pub runtime: BTreeMap<String, RuntimeSource>,
}

impl BuildFile {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("")?.unwrap_or_default())
    }
}

/// Command-line values that take precedence over the build definition.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub entry: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub targets: Vec<Target>,
    pub max_parallel: Option<usize>,
}

/// Everything a packaging run needs, resolved to absolute paths.
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: WorkspacePaths,
    pub request: BuildRequest,
    pub options: PipelineOptions,
    pub timeout: Duration,
    pub runtime: BTreeMap<Target, ResolvedSource>,
}

impl Settings {
    pub fn provisioner(&self) -> ToolchainProvisioner {
        self.runtime.iter().fold(
            ToolchainProvisioner::new(self.options.toolchain.clone(), self.paths.cache_dir()),
            |p, (target, src)| p.with_source(*target, src.clone()),
        )
    }
}

/// Resolve a loaded definition. With `prepare` set the workspace is cleaned
/// per `[workspace].clean` and the output directory created.
pub fn resolve(doc: &ConfigDoc, overrides: &Overrides, prepare: bool) -> Result<Settings> {
    let build = BuildFile::from_doc(doc)?;
    let base = std::path::absolute(doc.base_dir()).map_err(|e| {
        Error::config(format!("failed to resolve {}: {e}", doc.path.display()))
    })?;

    let mut ws_cfg = build.workspace.clone();
    if let Some(out) = &overrides.out_dir {
        let abs = std::path::absolute(out)
            .map_err(|e| Error::config(format!("invalid --out-dir {}: {e}", out.display())))?;
        ws_cfg.out_dir = abs.display().to_string();
    }
    let paths = if prepare {
        workspace::init_dirs(&ws_cfg, &base)?
    } else {
        workspace::load_paths(&ws_cfg, &base)?
    };

    let pkg = &build.package;
    let base_name = overrides.name.clone().unwrap_or_else(|| pkg.name.clone());
    let entry_file = match (&overrides.entry, &pkg.entry) {
        (Some(cli), _) => std::path::absolute(cli)
            .map_err(|e| Error::config(format!("invalid --entry {}: {e}", cli.display())))?,
        (None, Some(raw)) => paths.resolve(raw)?,
        (None, None) => paths.out_dir.join(format!("{}.js", base_name.trim())),
    };
    let targets = if overrides.targets.is_empty() {
        pkg.targets.clone()
    } else {
        overrides.targets.clone()
    };

    let request = BuildRequest {
        entry_file,
        output_dir: paths.out_dir.clone(),
        base_name,
        module_kind: pkg.module_kind,
        typed: pkg.typescript,
        targets,
    };

    let shim = match &pkg.shim_template {
        Some(raw) => ShimTemplate::File(paths.resolve(raw)?),
        None => ShimTemplate::Builtin,
    };
    let options = PipelineOptions {
        toolchain: build.toolchain.clone(),
        disable_experimental_warning: pkg.disable_experimental_warning,
        max_parallel: overrides.max_parallel.unwrap_or(pkg.max_parallel),
        keep_work: pkg.keep_work,
        shim,
    };
    if pkg.timeout_secs == 0 {
        return Err(Error::config("package.timeout_secs must be at least 1"));
    }

    let mut runtime = BTreeMap::new();
    for (key, src) in &build.runtime {
        let target: Target = key.parse()?;
        if runtime.contains_key(&target) {
            return Err(Error::config(format!(
                "runtime.{key} names target '{target}' a second time"
            )));
        }
        runtime.insert(target, resolve_runtime(&paths, key, src)?);
    }

    Ok(Settings {
        paths,
        request,
        options,
        timeout: Duration::from_secs(pkg.timeout_secs),
        runtime,
    })
}

fn resolve_runtime(
    paths: &WorkspacePaths,
    key: &str,
    src: &RuntimeSource,
) -> Result<ResolvedSource> {
    let sha256 = src
        .sha256
        .as_ref()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());
    if let Some(sum) = &sha256 {
        if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::config(format!(
                "runtime.{key}.sha256 is not a SHA-256 hex digest"
            )));
        }
    }
    match (&src.path, &src.url) {
        (Some(_), Some(_)) => Err(Error::config(format!(
            "runtime.{key} sets both 'path' and 'url'"
        ))),
        (Some(p), None) => Ok(ResolvedSource::File {
            path: paths.resolve(p)?,
            sha256,
        }),
        (None, Some(u)) => {
            let u = u.trim();
            if !(u.starts_with("https://") || u.starts_with("http://")) {
                return Err(Error::config(format!(
                    "runtime.{key}.url must be an http(s) URL"
                )));
            }
            Ok(ResolvedSource::Url {
                url: u.to_string(),
                sha256,
            })
        }
        (None, None) => Ok(ResolvedSource::Host),
    }
}

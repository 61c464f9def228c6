use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::pipeline::{BuildRequest, ModuleKind};
use crate::util;

pub mod assets;
pub mod verify;

pub use assets::{AssetSource, DescriptorAssets, MemoryAssets, NoAssets};
pub use verify::{AssetNames, FallbackFiles, INTEGRITY_FAILED, Verdict};

const SCRIPT_TEMPLATE: &str = include_str!("../../shim/integrity-shim.cjs");
const MODULE_TEMPLATE: &str = include_str!("../../shim/integrity-shim.mjs");
const TYPED_TEMPLATE: &str = include_str!("../../shim/integrity-shim.ts");

const SOURCE_PLACEHOLDER: &str = "{{SOURCE_ASSET}}";
const HASH_PLACEHOLDER: &str = "{{HASH_ASSET}}";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShimTemplate {
    /// Pick the built-in template matching the request's module flavor.
    #[default]
    Builtin,
    File(PathBuf),
}

impl ShimTemplate {
    pub fn load(&self, request: &BuildRequest) -> Result<String> {
        match self {
            ShimTemplate::Builtin => Ok(builtin(request.module_kind, request.typed).to_string()),
            ShimTemplate::File(p) => fs::read_to_string(p).map_err(|e| {
                Error::config(format!("failed to read shim template {}: {e}", p.display()))
            }),
        }
    }
}

pub fn builtin(kind: ModuleKind, typed: bool) -> &'static str {
    match (typed, kind) {
        (true, _) => TYPED_TEMPLATE,
        (false, ModuleKind::Script) => SCRIPT_TEMPLATE,
        (false, ModuleKind::Module) => MODULE_TEMPLATE,
    }
}

pub fn file_name(kind: ModuleKind, typed: bool) -> &'static str {
    match (typed, kind) {
        (true, _) => "sealpack-shim.ts",
        (false, ModuleKind::Script) => "sealpack-shim.cjs",
        (false, ModuleKind::Module) => "sealpack-shim.mjs",
    }
}

const ASSET_LOOKUP: &str = r#"getAsset\(\s*(['"])app\.js(['"])\s*\)"#;

fn asset_lookup_re() -> Result<&'static Regex> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = RE.get() {
        return Ok(re);
    }
    let re = Regex::new(ASSET_LOOKUP)
        .map_err(|e| Error::msg(format!("invalid asset lookup pattern: {e}")))?;
    Ok(RE.get_or_init(|| re))
}

/// Fill in the asset names. Hand-written templates that hard-code the
/// default `getAsset('app.js')` lookup are pointed at the real entry name.
pub fn render(template: &str, names: &AssetNames) -> Result<String> {
    let filled = template
        .replace(SOURCE_PLACEHOLDER, &names.source)
        .replace(HASH_PLACEHOLDER, &names.hash);
    Ok(asset_lookup_re()?
        .replace_all(&filled, |caps: &regex::Captures<'_>| {
            format!("getAsset({}{}{})", &caps[1], names.source, &caps[2])
        })
        .into_owned())
}

/// Render the shim for `request` into its output directory.
pub fn write_shim(request: &BuildRequest, template: &ShimTemplate) -> Result<PathBuf> {
    let names = AssetNames::new(request.entry_asset_name()?);
    let body = render(&template.load(request)?, &names)?;
    let dest = request
        .output_dir
        .join(file_name(request.module_kind, request.typed));
    util::atomic_write(&dest, body.as_bytes())?;
    tracing::info!(shim = %dest.display(), asset = %names.source, "integrity shim written");
    Ok(dest)
}

/// Fallback files of a shim that is running unpackaged from `script`.
pub fn fallback_for(script: &Path) -> FallbackFiles {
    let dir = script.parent().unwrap_or_else(|| Path::new("."));
    FallbackFiles {
        source: script.to_path_buf(),
        hash: dir.join(crate::pipeline::SOURCE_HASH_FILE),
    }
}

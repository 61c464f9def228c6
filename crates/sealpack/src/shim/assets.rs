use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::pipeline::descriptor::SeaConfig;

/// Named, read-only assets carried by a packaged executable.
///
/// `Ok(None)` means the asset is not there. Any other problem is an `Err` and
/// must not be mistaken for absence.
pub trait AssetSource {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Nothing embedded: running outside a packaged binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAssets;

impl AssetSource for NoAssets {
    fn get(&self, _name: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryAssets {
    assets: BTreeMap<String, Vec<u8>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(name.into(), body.into());
        self
    }
}

impl AssetSource for MemoryAssets {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.assets.get(name).cloned())
    }
}

/// The asset map of a SEA config, read from disk exactly as the blob
/// generator would embed it.
#[derive(Debug, Clone)]
pub struct DescriptorAssets {
    assets: BTreeMap<String, PathBuf>,
}

impl DescriptorAssets {
    pub fn load(descriptor: &Path) -> Result<Self> {
        let cfg = SeaConfig::read(descriptor)?;
        let base = descriptor.parent().unwrap_or_else(|| Path::new("."));
        let assets = cfg
            .assets
            .into_iter()
            .map(|(name, p)| {
                let p = if p.is_absolute() { p } else { base.join(p) };
                (name, p)
            })
            .collect();
        Ok(Self { assets })
    }
}

impl AssetSource for DescriptorAssets {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.assets.get(name) else {
            return Ok(None);
        };
        match fs::read(path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!(
                "failed to read asset '{name}' from {}: {e}",
                path.display()
            ))),
        }
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util;

/// The JSON document handed to `node --experimental-sea-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeaConfig {
    pub main: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub assets: BTreeMap<String, PathBuf>,
    #[serde(
        rename = "disableExperimentalSEAWarning",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub disable_experimental_warning: bool,
}

impl SeaConfig {
    pub fn write(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string(self)?;
        util::atomic_write(path, body.as_bytes())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::io(format!("failed to read SEA config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("invalid SEA config {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_main_output_and_assets() {
        let mut assets = BTreeMap::new();
        assets.insert("app.js".to_string(), PathBuf::from("/out/app.js"));
        assets.insert("hash.txt".to_string(), PathBuf::from("/out/hash.txt"));
        let cfg = SeaConfig {
            main: "/out/app.js".into(),
            output: "/out/.sealpack/linux/sea-prep.blob".into(),
            assets,
            disable_experimental_warning: false,
        };

        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&cfg).expect("encode")).expect("decode");
        assert_eq!(v["main"], "/out/app.js");
        assert_eq!(v["output"], "/out/.sealpack/linux/sea-prep.blob");
        assert_eq!(v["assets"]["hash.txt"], "/out/hash.txt");
        assert!(v.get("disableExperimentalSEAWarning").is_none());
    }

    #[test]
    fn warning_flag_uses_node_key() {
        let cfg = SeaConfig {
            main: "a.js".into(),
            output: "b.blob".into(),
            assets: BTreeMap::new(),
            disable_experimental_warning: true,
        };
        let s = serde_json::to_string(&cfg).expect("encode");
        assert!(s.contains("\"disableExperimentalSEAWarning\":true"), "{s}");
    }
}

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::hasher::{self, Digester};
use crate::shim::assets::AssetSource;

pub const INTEGRITY_FAILED: &str = "Source integrity check failed!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetNames {
    pub source: String,
    pub hash: String,
}

impl AssetNames {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            hash: crate::pipeline::SOURCE_HASH_FILE.into(),
        }
    }
}

/// On-disk stand-ins for the embedded assets: the running script itself and
/// the `hash.txt` next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFiles {
    pub source: PathBuf,
    pub hash: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Tampered { expected: String, actual: String },
    /// Nothing to compare against; not a packaged context.
    Unpackaged,
}

pub fn verify(
    digester: &dyn Digester,
    assets: &dyn AssetSource,
    names: &AssetNames,
    fallback: Option<&FallbackFiles>,
) -> Result<Verdict> {
    let source = assets.get(&names.source)?;
    let stored = assets.get(&names.hash)?;
    if let (Some(source), Some(stored)) = (source, stored) {
        let stored = String::from_utf8(stored)
            .map_err(|_| Error::integrity(format!("asset '{}' is not UTF-8", names.hash)))?;
        return Ok(compare(digester, &source, &stored));
    }

    tracing::debug!(
        source = %names.source,
        hash = %names.hash,
        "embedded assets not found, trying files on disk"
    );
    match fallback {
        Some(files) => verify_files(digester, files),
        None => Ok(Verdict::Unpackaged),
    }
}

pub fn verify_files(digester: &dyn Digester, files: &FallbackFiles) -> Result<Verdict> {
    let Some(stored) = hasher::read_record(&files.hash)? else {
        return Ok(Verdict::Unpackaged);
    };
    let source = match fs::read(&files.source) {
        Ok(b) => b,
        Err(e) => {
            return Err(Error::integrity(format!(
                "fingerprint {} exists but {} cannot be read: {e}",
                files.hash.display(),
                files.source.display()
            )));
        }
    };
    Ok(compare(digester, &source, &stored))
}

fn compare(digester: &dyn Digester, source: &[u8], stored: &str) -> Verdict {
    let expected = stored.trim().to_ascii_lowercase();
    let actual = digester.digest(source);
    if actual == expected {
        Verdict::Verified
    } else {
        Verdict::Tampered { expected, actual }
    }
}

/// Log the outcome and map it to a process exit status: 0 lets startup
/// continue, 1 means the process must stop before application code runs.
pub fn exit_status(result: &Result<Verdict>) -> i32 {
    match result {
        Ok(Verdict::Verified) => {
            tracing::info!("source integrity check passed");
            0
        }
        Ok(Verdict::Unpackaged) => {
            tracing::debug!("no fingerprint found; skipping integrity check");
            0
        }
        Ok(Verdict::Tampered { expected, actual }) => {
            eprintln!("{INTEGRITY_FAILED}");
            tracing::error!(%expected, %actual, "fingerprint mismatch");
            1
        }
        Err(e) => {
            eprintln!("{INTEGRITY_FAILED} {e}");
            tracing::error!("integrity check error: {e}");
            1
        }
    }
}

/// Halt the process on a failed check.
pub fn guard(result: Result<Verdict>) {
    let code = exit_status(&result);
    if code != 0 {
        std::process::exit(code);
    }
}

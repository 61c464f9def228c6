use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::util;

pub trait Digester: Send + Sync {
    fn digest(&self, payload: &[u8]) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digester;

impl Digester for Sha256Digester {
    fn digest(&self, payload: &[u8]) -> String {
        sha256_hex(payload)
    }
}

pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subject {
    Source,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintRecord {
    pub subject: Subject,
    /// The artifact the digest describes.
    pub artifact: PathBuf,
    /// Where the digest was persisted.
    pub record: PathBuf,
    pub digest: String,
}

pub fn fingerprint_file(digester: &dyn Digester, path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
    Ok(digester.digest(&bytes))
}

/// Digest `artifact` and persist the digest at `record` before returning.
pub fn stamp(
    digester: &dyn Digester,
    subject: Subject,
    artifact: &Path,
    record: &Path,
) -> Result<FingerprintRecord> {
    let digest = fingerprint_file(digester, artifact)?;
    util::atomic_write(record, digest.as_bytes())?;
    tracing::debug!(
        artifact = %artifact.display(),
        record = %record.display(),
        %digest,
        "fingerprint written"
    );
    Ok(FingerprintRecord {
        subject,
        artifact: artifact.to_path_buf(),
        record: record.to_path_buf(),
        digest,
    })
}

/// `Ok(None)` only when the record file does not exist.
pub fn read_record(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(format!(
            "failed to read fingerprint {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn deterministic_and_sensitive_to_single_byte() {
        let d = Sha256Digester;
        let a = d.digest(b"console.log('hi')");
        assert_eq!(a, d.digest(b"console.log('hi')"));
        assert_ne!(a, d.digest(b"console.log('hI')"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn stamp_writes_bare_hex() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let artifact = tmp.path().join("app.js");
        fs::write(&artifact, "hello").expect("write");
        let record = tmp.path().join("hash.txt");

        let rec = stamp(&Sha256Digester, Subject::Source, &artifact, &record).expect("stamp");
        let raw = fs::read_to_string(&record).expect("read record");
        assert_eq!(raw, rec.digest);
        assert_eq!(raw, sha256_hex(b"hello"));
        assert_eq!(read_record(&record).expect("read"), Some(raw));
    }

    #[test]
    fn missing_record_is_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_record(&tmp.path().join("hash.txt")).expect("read"), None);
    }
}

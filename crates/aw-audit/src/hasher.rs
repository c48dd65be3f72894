// hasher.rs — SHA-256 hashing utilities.
//
// All hashes in AppWall are SHA-256, lowercase hex: executable content
// hashes, search-candidate digests and the audit hash chain.

use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::AuditError;

fn hex(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

pub fn hash_bytes(data: &[u8]) -> String {
    hex(Sha256::new_with_prefix(data))
}

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Digest of the canonical JSON encoding of `value`. Field order follows
/// the struct definition, so equal values always give equal digests.
pub fn hash_json<T: Serialize>(value: &T) -> Result<String, AuditError> {
    Ok(hash_bytes(&serde_json::to_vec(value)?))
}

/// Content hash of an executable, streamed rather than read whole.
pub fn hash_file(path: &Path) -> Result<String, AuditError> {
    let failed = |source| AuditError::HashFileFailed {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(failed)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(failed)?;
    Ok(hex(hasher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_input_digest() {
        assert_eq!(
            hash_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn json_digest_tracks_content() {
        let a = hash_json(&vec!["Firefox", "FireFTP"]).unwrap();
        let b = hash_json(&vec!["Firefox", "FireFTP"]).unwrap();
        let c = hash_json(&vec!["FireFTP", "Firefox"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![7u8; 200_000];
        file.write_all(&data).unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = hash_file(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, AuditError::HashFileFailed { .. }));
    }
}

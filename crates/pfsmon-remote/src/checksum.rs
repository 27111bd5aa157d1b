//! SHA-256 helpers for verifying pushed files

use pfsmon_core::{PfsError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex SHA-256 digest of a local file
pub async fn sha256_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Extract the digest from `sha256sum` output (`<digest>  <path>`)
pub fn parse_sha256sum(output: &str) -> Result<String> {
    let digest = output
        .split_whitespace()
        .next()
        .ok_or_else(|| PfsError::Other("empty sha256sum output".to_string()))?;

    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PfsError::Other(format!(
            "unexpected sha256sum output: {}",
            output.trim()
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_sha256_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let digest = sha256_file(file.path()).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_parse_sha256sum() {
        let out = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD  /etc/lustre/ost.conf\n";
        assert_eq!(
            parse_sha256sum(out).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(parse_sha256sum("").is_err());
        assert!(parse_sha256sum("sha256sum: no such file").is_err());
    }
}

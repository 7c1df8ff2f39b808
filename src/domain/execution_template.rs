//! Execution Template entity (§3): content-addressed, deduplicated by the
//! SHA-256 of its normalized code (§4.4/§9).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTemplate {
    pub id: Uuid,
    pub code_hash: String,
    pub template_name: String,
    pub code: String,
}

/// Normalizes code before hashing: trims trailing whitespace per line and
/// collapses CRLF to LF, so cosmetic differences (line endings, trailing
/// spaces) don't fragment the dedup table.
pub fn normalize_code(code: &str) -> String {
    code.replace("\r\n", "\n")
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn hash_code(code: &str) -> String {
    let normalized = normalize_code(code);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

impl ExecutionTemplate {
    pub fn new(template_name: String, code: String) -> Self {
        let code_hash = hash_code(&code);
        Self {
            id: Uuid::new_v4(),
            code_hash,
            template_name,
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_code_hashes_identically() {
        let a = hash_code("stop_loss=0.01\ntake_profit=0.02\n");
        let b = hash_code("stop_loss=0.01\ntake_profit=0.02\n");
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_whitespace_does_not_change_hash() {
        let a = hash_code("stop_loss=0.01\ntake_profit=0.02\n");
        let b = hash_code("stop_loss=0.01   \ntake_profit=0.02\r\n");
        assert_eq!(a, b);
    }

    #[test]
    fn different_code_hashes_differently() {
        let a = hash_code("stop_loss=0.01\n");
        let b = hash_code("stop_loss=0.02\n");
        assert_ne!(a, b);
    }
}

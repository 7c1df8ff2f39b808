//! Scanner Version entity (§3) and name derivation (§4.6 step 3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerVersion {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Monotone, unique per agent; starts at 1 (§8.4).
    pub version_number: u32,
    pub name: String,
    pub code: String,
    pub model_tag: String,
    pub generation_prompt: String,
    pub created_at: DateTime<Utc>,
}

/// Derives a human-readable scanner name from the generation prompt: the
/// first clause (up to the first `.`, `,`, or newline), title-cased, with
/// " Scanner" appended. Falls back to `"Scanner v{N}"` for an empty or
/// punctuation-only prompt (§4.6 step 3).
pub fn derive_name(prompt: &str, version_number: u32) -> String {
    let first_clause = prompt
        .split(|c| c == '.' || c == ',' || c == '\n')
        .next()
        .unwrap_or("")
        .trim();

    if first_clause.is_empty() {
        return format!("Scanner v{version_number}");
    }

    let title_cased = first_clause
        .split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ");

    format!("{title_cased} Scanner")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_name_from_first_clause() {
        let name = derive_name("buy breakouts above the opening range, then trail stops", 1);
        assert_eq!(name, "Buy Breakouts Above The Opening Range Scanner");
    }

    #[test]
    fn falls_back_on_empty_prompt() {
        assert_eq!(derive_name("   ", 3), "Scanner v3");
        assert_eq!(derive_name("", 7), "Scanner v7");
    }

    #[test]
    fn stops_at_first_period() {
        let name = derive_name("fade gap ups. avoid low float names.", 2);
        assert_eq!(name, "Fade Gap Ups Scanner");
    }
}

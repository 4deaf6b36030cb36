#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ITERATIONS: usize = 50;
pub const DEFAULT_TARGET_LANGUAGE: &str = "Simplified Chinese";

/// Knobs for one translation run. `from_env` reads `SCRIV_*` overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model round-trips before the run ends as exhausted.
    pub max_iterations: usize,
    pub target_language: String,
    /// Max chars of a queued text shown in previews and error echoes.
    pub preview_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            target_language: DEFAULT_TARGET_LANGUAGE.to_string(),
            preview_chars: 80,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_iterations: std::env::var("SCRIV_MAX_ITERATIONS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(d.max_iterations),
            target_language: std::env::var("SCRIV_TARGET_LANG")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(d.target_language),
            preview_chars: std::env::var("SCRIV_PREVIEW_CHARS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&n| n >= 8)
                .unwrap_or(d.preview_chars),
        }
    }
}

/// Cut `s` to at most `max` chars, marking the cut with an ellipsis.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_counts_chars_not_bytes() {
        assert_eq!(preview("铁剑铁剑", 4), "铁剑铁剑");
        assert_eq!(preview("铁剑铁剑铁", 4), "铁剑铁…");
    }
}

use aho_corasick::AhoCorasick;

use crate::config::StatusSettings;

/// Compiled match sets for scrollback classification. The pattern lists are
/// configuration data; precedence between the sets is fixed by the detector.
pub struct PatternSet {
    waiting: AhoCorasick,
    error: AhoCorasick,
    thinking: AhoCorasick,
}

fn build(patterns: &[String]) -> AhoCorasick {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(patterns)
        .expect("Failed to build Aho-Corasick automaton")
}

impl PatternSet {
    pub fn from_settings(settings: &StatusSettings) -> Self {
        Self {
            waiting: build(&settings.waiting_patterns),
            error: build(&settings.error_patterns),
            thinking: build(&settings.thinking_patterns),
        }
    }

    pub fn is_waiting(&self, text: &str) -> bool {
        self.waiting.is_match(text)
    }

    pub fn has_error(&self, text: &str) -> bool {
        self.error.is_match(text)
    }

    pub fn is_thinking(&self, text: &str) -> bool {
        self.thinking.is_match(text)
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::from_settings(&StatusSettings::default())
    }
}

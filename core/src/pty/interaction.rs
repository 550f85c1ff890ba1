//! Interaction-prompt detection: one combined case-insensitive regex over each
//! raw output chunk (never the cumulative buffer). Covers the confirmation
//! prompts the common agent CLIs print when they need a human decision.

use std::sync::OnceLock;

use regex::bytes::Regex;

static PROMPT_RE: OnceLock<Regex> = OnceLock::new();

/// The combined prompt regex. Matching is per-chunk; a prompt split across two
/// chunks is caught by the idle fallback instead.
pub fn prompt_regex() -> &'static Regex {
    PROMPT_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\[y/n\]|\(y/n\)|\[yes/no\]|press enter to continue|press any key|enter your choice|do you want to proceed\?|type 'yes' to confirm|permission required:|approve\?|allow this action\?|continue\?|confirm\?",
        )
        .expect("prompt regex")
    })
}

/// True when this chunk looks like the CLI is asking for input.
pub fn chunk_requests_interaction(chunk: &[u8]) -> bool {
    prompt_regex().is_match(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_canonical_prompts() {
        let samples: &[&str] = &[
            "Proceed? [y/n] ",
            "Overwrite file (y/N)?",
            "Keep going (Y/n)",
            "Delete branch [Yes/no]",
            "Press Enter to continue",
            "press any key when ready",
            "Enter your choice: ",
            "Do you want to proceed?",
            "Type 'yes' to confirm",
            "Permission required: write to src/main.rs",
            "Approve?",
            "Allow this action?",
            "Continue?",
            "Confirm?",
        ];
        for s in samples {
            assert!(
                chunk_requests_interaction(s.as_bytes()),
                "should match: {s:?}"
            );
        }
    }

    #[test]
    fn case_insensitive() {
        assert!(chunk_requests_interaction(b"PROCEED? [Y/N]"));
        assert!(chunk_requests_interaction(b"PRESS ENTER TO CONTINUE"));
    }

    #[test]
    fn ignores_ordinary_output() {
        let samples: &[&str] = &[
            "compiling common v0.1.0",
            "done in 3.2s",
            "diff --git a/x b/x",
            "$ ls -la",
            "y/n appears mid-word without brackets",
        ];
        for s in samples {
            assert!(
                !chunk_requests_interaction(s.as_bytes()),
                "should not match: {s:?}"
            );
        }
    }

    #[test]
    fn matches_inside_ansi_colored_output() {
        let colored = b"\x1b[33mDo you want to proceed?\x1b[0m";
        assert!(chunk_requests_interaction(colored));
    }
}

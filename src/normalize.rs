//! Text normalization.
//!
//! Pure and deterministic: the same input and replacement table always
//! produce the same output, and normalizing already-normalized text is a
//! no-op. The synthesis variant rewrites constructs a speech engine would
//! mis-read; the display variant only collapses whitespace so emphasis
//! delimiters stay visible.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Synthesis,
    Display,
}

static NEWLINE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n+").unwrap());
static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
// "Room-12" reads as subtraction to some engines; speak it as "Room 12".
static WORD_NUMBER_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z]+)-(\d+)\b").unwrap());
// Any run of periods separated by optional whitespace: "...", ". . .", ". .".
static PERIOD_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.(?:\s*\.)+").unwrap());
static SPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

pub fn normalize(text: &str, mode: Mode, replacements: &[(String, String)]) -> String {
    let mut text = text.trim().to_string();
    text = NEWLINE_RUNS.replace_all(&text, "\n").to_string();
    text = WHITESPACE_RUNS.replace_all(&text, " ").to_string();

    if mode == Mode::Display {
        return text;
    }

    text = WORD_NUMBER_DASH.replace_all(&text, "$1 $2").to_string();
    for (from, to) in replacements {
        text = text.replace(from.as_str(), to.as_str());
    }
    text = PERIOD_RUNS.replace_all(&text, "... ").to_string();
    text = SPACE_RUNS.replace_all(&text, " ").to_string();
    // A unit should not open with a spoken ellipsis.
    if let Some(rest) = text.strip_prefix("... ") {
        text = rest.to_string();
    }
    // The ellipsis rewrite appends a space; a trailing run would leave it
    // dangling at the end of the unit.
    text.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth(text: &str) -> String {
        normalize(text, Mode::Synthesis, &[])
    }

    #[test]
    fn collapses_whitespace_and_newlines() {
        assert_eq!(synth("  a\n\n\nb\t\tc  "), "a b c");
        assert_eq!(normalize(" a \n b ", Mode::Display, &[]), "a b");
    }

    #[test]
    fn rewrites_word_number_dashes() {
        assert_eq!(synth("Meet me in Room-12 tomorrow"), "Meet me in Room 12 tomorrow");
        // Number-number ranges are left alone.
        assert_eq!(synth("pages 3-12"), "pages 3-12");
    }

    #[test]
    fn display_mode_skips_dash_fix_and_replacements() {
        let replacements = vec![("Mr.".to_string(), "Mister".to_string())];
        assert_eq!(
            normalize("Mr. Smith, Room-12", Mode::Display, &replacements),
            "Mr. Smith, Room-12"
        );
        assert_eq!(
            normalize("Mr. Smith, Room-12", Mode::Synthesis, &replacements),
            "Mister Smith, Room 12"
        );
    }

    #[test]
    fn replacements_apply_in_order() {
        let replacements = vec![
            ("&".to_string(), " and ".to_string()),
            ("and and".to_string(), "and".to_string()),
        ];
        assert_eq!(normalize("salt & pepper", Mode::Synthesis, &replacements), "salt and pepper");
    }

    #[test]
    fn collapses_spaced_period_runs() {
        assert_eq!(synth("Wait. . . what"), "Wait... what");
        assert_eq!(synth("Wait.  . .what"), "Wait... what");
        assert_eq!(synth("Wait.... what"), "Wait... what");
    }

    #[test]
    fn strips_a_leading_ellipsis() {
        assert_eq!(synth(".  . ."), "");
        assert_eq!(synth("... and so it began"), "and so it began");
        // Mid-text ellipses survive.
        assert_eq!(synth("so it... began"), "so it... began");
    }

    #[test]
    fn trailing_period_runs_leave_no_trailing_whitespace() {
        assert_eq!(synth("And then. . ."), "And then...");
        assert_eq!(synth("He paused...."), "He paused...");
    }

    #[test]
    fn synthesis_normalization_is_idempotent() {
        let replacements = vec![("Dr.".to_string(), "Doctor".to_string())];
        let samples = [
            "Dr. Who... and Room-12.  . . done",
            "  plain   text ",
            "... leading",
            "trailing run. . .",
        ];
        for sample in samples {
            let once = normalize(sample, Mode::Synthesis, &replacements);
            let twice = normalize(&once, Mode::Synthesis, &replacements);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }
}

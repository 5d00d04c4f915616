use std::{borrow::Cow, sync::OnceLock};

use regex::Regex;

#[expect(clippy::unwrap_used)]
fn symbol_regex() -> &'static Regex {
    static SYMBOL_REGEX: OnceLock<Regex> = OnceLock::new();
    SYMBOL_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z_.$][A-Za-z0-9_.$]*$").unwrap())
}

#[expect(clippy::unwrap_used)]
fn invalid_symbol_char_regex() -> &'static Regex {
    static INVALID_SYMBOL_CHAR_REGEX: OnceLock<Regex> = OnceLock::new();
    INVALID_SYMBOL_CHAR_REGEX.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.$]+").unwrap())
}

/// Whether `name` can be used as a function or global symbol in PTX.
#[must_use]
pub fn is_valid_symbol(name: &str) -> bool {
    symbol_regex().is_match(name)
}

/// Replaces every run of characters that PTX rejects in symbols by a single
/// `_`, e.g. `tmain<int, 5>` becomes `tmain_int_5_`.
#[must_use]
pub fn sanitize_symbol(name: &str) -> Cow<'_, str> {
    invalid_symbol_char_regex().replace_all(name, "_")
}

#[cfg(test)]
mod tests {
    use super::{is_valid_symbol, sanitize_symbol};

    #[test]
    fn validates_symbols() {
        assert!(is_valid_symbol("__omp_offloading_10_2a_main_l27"));
        assert!(is_valid_symbol(".omp_offloading.entry.k"));
        assert!(!is_valid_symbol("1abc"));
        assert!(!is_valid_symbol("tmain<int, 5>"));
        assert!(!is_valid_symbol(""));
    }

    #[test]
    fn sanitizes_template_names() {
        assert_eq!(sanitize_symbol("tmain<int, 5>"), "tmain_int_5_");
        assert_eq!(sanitize_symbol("main"), "main");
    }
}

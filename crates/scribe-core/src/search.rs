//! Case- and diacritic-insensitive text folding
//!
//! Both the SQL query path and in-memory observation matching compare folded
//! text, so a record matches a search term the same way on either path.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Fold text for comparison: canonical decomposition, combining marks
/// removed, lower-cased.
pub fn fold(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// True if `folded_term` occurs in `haystack` after folding
pub fn contains_folded(haystack: &str, folded_term: &str) -> bool {
    fold(haystack).contains(folded_term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_case() {
        assert_eq!(fold("LaBeL"), "label");
    }

    #[test]
    fn test_fold_diacritics() {
        assert_eq!(fold("Crème Brûlée"), "creme brulee");
        assert_eq!(fold("Ärger"), "arger");
    }

    #[test]
    fn test_contains_folded() {
        assert!(contains_folded("Résumé uploaded", "resume"));
        assert!(!contains_folded("upload", "resume"));
    }
}

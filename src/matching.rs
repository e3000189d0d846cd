//! Fuzzy matching for candidate scoring.
//!
//! Provides text normalization and similarity scoring used to compare a
//! query title/creator against provider search results. Scores are in the
//! 0..100 range so thresholds in configuration read naturally.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Folds diacritics by decomposing and dropping combining marks.
///
/// `"café"` becomes `"cafe"`, `"Müller"` becomes `"Muller"`.
pub fn fold_diacritics(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Normalizes text for robust fuzzy matching.
///
/// Applies NFKC compatibility folding, strips diacritics, lowercases,
/// replaces punctuation and separators with spaces, and collapses
/// whitespace runs.
pub fn normalize_text(text: &str) -> String {
    let compat: String = text.nfkc().collect();
    let folded = fold_diacritics(&compat).to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for ch in folded.chars() {
        if ch.is_ascii_alphanumeric() || (!ch.is_ascii() && ch.is_alphanumeric()) {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Similarity of two already-normalized strings as 0..100.
fn ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let sim = strsim::normalized_levenshtein(a, b);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        (sim * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// Token-set similarity ratio between two strings, 0..100.
///
/// Both inputs are normalized, split into unique tokens, and the sorted
/// token strings are compared. Word order and repetition therefore do not
/// affect the score: `"raven the"` matches `"The Raven"` at 100.
pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    ratio(&sorted_tokens(a), &sorted_tokens(b))
}

fn sorted_tokens(s: &str) -> String {
    let normalized = normalize_text(s);
    let mut tokens: Vec<&str> = normalized.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

/// Scores a candidate title against the query title, 0..100.
pub fn title_score(query_title: &str, item_title: &str) -> u8 {
    token_set_ratio(query_title, item_title)
}

/// Best similarity between the query creator and any of the item creators.
///
/// Returns 100 when the query has no creator: absence of a constraint is
/// not a mismatch.
pub fn creator_score(query_creator: Option<&str>, creators: &[String]) -> u8 {
    let Some(query) = query_creator.filter(|q| !q.trim().is_empty()) else {
        return 100;
    };
    creators
        .iter()
        .map(|c| token_set_ratio(query, c))
        .max()
        .unwrap_or(0)
}

/// Extracts a four-digit year from free-form date text.
pub fn parse_year(text: &str) -> Option<i32> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 4 <= bytes.len() {
        let window = &bytes[i..i + 4];
        if window.iter().all(u8::is_ascii_digit) {
            let before_ok = i == 0 || !bytes[i - 1].is_ascii_digit();
            let after_ok = i + 4 == bytes.len() || !bytes[i + 4].is_ascii_digit();
            if before_ok && after_ok {
                return std::str::from_utf8(window).ok()?.parse().ok();
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_strips_punctuation() {
        assert_eq!(normalize_text("The Raven; a Poem!"), "the raven a poem");
    }

    #[test]
    fn test_normalize_folds_diacritics() {
        assert_eq!(normalize_text("Crónica de España"), "cronica de espana");
        assert_eq!(normalize_text("Müller"), "muller");
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  a\t\tb \n c  "), "a b c");
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("!!!"), "");
    }

    #[test]
    fn test_token_set_ratio_identical() {
        assert_eq!(token_set_ratio("The Raven", "The Raven"), 100);
    }

    #[test]
    fn test_token_set_ratio_ignores_word_order() {
        assert_eq!(token_set_ratio("Raven The", "The Raven"), 100);
    }

    #[test]
    fn test_token_set_ratio_ignores_repetition() {
        assert_eq!(token_set_ratio("the the raven", "the raven"), 100);
    }

    #[test]
    fn test_token_set_ratio_disjoint_is_low() {
        assert!(token_set_ratio("The Raven", "Moby Dick") < 50);
    }

    #[test]
    fn test_token_set_ratio_empty_is_zero() {
        assert_eq!(token_set_ratio("", "The Raven"), 0);
        assert_eq!(token_set_ratio("The Raven", ""), 0);
    }

    #[test]
    fn test_creator_score_absent_query_is_full() {
        assert_eq!(creator_score(None, &["Poe, Edgar Allan".to_string()]), 100);
        assert_eq!(creator_score(Some("  "), &[]), 100);
    }

    #[test]
    fn test_creator_score_no_candidates_is_zero() {
        assert_eq!(creator_score(Some("Poe"), &[]), 0);
    }

    #[test]
    fn test_creator_score_takes_best_of_many() {
        let creators = vec!["Someone Else".to_string(), "Edgar Allan Poe".to_string()];
        let best = creator_score(Some("Poe, Edgar Allan"), &creators);
        assert_eq!(best, 100);
    }

    #[test]
    fn test_parse_year_extracts_from_text() {
        assert_eq!(parse_year("Paris, 1845"), Some(1845));
        assert_eq!(parse_year("1845"), Some(1845));
        assert_eq!(parse_year("ca. 1845-1850"), Some(1845));
    }

    #[test]
    fn test_parse_year_rejects_longer_digit_runs() {
        assert_eq!(parse_year("12345"), None);
        assert_eq!(parse_year("no year here"), None);
    }
}

//! Text normalization and similarity scoring for dedup and label reuse.
//!
//! Two question records merge when their normalized forms match exactly or
//! their trigram Jaccard similarity clears the configured threshold. The
//! same measure scores candidate category labels against existing ones.
//! Everything here is pure and deterministic; thresholds live in config.

/// Case-fold, strip punctuation, and collapse whitespace.
///
/// The result is the identity of a question within the aggregated set:
/// "How to renew?" and "how to renew" normalize to the same string.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            // Punctuation and whitespace both act as soft separators.
            pending_space = true;
        }
    }
    out
}

/// Jaccard similarity over character trigrams of the normalized forms.
///
/// Returns a score in `[0.0, 1.0]`. Strings shorter than a trigram compare
/// by exact equality. Trigrams keep the measure usable across languages
/// without tokenizer assumptions.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a == b {
        return 1.0;
    }
    let ta = trigrams(&a);
    let tb = trigrams(&b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.iter().filter(|t| tb.contains(*t)).count();
    let union = ta.len() + tb.len() - intersection;
    intersection as f64 / union as f64
}

fn trigrams(s: &str) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < 3 {
        return Vec::new();
    }
    let mut grams: Vec<String> = chars.windows(3).map(|w| w.iter().collect()).collect();
    grams.sort();
    grams.dedup();
    grams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_and_punctuation() {
        assert_eq!(normalize_text("How to  RENEW?!"), "how to renew");
        assert_eq!(normalize_text("how to renew"), "how to renew");
    }

    #[test]
    fn normalize_handles_unicode() {
        assert_eq!(normalize_text("Как продлить визу?"), "как продлить визу");
    }

    #[test]
    fn identical_after_normalization_scores_one() {
        assert_eq!(similarity("How to renew?", "how to renew."), 1.0);
    }

    #[test]
    fn unrelated_texts_score_low() {
        assert!(similarity("visa appointment booking", "apartment rental prices") < 0.2);
    }

    #[test]
    fn close_phrasings_score_high() {
        let s = similarity(
            "how long does visa processing take",
            "how long does the visa processing take",
        );
        assert!(s > 0.7, "expected high similarity, got {}", s);
    }

    #[test]
    fn symmetric() {
        let a = "where is the consulate located";
        let b = "consulate location";
        assert_eq!(similarity(a, b), similarity(b, a));
    }

    #[test]
    fn short_strings_compare_exactly() {
        assert_eq!(similarity("ok", "ok"), 1.0);
        assert_eq!(similarity("ok", "no"), 0.0);
    }
}

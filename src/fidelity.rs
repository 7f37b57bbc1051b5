//! Text similarity between a narration's source text and the transcript of
//! its audio.

use std::collections::HashSet;

use serde::Serialize;
use strsim::normalized_levenshtein;

use crate::directive;

/// How far ahead in the transcript a source word may be found.
const LOOKAHEAD: usize = 8;
const WORD_MATCH: f64 = 0.5;

const NUKTA: char = '\u{093C}';
const CHANDRABINDU: char = '\u{0901}';
const ANUSVARA: char = '\u{0902}';
const VISARGA: char = '\u{0903}';
const AVAGRAHA: char = '\u{093D}';
const DANDA: char = '\u{0964}';
const DOUBLE_DANDA: char = '\u{0965}';

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FidelityScore {
    pub coverage: f64,
    pub order: f64,
    pub char_similarity: f64,
    pub jaccard: f64,
    pub combined: f64,
}

/// Precomposed nukta letters (U+0958..U+095F) map to their base consonant.
fn without_nukta(c: char) -> char {
    match c {
        '\u{0958}' => '\u{0915}',
        '\u{0959}' => '\u{0916}',
        '\u{095A}' => '\u{0917}',
        '\u{095B}' => '\u{091C}',
        '\u{095C}' => '\u{0921}',
        '\u{095D}' => '\u{0922}',
        '\u{095E}' => '\u{092B}',
        '\u{095F}' => '\u{092F}',
        other => other,
    }
}

fn is_devanagari(c: char) -> bool {
    ('\u{0900}'..='\u{097F}').contains(&c)
}

/// Lowercase, drop markers and punctuation, fold Devanagari spelling
/// variants a transcriber picks arbitrarily, and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let stripped = directive::strip_markers(text);
    let mut out = String::with_capacity(stripped.len());
    for c in stripped.chars().flat_map(char::to_lowercase).map(without_nukta) {
        match c {
            NUKTA | VISARGA | AVAGRAHA => {}
            CHANDRABINDU => out.push(ANUSVARA),
            DANDA | DOUBLE_DANDA => out.push(' '),
            c if c.is_whitespace() => out.push(' '),
            c if c.is_alphanumeric() || is_devanagari(c) => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Share of source words found, in order, in the transcript. Each source
/// word takes its closest transcript word within the look-ahead window and
/// the cursor moves past it; a match below `WORD_MATCH` consumes nothing.
fn fuzzy_coverage(source: &[&str], transcript: &[&str]) -> f64 {
    if source.is_empty() {
        return 0.0;
    }
    let mut cursor = 0;
    let mut matched = 0;
    for word in source {
        let window_end = (cursor + LOOKAHEAD).min(transcript.len());
        let mut best: Option<(usize, f64)> = None;
        for (k, candidate) in transcript.iter().enumerate().take(window_end).skip(cursor) {
            let sim = normalized_levenshtein(word, candidate);
            if best.is_none_or(|(_, b)| sim > b) {
                best = Some((k, sim));
            }
        }
        if let Some((k, sim)) = best
            && sim >= WORD_MATCH
        {
            matched += 1;
            cursor = k + 1;
        }
    }
    matched as f64 / source.len() as f64
}

fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            row[j + 1] = if x == y {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

fn order_score(source: &[&str], transcript: &[&str]) -> f64 {
    let longest = source.len().max(transcript.len());
    if longest == 0 {
        return 1.0;
    }
    lcs_len(source, transcript) as f64 / longest as f64
}

fn jaccard(source: &[&str], transcript: &[&str]) -> f64 {
    let a: HashSet<&str> = source.iter().copied().collect();
    let b: HashSet<&str> = transcript.iter().copied().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

pub fn score(source: &str, transcript: &str) -> FidelityScore {
    let source = normalize(source);
    let transcript = normalize(transcript);
    let src_words: Vec<&str> = source.split(' ').filter(|w| !w.is_empty()).collect();
    let hyp_words: Vec<&str> = transcript.split(' ').filter(|w| !w.is_empty()).collect();
    // no words on either side scores zero
    if src_words.is_empty() || hyp_words.is_empty() {
        return FidelityScore {
            coverage: 0.0,
            order: 0.0,
            char_similarity: 0.0,
            jaccard: 0.0,
            combined: 0.0,
        };
    }

    let coverage = fuzzy_coverage(&src_words, &hyp_words);
    let order = order_score(&src_words, &hyp_words);
    let char_similarity = normalized_levenshtein(&source, &transcript);
    let jaccard = jaccard(&src_words, &hyp_words);
    let combined = 0.50 * coverage + 0.25 * order + 0.15 * char_similarity + 0.10 * jaccard;

    FidelityScore {
        coverage,
        order,
        char_similarity,
        jaccard,
        combined: combined.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_markers_and_punctuation() {
        assert_eq!(
            normalize("[CALM] Hello,   little Star!\n\n[PAUSE] Don't cry."),
            "hello little star dont cry"
        );
    }

    #[test]
    fn test_normalize_folds_devanagari_variants() {
        // chandrabindu and anusvara spellings of the same word compare equal
        assert_eq!(normalize("चाँद"), normalize("चांद"));
        assert_eq!(normalize("ज़मीन"), "जमीन");
        assert_eq!(normalize("दुःख।"), "दुख");
    }

    #[test]
    fn test_identical_text_scores_one() {
        let text = "The little owl closed her eyes and the moon hummed softly.";
        let s = score(text, text);
        assert_eq!(s.coverage, 1.0);
        assert_eq!(s.order, 1.0);
        assert!((s.combined - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrelated_text_scores_low() {
        let s = score(
            "The little owl closed her eyes.",
            "Quarterly revenue exceeded projections.",
        );
        assert!(s.combined < 0.3, "combined {}", s.combined);
        assert_eq!(s.jaccard, 0.0);
    }

    #[test]
    fn test_minor_transcription_noise_tolerated() {
        let s = score(
            "Luna the bunny hopped across the meadow.",
            "Luna the bunnie hopped across a meadow",
        );
        // "the" → "a" is the only word lost
        assert!((s.coverage - 6.0 / 7.0).abs() < 1e-9);
        assert!(s.combined > 0.7, "combined {}", s.combined);
    }

    #[test]
    fn test_dropped_half_lowers_coverage() {
        let s = score("one two three four five six seven eight", "one two three four");
        assert!((s.coverage - 0.5).abs() < 1e-9);
        assert!((s.order - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs_score_zero() {
        assert_eq!(score("", "").combined, 0.0);
        assert_eq!(score("some words", "").combined, 0.0);
        assert_eq!(score("", "stray transcript").combined, 0.0);
        assert_eq!(score("[PAUSE]", "...").coverage, 0.0);
    }

    #[test]
    fn test_coverage_takes_closest_word_in_window() {
        // "cat" takes the exact "cat", leaving nothing after it for "hat"
        let s = score("cat hat", "hat cat");
        assert!((s.coverage - 0.5).abs() < 1e-9);
        assert!((fuzzy_coverage(&["bunny", "hops"], &["bunnie", "bunny", "hops"]) - 1.0).abs() < 1e-9);
    }
}

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::assembler::{Join, PausePlan};
use crate::config::{AssemblyConfig, ChunkingConfig};
use crate::directive::{self, Emotion};
use crate::model::ContentKind;

// Terminal punctuation (latin, ellipsis, Devanagari danda) plus closing
// quotes, followed by whitespace.
static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?…।]+["'”’)\]]*\s+"#).expect("sentence pattern is valid")
});

static CLAUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;:]\s+").expect("clause pattern is valid"));

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("word pattern is valid"));

/// One synthesis unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub tag: Option<Emotion>,
    pub paragraph: usize,
    /// The exact slice of the input this chunk covers, whitespace included.
    pub source: String,
    /// What is sent to the provider: the trimmed source, plus padding.
    pub text: String,
    pub padded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub item_id: String,
    pub kind: ContentKind,
    pub chunks: Vec<Chunk>,
    pub pauses: PausePlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Sentence,
    Clause,
    Word,
}

impl Level {
    fn finer(self) -> Option<Level> {
        match self {
            Level::Sentence => Some(Level::Clause),
            Level::Clause => Some(Level::Word),
            Level::Word => None,
        }
    }

    /// Offsets (relative to `slice`) where a new piece begins. Whitespace
    /// stays with the piece it follows.
    fn cuts(self, slice: &str) -> Vec<usize> {
        let re = match self {
            Level::Sentence => &*SENTENCE_RE,
            Level::Clause => &*CLAUSE_RE,
            Level::Word => &*WORD_RE,
        };
        re.find_iter(slice).map(|m| m.end()).collect()
    }
}

fn content_len(s: &str) -> usize {
    s.trim().chars().count()
}

/// Budget used while accumulating: the content plus the separator after it.
fn packed_len(s: &str) -> usize {
    s.trim_start().chars().count()
}

/// Contiguous pieces of `text[range]` at `level`. Whitespace-only pieces are
/// folded into a neighbour so every piece has content.
fn pieces(text: &str, range: Range<usize>, level: Level) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut starts = vec![range.start];
    starts.extend(
        level
            .cuts(slice)
            .into_iter()
            .map(|c| range.start + c)
            .filter(|c| *c > range.start && *c < range.end),
    );
    starts.dedup();

    let mut out: Vec<Range<usize>> = Vec::with_capacity(starts.len());
    let mut carried: Option<usize> = None;
    for (i, start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(range.end);
        if text[*start..end].trim().is_empty() {
            match out.last_mut() {
                Some(prev) => prev.end = end,
                None => carried = carried.or(Some(*start)),
            }
            continue;
        }
        out.push(carried.take().unwrap_or(*start)..end);
    }
    out
}

fn pack(text: &str, range: Range<usize>, level: Level, max_chars: usize, out: &mut Vec<Range<usize>>) {
    let mut current: Option<Range<usize>> = None;
    for piece in pieces(text, range, level) {
        if content_len(&text[piece.clone()]) > max_chars {
            if let Some(done) = current.take() {
                out.push(done);
            }
            match level.finer() {
                Some(finer) => pack(text, piece, finer, max_chars, out),
                // a single word longer than the limit stays whole
                None => out.push(piece),
            }
            continue;
        }
        current = match current {
            None => Some(piece),
            Some(buf) if packed_len(&text[buf.start..piece.end]) <= max_chars => {
                Some(buf.start..piece.end)
            }
            Some(buf) => {
                out.push(buf);
                Some(piece)
            }
        };
    }
    if let Some(done) = current {
        out.push(done);
    }
}

fn split_with(text: &str, max_chars: usize, min_chars: usize, padding: char) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    pack(text, 0..text.len(), Level::Sentence, max_chars, &mut ranges);

    ranges
        .into_iter()
        .enumerate()
        .map(|(index, range)| {
            let source = text[range].to_string();
            let trimmed = source.trim();
            let padded = trimmed.chars().count() < min_chars;
            let mut speak = trimmed.to_string();
            if padded {
                speak.push(padding);
            }
            Chunk {
                index,
                tag: None,
                paragraph: 0,
                source,
                text: speak,
                padded,
            }
        })
        .collect()
}

/// Split plain text into chunks of at most `max_chars` characters, breaking
/// on sentences first, then clauses, then words. Chunks shorter than
/// `min_chars` are padded with a trailing `.`.
pub fn split(text: &str, max_chars: usize, min_chars: usize) -> Vec<Chunk> {
    split_with(text, max_chars, min_chars, '.')
}

#[derive(Debug, Clone)]
pub struct Chunker {
    max_chars: usize,
    min_chars: usize,
    padding: char,
    paragraph_pause_ms: u32,
    crossfade_ms: u32,
}

impl Chunker {
    pub fn new(chunking: &ChunkingConfig, assembly: &AssemblyConfig) -> Self {
        Self {
            max_chars: chunking.max_chars,
            min_chars: chunking.min_chars,
            padding: chunking.padding,
            paragraph_pause_ms: assembly.paragraph_pause_ms,
            crossfade_ms: assembly.crossfade_ms,
        }
    }

    /// Chunks and join rules for one item's annotated text. Every tag change
    /// and paragraph break starts a new chunk.
    pub fn plan(&self, item_id: &str, kind: ContentKind, annotated: &str) -> ChunkPlan {
        let parsed = directive::parse(annotated);
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut pauses = PausePlan {
            tail_ms: parsed.trailing_pause_ms,
            ..PausePlan::default()
        };

        for segment in &parsed.segments {
            let pieces = split_with(&segment.text, self.max_chars, self.min_chars, self.padding);
            for (i, mut chunk) in pieces.into_iter().enumerate() {
                if i == 0 {
                    match chunks.last() {
                        None => pauses.lead_in_ms = segment.pause_before_ms,
                        Some(prev) if prev.paragraph != segment.paragraph => pauses
                            .joins
                            .push(Join::Silence(self.paragraph_pause_ms + segment.pause_before_ms)),
                        Some(_) if segment.pause_before_ms > 0 => {
                            pauses.joins.push(Join::Silence(segment.pause_before_ms))
                        }
                        Some(_) => pauses.joins.push(Join::Crossfade(self.crossfade_ms)),
                    }
                } else {
                    pauses.joins.push(Join::Crossfade(self.crossfade_ms));
                }
                chunk.index = chunks.len();
                chunk.tag = segment.tag;
                chunk.paragraph = segment.paragraph;
                chunks.push(chunk);
            }
        }

        debug!(
            item = item_id,
            chunks = chunks.len(),
            "Planned {} chunks for {}",
            chunks.len(),
            item_id
        );
        ChunkPlan {
            item_id: item_id.to_string(),
            kind,
            chunks,
            pauses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    fn rebuilt(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.source.as_str()).collect()
    }

    #[test]
    fn test_three_short_sentences() {
        let chunks = split("A. B. C.", 5, 1);
        assert_eq!(texts(&chunks), vec!["A.", "B.", "C."]);
        assert!(chunks.iter().all(|c| !c.padded));
        assert_eq!(rebuilt(&chunks), "A. B. C.");

        let padded = split("A. B. C.", 5, 3);
        assert_eq!(texts(&padded), vec!["A..", "B..", "C.."]);
        assert!(padded.iter().all(|c| c.padded));
        assert_eq!(rebuilt(&padded), "A. B. C.");
    }

    #[test]
    fn test_sentences_accumulate_up_to_limit() {
        let chunks = split("One two. Three four. Five six.", 24, 1);
        assert_eq!(texts(&chunks), vec!["One two. Three four.", "Five six."]);
    }

    #[test]
    fn test_long_sentence_splits_on_commas_then_words() {
        let text = "The little fox ran, the owl watched from above, and the river kept singing softly";
        let chunks = split(text, 25, 1);
        assert_eq!(rebuilt(&chunks), text);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 25));
        assert_eq!(chunks[0].text, "The little fox ran,");
    }

    #[test]
    fn test_oversized_word_stays_whole() {
        let text = "tiny supercalifragilisticexpialidocious word";
        let chunks = split(text, 10, 1);
        assert_eq!(rebuilt(&chunks), text);
        assert!(chunks.iter().any(|c| c.text == "supercalifragilisticexpialidocious"));
        for c in &chunks {
            assert!(c.text.chars().count() <= 10 || !c.text.contains(' '));
        }
    }

    #[test]
    fn test_round_trip_and_bound_over_many_inputs() {
        let words = [
            "moon", "the", "sleepy", "bear,", "whispered.", "Goodnight!", "stars", "river?",
            "और", "चाँद।", "a", "  ", "\n", "lullaby;", "\"Hush.\"", "soft",
        ];
        for seed in 0..200usize {
            let mut text = String::new();
            let len = 1 + seed % 37;
            for i in 0..len {
                let w = words[(seed * 7 + i * 13 + i * i) % words.len()];
                text.push_str(w);
                text.push(if (seed + i) % 5 == 0 { '\t' } else { ' ' });
            }
            for max in [8, 20, 60] {
                let chunks = split(&text, max, 4);
                if text.trim().is_empty() {
                    assert!(chunks.is_empty());
                    continue;
                }
                assert_eq!(rebuilt(&chunks), text, "seed {seed} max {max}");
                for c in &chunks {
                    let n = c.text.chars().count();
                    let single_word = !c.source.trim().contains(char::is_whitespace);
                    assert!(n <= max || single_word, "chunk {:?} over {max}", c.text);
                }
                assert_eq!(chunks, split(&text, max, 4));
            }
        }
    }

    #[test]
    fn test_plan_flushes_on_tag_change_and_paragraph() {
        let chunker = Chunker::new(&ChunkingConfig::default(), &AssemblyConfig::default());
        let plan = chunker.plan(
            "item",
            ContentKind::Story,
            "[PAUSE] Once there was a fox. [SLEEPY] It yawned.\n\n[PAUSE] The end.",
        );
        assert_eq!(plan.chunks.len(), 3);
        assert_eq!(plan.chunks[0].tag, None);
        assert_eq!(plan.chunks[1].tag, Some(Emotion::Sleepy));
        assert_eq!(plan.chunks[2].paragraph, 1);
        assert_eq!(plan.pauses.lead_in_ms, 800);
        assert_eq!(
            plan.pauses.joins,
            vec![Join::Crossfade(40), Join::Silence(1800)]
        );
        assert_eq!(plan.chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_plan_of_empty_text() {
        let chunker = Chunker::new(&ChunkingConfig::default(), &AssemblyConfig::default());
        let plan = chunker.plan("item", ContentKind::Poem, "  [CALM]  ");
        assert!(plan.chunks.is_empty());
        assert!(plan.pauses.joins.is_empty());
    }
}

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::ContentKind;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\[(SLEEPY|GENTLE|CALM|EXCITED|CURIOUS|ADVENTUROUS|MYSTERIOUS|JOYFUL|DRAMATIC_PAUSE|DRAMATIC|WHISPERING|RHYTHMIC|SINGING|HUMMING|PAUSE|LAUGH|CHUCKLE)\]",
    )
    .expect("marker pattern is valid")
});

static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("paragraph pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Sleepy,
    Gentle,
    Calm,
    Excited,
    Curious,
    Adventurous,
    Mysterious,
    Joyful,
    Dramatic,
    Whispering,
    Rhythmic,
    Singing,
    Humming,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StyleParams {
    pub exaggeration: f32,
    pub cfg_weight: f32,
}

impl StyleParams {
    const fn new(exaggeration: f32, cfg_weight: f32) -> Self {
        Self {
            exaggeration,
            cfg_weight,
        }
    }

    pub fn clamped(self, exaggeration: (f32, f32), cfg_weight: (f32, f32)) -> Self {
        Self {
            exaggeration: self.exaggeration.clamp(exaggeration.0, exaggeration.1),
            cfg_weight: self.cfg_weight.clamp(cfg_weight.0, cfg_weight.1),
        }
    }
}

impl Emotion {
    pub fn profile(&self) -> StyleParams {
        match self {
            Emotion::Sleepy => StyleParams::new(0.3, 0.3),
            Emotion::Gentle => StyleParams::new(0.5, 0.4),
            Emotion::Calm => StyleParams::new(0.5, 0.5),
            Emotion::Excited => StyleParams::new(0.7, 0.5),
            Emotion::Curious => StyleParams::new(0.6, 0.5),
            Emotion::Adventurous => StyleParams::new(0.7, 0.4),
            Emotion::Mysterious => StyleParams::new(0.5, 0.3),
            Emotion::Joyful => StyleParams::new(0.7, 0.5),
            Emotion::Dramatic => StyleParams::new(0.7, 0.3),
            Emotion::Whispering => StyleParams::new(0.3, 0.3),
            Emotion::Rhythmic => StyleParams::new(0.5, 0.3),
            Emotion::Singing => StyleParams::new(0.7, 0.3),
            Emotion::Humming => StyleParams::new(0.4, 0.3),
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        let emotion = match tag.to_ascii_lowercase().as_str() {
            "sleepy" => Emotion::Sleepy,
            "gentle" => Emotion::Gentle,
            "calm" => Emotion::Calm,
            "excited" => Emotion::Excited,
            "curious" => Emotion::Curious,
            "adventurous" => Emotion::Adventurous,
            "mysterious" => Emotion::Mysterious,
            "joyful" => Emotion::Joyful,
            "dramatic" => Emotion::Dramatic,
            "whispering" => Emotion::Whispering,
            "rhythmic" => Emotion::Rhythmic,
            "singing" => Emotion::Singing,
            "humming" => Emotion::Humming,
            _ => return None,
        };
        Some(emotion)
    }
}

pub fn base_style(kind: ContentKind) -> StyleParams {
    match kind {
        ContentKind::Story => StyleParams::new(0.5, 0.5),
        ContentKind::Poem => StyleParams::new(0.5, 0.3),
        ContentKind::Lullaby => StyleParams::new(0.4, 0.3),
    }
}

/// Style for a chunk: the emotion's profile, or the kind's base before any tag.
pub fn resolve_style(tag: Option<Emotion>, kind: ContentKind) -> StyleParams {
    tag.map(|e| e.profile()).unwrap_or_else(|| base_style(kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Emotion(Emotion),
    Pause(u32),
    Ignored,
}

fn classify(tag: &str) -> Marker {
    match tag.to_ascii_lowercase().as_str() {
        "pause" => Marker::Pause(800),
        "dramatic_pause" => Marker::Pause(1500),
        "laugh" | "chuckle" => Marker::Ignored,
        other => Emotion::from_tag(other).map_or(Marker::Ignored, Marker::Emotion),
    }
}

/// A run of plain text under one emotion tag, inside one paragraph.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub paragraph: usize,
    pub tag: Option<Emotion>,
    /// Silence requested by pause markers directly before this segment.
    pub pause_before_ms: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedText {
    pub segments: Vec<Segment>,
    /// Pause markers after the last segment.
    pub trailing_pause_ms: u32,
}

/// Split annotated text into paragraphs and tag segments. The active emotion
/// carries across paragraph breaks; pause markers accumulate onto the next
/// segment.
pub fn parse(annotated: &str) -> ParsedText {
    let mut parsed = ParsedText::default();
    let mut tag = None;
    let mut pending_pause = 0u32;

    for (paragraph, block) in PARAGRAPH_RE.split(annotated).enumerate() {
        let mut last = 0;
        for caps in MARKER_RE.captures_iter(block) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_segment(
                &mut parsed,
                paragraph,
                tag,
                &mut pending_pause,
                &block[last..whole.start()],
            );
            match classify(name.as_str()) {
                Marker::Emotion(e) => tag = Some(e),
                Marker::Pause(ms) => pending_pause += ms,
                Marker::Ignored => {}
            }
            last = whole.end();
        }
        push_segment(&mut parsed, paragraph, tag, &mut pending_pause, &block[last..]);
    }
    parsed.trailing_pause_ms = pending_pause;
    parsed
}

fn push_segment(
    parsed: &mut ParsedText,
    paragraph: usize,
    tag: Option<Emotion>,
    pending_pause: &mut u32,
    text: &str,
) {
    if text.trim().is_empty() {
        return;
    }
    parsed.segments.push(Segment {
        paragraph,
        tag,
        pause_before_ms: std::mem::take(pending_pause),
        text: text.to_string(),
    });
}

/// Annotated text with every marker removed.
pub fn strip_markers(annotated: &str) -> String {
    MARKER_RE.replace_all(annotated, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags_and_pauses() {
        let text = "Once upon a time. [SLEEPY] The moon yawned. [PAUSE] Goodnight.\n\n[excited] Morning came!";
        let parsed = parse(text);
        let tags: Vec<_> = parsed.segments.iter().map(|s| (s.paragraph, s.tag)).collect();
        assert_eq!(
            tags,
            vec![
                (0, None),
                (0, Some(Emotion::Sleepy)),
                (0, Some(Emotion::Sleepy)),
                (1, Some(Emotion::Excited)),
            ]
        );
        assert_eq!(parsed.segments[2].pause_before_ms, 800);
        assert_eq!(parsed.segments[2].text.trim(), "Goodnight.");
        assert_eq!(parsed.trailing_pause_ms, 0);
    }

    #[test]
    fn test_tag_carries_across_paragraphs() {
        let parsed = parse("[WHISPERING] Hush now.\n\nSleep tight.");
        assert_eq!(parsed.segments[1].tag, Some(Emotion::Whispering));
        assert_eq!(parsed.segments[1].paragraph, 1);
    }

    #[test]
    fn test_laugh_is_dropped_and_dramatic_pause_trails() {
        let parsed = parse("He giggled [laugh] and smiled. [DRAMATIC_PAUSE]");
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segments[1].text, " and smiled. ");
        assert_eq!(parsed.trailing_pause_ms, 1500);
    }

    #[test]
    fn test_no_markers() {
        let parsed = parse("Just text.");
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].tag, None);
        assert_eq!(parsed.segments[0].text, "Just text.");
    }

    #[test]
    fn test_style_resolution_and_clamp() {
        assert_eq!(resolve_style(None, ContentKind::Poem), base_style(ContentKind::Poem));
        let dramatic = resolve_style(Some(Emotion::Dramatic), ContentKind::Story);
        assert_eq!(dramatic.exaggeration, 0.7);
        let clamped = StyleParams::new(1.4, 0.05).clamped((0.0, 1.0), (0.1, 1.0));
        assert_eq!(clamped, StyleParams::new(1.0, 0.1));
    }

    #[test]
    fn test_strip_markers() {
        assert_eq!(strip_markers("[CALM]Hello [Pause]world"), "Hello world");
    }
}

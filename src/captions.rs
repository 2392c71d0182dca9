//! Caption cue cleanup and SRT output.
//!
//! Backends hand back cues in whatever shape they like: overlapping, zero
//! length, out of order, or running past the end of the clip. Everything
//! that gets burned into a video goes through [`normalize_cues`] first, which
//! guarantees sorted, non-decreasing start times and `start < end` per cue.

use std::fmt::Write as FmtWrite;
use std::path::Path;

use anyhow::{Context, Result};

use crate::transcribe::CaptionCue;
use crate::utilities::format_timestamp;

/// Shortest on-screen time given to a cue whose end was missing or inverted.
const MIN_CUE_SECONDS: f64 = 0.3;
/// Words per cue when grouping word-level timings.
const WORDS_PER_CUE: usize = 4;
/// Longest span a grouped cue may cover.
const MAX_CUE_SECONDS: f64 = 2.5;

/// A single timed word from a backend that reports word timings.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedWord {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Sorts and repairs cues so they are safe to render.
///
/// Cues with blank text are dropped. When `clip_seconds` is given, cues that
/// start after the clip ends are dropped and the rest are clamped to it.
pub fn normalize_cues(cues: &[CaptionCue], clip_seconds: Option<f64>) -> Vec<CaptionCue> {
    let mut sorted: Vec<CaptionCue> = cues
        .iter()
        .filter(|c| !c.text.trim().is_empty())
        .filter(|c| c.start.is_finite() && c.end.is_finite())
        .map(|c| CaptionCue {
            start: c.start.max(0.0),
            end: c.end.max(0.0),
            text: c.text.trim().to_string(),
        })
        .collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut out: Vec<CaptionCue> = Vec::with_capacity(sorted.len());
    for mut cue in sorted {
        if let Some(limit) = clip_seconds {
            if cue.start >= limit {
                continue;
            }
            cue.end = cue.end.min(limit);
        }
        if cue.end <= cue.start {
            cue.end = cue.start + MIN_CUE_SECONDS;
            if let Some(limit) = clip_seconds {
                if cue.end > limit {
                    cue.end = limit;
                }
            }
        }
        if cue.end > cue.start {
            out.push(cue);
        }
    }
    out
}

/// Groups word timings into short phrases.
pub fn group_words(words: &[TimedWord]) -> Vec<CaptionCue> {
    let mut cues = Vec::new();
    let mut current: Vec<&TimedWord> = Vec::new();

    for word in words.iter().filter(|w| !w.text.trim().is_empty()) {
        if let Some(first) = current.first() {
            if current.len() >= WORDS_PER_CUE || word.end - first.start > MAX_CUE_SECONDS {
                cues.push(join_words(&current));
                current.clear();
            }
        }
        current.push(word);
    }
    if !current.is_empty() {
        cues.push(join_words(&current));
    }
    cues
}

fn join_words(words: &[&TimedWord]) -> CaptionCue {
    let text = words
        .iter()
        .map(|w| w.text.trim())
        .collect::<Vec<_>>()
        .join(" ");
    CaptionCue {
        start: words[0].start,
        end: words[words.len() - 1].end,
        text,
    }
}

/// Spreads untimed words evenly across the clip.
pub fn spread_words(text: &str, clip_seconds: f64) -> Vec<TimedWord> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || clip_seconds <= 0.0 {
        return Vec::new();
    }
    let step = clip_seconds / words.len() as f64;
    words
        .iter()
        .enumerate()
        .map(|(i, w)| TimedWord {
            text: (*w).to_string(),
            start: i as f64 * step,
            end: (i + 1) as f64 * step,
        })
        .collect()
}

/// Renders cues as SubRip text.
pub fn to_srt(cues: &[CaptionCue]) -> String {
    let mut srt = String::new();
    for (i, cue) in cues.iter().enumerate() {
        let _ = write!(
            srt,
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_timestamp(cue.start),
            format_timestamp(cue.end),
            cue.text
        );
    }
    srt
}

/// Normalizes `cues` and writes them to `path`. Returns how many cues were written.
pub async fn write_srt(path: &Path, cues: &[CaptionCue], clip_seconds: f64) -> Result<usize> {
    let cues = normalize_cues(cues, Some(clip_seconds));
    tokio::fs::write(path, to_srt(&cues))
        .await
        .with_context(|| format!("writing captions to {}", path.display()))?;
    Ok(cues.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(start: f64, end: f64, text: &str) -> CaptionCue {
        CaptionCue {
            start,
            end,
            text: text.to_string(),
        }
    }

    fn assert_renderable(cues: &[CaptionCue]) {
        for pair in cues.windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
        for c in cues {
            assert!(c.start < c.end, "{:?}", c);
        }
    }

    #[test]
    fn normalizes_messy_backend_output() {
        let raw = vec![
            cue(5.0, 6.0, "third"),
            cue(1.0, 1.0, "zero length"),
            cue(0.5, 2.0, "first"),
            cue(3.0, 2.0, "inverted"),
            cue(4.0, 5.0, "   "),
            cue(-1.0, 0.2, "negative start"),
            cue(40.0, 41.0, "past the end"),
        ];

        let cues = normalize_cues(&raw, Some(30.0));

        assert_renderable(&cues);
        let texts: Vec<&str> = cues.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["negative start", "first", "zero length", "inverted", "third"]
        );
    }

    #[test]
    fn clamps_cues_to_the_clip_length() {
        let cues = normalize_cues(&[cue(29.9, 35.0, "tail"), cue(30.0, 30.0, "edge")], Some(30.0));
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].end, 30.0);
        assert_renderable(&cues);
    }

    #[test]
    fn groups_words_into_short_phrases() {
        let words: Vec<TimedWord> = (0..9)
            .map(|i| TimedWord {
                text: format!("w{}", i),
                start: i as f64 * 0.4,
                end: i as f64 * 0.4 + 0.3,
            })
            .collect();

        let cues = group_words(&words);
        assert_eq!(cues.len(), 3);
        assert_eq!(cues[0].text, "w0 w1 w2 w3");
        assert_eq!(cues[2].text, "w8");
        assert_renderable(&normalize_cues(&cues, None));
    }

    #[test]
    fn spreads_untimed_words_over_the_clip() {
        let words = spread_words("one two three four", 8.0);
        assert_eq!(words.len(), 4);
        assert_eq!(words[1].start, 2.0);
        assert_eq!(words[3].end, 8.0);
        assert!(spread_words("   ", 8.0).is_empty());
    }

    #[test]
    fn renders_srt_blocks() {
        let srt = to_srt(&[cue(0.0, 1.5, "hello"), cue(1.5, 3.0, "world")]);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,500\nhello\n\n2\n00:00:01,500 --> 00:00:03,000\nworld\n\n"
        );
    }
}

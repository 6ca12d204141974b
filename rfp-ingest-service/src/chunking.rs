//! Deterministic text chunking.
//!
//! Splits extracted text into overlapping chunks bounded by character (not
//! byte) counts. Break points are chosen in `[start + min, start + max]`,
//! preferring a paragraph break, then a line break, then a sentence end, then
//! any whitespace.

use crate::config::ChunkingConfig;
use crate::error::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakKind {
    Paragraph,
    Line,
    Sentence,
    Whitespace,
}

const BREAK_PREFERENCE: [BreakKind; 4] = [
    BreakKind::Paragraph,
    BreakKind::Line,
    BreakKind::Sentence,
    BreakKind::Whitespace,
];

/// Reject thresholds that cannot produce progress
pub fn validate_config(config: &ChunkingConfig) -> Result<(), ProcessingError> {
    if config.max_chars == 0 {
        return Err(ProcessingError::InvalidChunking {
            message: "max_chars must be greater than zero".to_string(),
        });
    }
    if config.min_chars > config.max_chars {
        return Err(ProcessingError::InvalidChunking {
            message: format!(
                "min_chars ({}) exceeds max_chars ({})",
                config.min_chars, config.max_chars
            ),
        });
    }
    if config.overlap_chars >= config.max_chars {
        return Err(ProcessingError::InvalidChunking {
            message: format!(
                "overlap_chars ({}) must be smaller than max_chars ({})",
                config.overlap_chars, config.max_chars
            ),
        });
    }
    Ok(())
}

/// Split `text` into trimmed, non-empty chunks.
///
/// The same text and thresholds always yield the same chunks.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<String>, ProcessingError> {
    validate_config(config)?;

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;

    while start < n {
        if n - start <= config.max_chars {
            ranges.push((start, n));
            break;
        }

        let lo = start + config.min_chars.max(1);
        let mut hi = start + config.max_chars;
        // Pull the window back rather than leave a sliver behind
        if n - hi < config.min_chars && n - config.min_chars >= lo {
            hi = n - config.min_chars;
        }

        let end = find_break(&chars, lo, hi).unwrap_or(hi);
        ranges.push((start, end));
        start = next_start(&chars, start, end, config.overlap_chars);
    }

    Ok(ranges
        .into_iter()
        .map(|(s, e)| chars[s..e].iter().collect::<String>().trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect())
}

/// Latest break position in `[lo, hi]` of the most preferred kind. The
/// returned position is the exclusive end of the chunk.
fn find_break(chars: &[char], lo: usize, hi: usize) -> Option<usize> {
    BREAK_PREFERENCE
        .iter()
        .find_map(|kind| (lo..=hi).rev().find(|&p| is_break(chars, p, *kind)))
}

fn is_break(chars: &[char], p: usize, kind: BreakKind) -> bool {
    if p == 0 || p > chars.len() {
        return false;
    }
    let prev = chars[p - 1];
    match kind {
        BreakKind::Paragraph => p >= 2 && prev == '\n' && chars[p - 2] == '\n',
        BreakKind::Line => prev == '\n',
        BreakKind::Sentence => {
            matches!(prev, '.' | '!' | '?') && chars.get(p).is_none_or(|c| c.is_whitespace())
        }
        BreakKind::Whitespace => prev.is_whitespace(),
    }
}

/// Start of the chunk after `[start, end)`: `overlap` characters back from
/// `end`, moved forward to a word start when one exists in that window.
fn next_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }

    let candidate = end.saturating_sub(overlap).max(start + 1);
    (candidate..end)
        .find(|&i| {
            !chars[i].is_whitespace() && (i == 0 || chars[i - 1].is_whitespace())
        })
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_chars: usize, min_chars: usize, overlap_chars: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chars,
            min_chars,
            overlap_chars,
        }
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_text("  Executive summary.  ", &config(100, 10, 20)).unwrap();
        assert_eq!(chunks, vec!["Executive summary."]);
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(chunk_text("", &config(10, 2, 0)).unwrap().is_empty());
        assert!(chunk_text(" \n\n \t", &config(10, 2, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = "First para here.\n\nSecond para that is longer than the limit";
        let chunks = chunk_text(text, &config(30, 5, 0)).unwrap();
        assert_eq!(chunks[0], "First para here.");
        assert!(chunks.iter().all(|c| c.chars().count() <= 30));
    }

    #[test]
    fn test_sentence_beats_whitespace() {
        let chunks = chunk_text("One. Two three four five six", &config(15, 3, 0)).unwrap();
        assert_eq!(chunks, vec!["One.", "Two three", "four five six"]);
    }

    #[test]
    fn test_overlap_starts_at_word_boundary() {
        let text: String = (0..20).map(|i| format!("w{:02} ", i)).collect();
        let chunks = chunk_text(&text, &config(20, 10, 8)).unwrap();

        assert_eq!(chunks[0], "w00 w01 w02 w03 w04");
        assert!(chunks[1].starts_with("w03"));
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
            // Never starts mid-word
            assert!(chunk.starts_with('w'));
        }
    }

    #[test]
    fn test_tail_is_not_left_as_a_sliver() {
        let chunks = chunk_text("w00 w01 w02 w03 w04 w05", &config(20, 8, 0)).unwrap();
        assert_eq!(chunks, vec!["w00 w01 w02", "w03 w04 w05"]);
    }

    #[test]
    fn test_hard_cut_without_breaks() {
        let text = "a".repeat(25);
        let chunks = chunk_text(&text, &config(10, 5, 0)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let text = "é".repeat(30);
        let chunks = chunk_text(&text, &config(10, 5, 2)).unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert!(chunks.len() >= 3);
    }

    #[test]
    fn test_deterministic() {
        let text = "Section 1. Scope of work.\nThe contractor shall provide services.\n\n\
                    Section 2. Pricing.\nAll prices are firm for the contract term. "
            .repeat(20);
        let cfg = config(120, 40, 30);
        let first = chunk_text(&text, &cfg).unwrap();
        let second = chunk_text(&text, &cfg).unwrap();
        assert_eq!(first, second);
        assert!(first.len() > 1);
    }

    #[test]
    fn test_invalid_config() {
        assert!(validate_config(&config(0, 0, 0)).is_err());
        assert!(validate_config(&config(10, 11, 0)).is_err());
        assert!(validate_config(&config(10, 5, 10)).is_err());
        assert!(validate_config(&config(10, 5, 9)).is_ok());
        assert!(validate_config(&ChunkingConfig::default()).is_ok());
    }
}

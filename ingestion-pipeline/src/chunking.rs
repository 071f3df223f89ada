//! Recursive character splitting. Boundaries are tried in priority order
//! (markdown heading, paragraph, line, sentence, word) before falling back
//! to a raw character split; pieces are then merged up to the target size
//! with a character overlap carried between consecutive chunks.

use serde::{Deserialize, Serialize};

/// Split boundaries in priority order. Separators attach to the start of
/// the following piece, so heading markers survive at chunk starts.
const SEPARATORS: [&str; 5] = ["\n\n##", "\n\n", "\n", ". ", " "];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 50,
        }
    }
}

/// One numbered chunk of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub chunk_id: String,
    pub text: String,
}

/// Splits a document into chunks with ids of the form
/// `{doc_id}_chunk_{index}`. Empty input yields no chunks.
pub fn chunk_document(doc_id: &str, text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    chunk_text(text, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            index,
            chunk_id: format!("{doc_id}_chunk_{index}"),
            text,
        })
        .collect()
}

pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let pieces = split_recursive(text, &SEPARATORS, config.chunk_size);
    merge_pieces(pieces, config)
}

fn split_recursive(text: &str, separators: &[&str], chunk_size: usize) -> Vec<String> {
    if char_len(text) <= chunk_size {
        return vec![text.to_string()];
    }

    let Some((separator, rest)) = separators.split_first() else {
        return split_chars(text, chunk_size);
    };

    if !text.contains(separator) {
        return split_recursive(text, rest, chunk_size);
    }

    let mut out = Vec::new();
    for piece in split_with_separator(text, separator) {
        if char_len(&piece) <= chunk_size {
            out.push(piece);
        } else {
            out.extend(split_recursive(&piece, rest, chunk_size));
        }
    }
    out
}

/// Splits on `separator`, attaching each occurrence to the start of the
/// following piece so that concatenating the pieces reproduces the input.
fn split_with_separator(text: &str, separator: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut piece_start = 0usize;
    let mut search_from = 0usize;

    while let Some(found) = text.get(search_from..).and_then(|rest| rest.find(separator)) {
        let boundary = search_from + found;
        if boundary > piece_start {
            pieces.push(text.get(piece_start..boundary).unwrap_or_default().to_string());
            piece_start = boundary;
        }
        search_from = boundary + separator.len();
    }

    if piece_start < text.len() {
        pieces.push(text.get(piece_start..).unwrap_or_default().to_string());
    }

    pieces.retain(|piece| !piece.is_empty());
    pieces
}

fn split_chars(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size.max(1))
        .map(|window| window.iter().collect())
        .collect()
}

fn merge_pieces(pieces: Vec<String>, config: &ChunkerConfig) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for piece in pieces {
        let piece_len = char_len(&piece);
        if current_len > 0 && current_len + piece_len > config.chunk_size {
            let tail = overlap_tail(&current, config.overlap);
            chunks.push(current);
            current_len = char_len(&tail);
            current = tail;
        }
        current.push_str(&piece);
        current_len += piece_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Last `overlap` characters of a chunk, carried into the next one.
pub fn overlap_tail(text: &str, overlap: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(overlap);
    chars.get(start..).unwrap_or_default().iter().collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size,
            overlap,
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
        assert!(chunk_text("   \n  ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("The capital of France is Paris.", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "The capital of France is Paris.");
    }

    #[test]
    fn chunk_ids_are_doc_scoped_and_numbered() {
        let text = "alpha ".repeat(200);
        let chunks = chunk_document("doc_9", &text, &config(100, 10));

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.chunk_id, format!("doc_9_chunk_{i}"));
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Sentence one. Sentence two. Sentence three. ".repeat(40);
        let cfg = config(120, 20);

        let first = chunk_text(&text, &cfg);
        let second = chunk_text(&text, &cfg);
        assert_eq!(first, second);
        assert!(first.len() > 1);
    }

    #[test]
    fn concatenation_reproduces_text_modulo_overlap() {
        let text = "## Heading\n\nParagraph one with some words.\n\nParagraph two follows here. \
                    It has two sentences.\nA third line rounds it out."
            .repeat(4);
        let cfg = config(90, 15);

        let chunks = chunk_text(&text, &cfg);
        assert!(chunks.len() > 1);

        let mut rebuilt = chunks[0].clone();
        for pair in chunks.windows(2) {
            let tail = overlap_tail(&pair[0], cfg.overlap);
            let next = &pair[1];
            assert!(
                next.starts_with(&tail),
                "chunk should start with the previous chunk's overlap tail"
            );
            rebuilt.push_str(&next[tail.len()..]);
        }

        assert_eq!(rebuilt, text);
    }

    #[test]
    fn heading_boundaries_are_preferred() {
        let section = "word ".repeat(30);
        let text = format!("Intro text here.\n\n## Section A\n{section}\n\n## Section B\n{section}");
        let chunks = chunk_text(&text, &config(200, 0));

        assert!(chunks.len() >= 2);
        assert!(
            chunks.iter().skip(1).any(|c| c.starts_with("\n\n## Section")),
            "later chunks should begin at heading boundaries"
        );
    }

    #[test]
    fn long_unbroken_text_falls_back_to_character_split() {
        let text = "x".repeat(1200);
        let chunks = chunk_text(&text, &config(500, 0));

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 500));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn re_chunking_same_text_gives_same_count() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(60);
        let cfg = ChunkerConfig::default();

        assert_eq!(chunk_text(&text, &cfg).len(), chunk_text(&text, &cfg).len());
    }
}

//! Token-budget chunker with overlap.
//!
//! Text is split into words on whitespace; each word costs roughly one token
//! per four characters (minimum one). Chunks are cut on word boundaries so the
//! running cost never exceeds the budget, and each new chunk starts with the
//! trailing words of the previous one, up to the overlap budget.
//!
//! Chunk text is sliced from the original input, so line breaks and
//! punctuation survive. Output depends only on the input, which makes
//! regenerations diffable.

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub token_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Word {
    start: usize,
    end: usize,
    tokens: u32,
}

/// Estimated token cost of a piece of text.
pub fn estimate_tokens(text: &str) -> u32 {
    text.split_whitespace().map(word_tokens).sum()
}

fn word_tokens(word: &str) -> u32 {
    (word.chars().count().div_ceil(CHARS_PER_TOKEN)).max(1) as u32
}

/// Splits `text` into chunks of at most `budget` tokens sharing up to `overlap`
/// tokens with their predecessor. Blank input yields no chunks.
pub fn chunk_text(text: &str, budget: u32, overlap: u32) -> Vec<TextChunk> {
    let budget = budget.max(1);
    let words = split_words(text, budget);
    if words.is_empty() {
        return Vec::new();
    }

    let total: u32 = words.iter().map(|w| w.tokens).sum();
    if total <= budget {
        return vec![make_chunk(text, &words)];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let mut end = start;
        let mut used = 0;
        while end < words.len() && (end == start || used + words[end].tokens <= budget) {
            used += words[end].tokens;
            end += 1;
        }
        chunks.push(make_chunk(text, &words[start..end]));
        if end == words.len() {
            break;
        }

        // Walk back from the cut to pick up the overlap, always moving forward.
        let mut next = end;
        let mut carried = 0;
        while next > start + 1 && carried + words[next - 1].tokens <= overlap {
            next -= 1;
            carried += words[next].tokens;
        }
        start = next;
    }
    chunks
}

/// Word spans over `text`. Words longer than the budget are hard-split on
/// char boundaries so no single word can overflow a chunk.
fn split_words(text: &str, budget: u32) -> Vec<Word> {
    let max_chars = budget as usize * CHARS_PER_TOKEN;
    let mut words = Vec::new();
    let mut word_start: Option<usize> = None;

    let push = |start: usize, end: usize, words: &mut Vec<Word>| {
        let slice = &text[start..end];
        if slice.chars().count() <= max_chars {
            words.push(Word {
                start,
                end,
                tokens: word_tokens(slice),
            });
            return;
        }
        let mut piece_start = start;
        let mut count = 0;
        for (offset, _) in slice.char_indices() {
            if count == max_chars {
                let at = start + offset;
                words.push(Word {
                    start: piece_start,
                    end: at,
                    tokens: word_tokens(&text[piece_start..at]),
                });
                piece_start = at;
                count = 0;
            }
            count += 1;
        }
        words.push(Word {
            start: piece_start,
            end,
            tokens: word_tokens(&text[piece_start..end]),
        });
    };

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = word_start.take() {
                push(s, i, &mut words);
            }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(s) = word_start {
        push(s, text.len(), &mut words);
    }
    words
}

fn make_chunk(text: &str, words: &[Word]) -> TextChunk {
    let (first, last) = (words[0], words[words.len() - 1]);
    TextChunk {
        text: text[first.start..last.end].to_string(),
        token_count: words.iter().map(|w| w.tokens).sum(),
    }
}

//! Splitting prompts into fixed-size pieces and joining answers back.

/// Maximum characters per chunk.
pub const CHUNK_CHARS: usize = 1000;

/// A contiguous piece of a prompt and its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

/// Split `text` into chunks of at most [`CHUNK_CHARS`] characters.
pub fn split(text: &str) -> Vec<Chunk> {
    split_with(text, CHUNK_CHARS)
}

/// Split `text` into `ceil(len / max_chars)` chunks of at most `max_chars`
/// characters each, counted in Unicode scalar values. Only the last chunk may
/// be shorter. An empty string yields no chunks.
///
/// # Panics
///
/// Panics if `max_chars` is zero.
pub fn split_with(text: &str, max_chars: usize) -> Vec<Chunk> {
    assert!(max_chars > 0, "chunk size must be positive");

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == max_chars {
            chunks.push(Chunk {
                index: chunks.len(),
                text: text[start..offset].to_string(),
            });
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        chunks.push(Chunk {
            index: chunks.len(),
            text: text[start..].to_string(),
        });
    }
    chunks
}

/// Concatenate pieces in the order supplied.
pub fn join<S: AsRef<str>>(pieces: &[S]) -> String {
    pieces.iter().map(AsRef::as_ref).collect()
}

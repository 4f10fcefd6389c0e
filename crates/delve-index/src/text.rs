//! Heuristics deciding whether a file is worth embedding.

use std::path::Path;

const BINARY_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "exe", "bin", "pdf", "gif", "bmp", "zip", "rar", "mp3", "mp4", "avi",
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "ico", "svg",
];

/// Bytes inspected by [`looks_like_text`].
pub const SAMPLE_LEN: usize = 4096;

/// Extension check. Files without an extension are treated as non-text.
#[must_use]
pub fn is_text_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            !BINARY_EXTENSIONS.contains(&ext.as_str())
        })
}

/// Content check on the first [`SAMPLE_LEN`] bytes: at most 1% NUL bytes and
/// at least 90% of the bytes belonging to valid UTF-8 sequences.
#[must_use]
pub fn looks_like_text(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(SAMPLE_LEN)];
    if sample.is_empty() {
        return false;
    }
    let nul = sample.iter().filter(|b| **b == 0).count();
    if nul * 100 > sample.len() {
        return false;
    }
    let invalid = invalid_utf8_bytes(sample);
    (sample.len() - invalid) * 10 >= sample.len() * 9
}

/// Bytes not covered by a valid UTF-8 sequence. A sequence cut off by the
/// end of the sample counts as valid.
fn invalid_utf8_bytes(mut bytes: &[u8]) -> usize {
    let mut invalid = 0;
    loop {
        match std::str::from_utf8(bytes) {
            Ok(_) => return invalid,
            Err(e) => {
                let Some(bad) = e.error_len() else {
                    return invalid;
                };
                invalid += bad;
                bytes = &bytes[e.valid_up_to() + bad..];
            }
        }
    }
}

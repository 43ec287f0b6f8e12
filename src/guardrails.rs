//! Post-generation checks on model output.

/// Cap `text` at `max` sentences.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace or the end of the
/// text, so URLs and decimals are never split. Links that only appear in the
/// dropped tail are moved into the last kept sentence. A `max` of zero
/// leaves the text untouched.
pub fn limit_sentences(text: &str, max: usize) -> String {
    let text = text.trim();
    if max == 0 {
        return text.to_string();
    }

    let ends = sentence_ends(text);
    let Some(&cut) = ends.get(max - 1) else {
        return text.to_string();
    };
    let tail = &text[cut..];
    if tail.trim().is_empty() {
        return text.to_string();
    }

    let kept = &text[..cut];
    let orphaned: Vec<&str> = links(tail)
        .into_iter()
        .filter(|link| !kept.contains(link))
        .collect();
    if orphaned.is_empty() {
        return kept.to_string();
    }

    // Re-insert before the closing punctuation of the last kept sentence.
    let (body, terminator) = kept.split_at(kept.len() - 1);
    format!("{} ({}){}", body, orphaned.join(", "), terminator)
}

/// Number of sentences in `text`, counting an unterminated trailing fragment.
pub fn count_sentences(text: &str) -> usize {
    let text = text.trim();
    let ends = sentence_ends(text);
    let trailing = ends.last().map_or(text, |&end| &text[end..]);
    ends.len() + usize::from(!trailing.trim().is_empty())
}

/// Byte offsets just past each sentence terminator.
fn sentence_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let boundary = match chars.peek() {
            None => true,
            Some((_, next)) => next.is_whitespace(),
        };
        if boundary {
            ends.push(i + c.len_utf8());
        }
    }
    ends
}

/// `http(s)://` links in `text`, without trailing punctuation.
pub fn links(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .filter_map(|token| {
            let start = token.find("http://").or_else(|| token.find("https://"))?;
            let link = token[start..].trim_end_matches(|c: char| ".,;:!?)]}\"'".contains(c));
            (!link.is_empty()).then_some(link)
        })
        .collect()
}

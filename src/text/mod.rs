//! Deterministic text metrics used by the non-generative stages.
//!
//! - word counting that ignores `(Author, Year)` citations
//! - citation discovery
//! - paragraph and sentence segmentation
//! - cleanup of model output (code fences)

pub mod references;
pub mod rubric;

use regex::Regex;
use std::sync::LazyLock;

// Matches (Smith, 2021), (Smith & Wei, 2022), (Bell et al., 2020), (Smith, n.d.)
static CITATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\([A-Z][A-Za-z'\-]+(?:\s+(?:&\s+[A-Z][A-Za-z'\-]+|et al\.))?,?\s*(?:\d{4}|n\.d\.)\)")
        .unwrap()
});

static FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*```[A-Za-z]*\s*\n?(.*?)\n?\s*```\s*$").unwrap());

/// Number of whitespace-separated words, not counting in-text citations.
pub fn count_words(text: &str) -> u32 {
    let stripped = CITATION_REGEX.replace_all(text, " ");
    stripped
        .split_whitespace()
        .filter(|token| token.chars().any(|c| c.is_alphanumeric()))
        .count() as u32
}

/// All in-text citations in order of appearance.
pub fn citations(text: &str) -> Vec<&str> {
    CITATION_REGEX.find_iter(text).map(|m| m.as_str()).collect()
}

pub fn has_citation(text: &str) -> bool {
    CITATION_REGEX.is_match(text)
}

/// Blank-line separated paragraphs, skipping markdown headings.
pub fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.starts_with('#'))
        .collect()
}

/// Split a paragraph into sentences.
///
/// A sentence ends at `.`, `!` or `?` outside parentheses, followed by
/// whitespace and an uppercase letter, quote or opening parenthesis.
pub fn sentences(paragraph: &str) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for (i, &c) in chars.iter().enumerate() {
        current.push(c);
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '.' | '!' | '?' if depth == 0 => {
                let next = chars.get(i + 1);
                let after = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                let boundary = next.is_some_and(|n| n.is_whitespace())
                    && after.is_some_and(|a| a.is_uppercase() || *a == '"' || *a == '(');
                if boundary {
                    let sentence = current.trim().to_string();
                    if !sentence.is_empty() {
                        out.push(sentence);
                    }
                    current.clear();
                }
            }
            _ => {}
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Insert each citation into a middle sentence of a body paragraph.
///
/// Citations are spread round-robin over body paragraphs that have at least
/// three sentences, so neither the first nor the last sentence of a paragraph
/// ever receives one. Returns the new text and how many were placed.
pub fn insert_citations(draft: &str, cites: &[String]) -> (String, usize) {
    if cites.is_empty() {
        return (draft.to_string(), 0);
    }
    let mut blocks: Vec<String> = draft.split("\n\n").map(str::to_string).collect();
    let content: Vec<usize> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| {
            let t = b.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .map(|(i, _)| i)
        .collect();
    if content.len() < 3 {
        return (draft.to_string(), 0);
    }

    let mut body: Vec<(usize, Vec<String>)> = content[1..content.len() - 1]
        .iter()
        .map(|&i| (i, sentences(blocks[i].trim())))
        .filter(|(_, sents)| sents.len() >= 3)
        .collect();
    if body.is_empty() {
        return (draft.to_string(), 0);
    }

    let slots = body.len();
    for (n, cite) in cites.iter().enumerate() {
        let sents = &mut body[n % slots].1;
        let middle = sents.len() / 2;
        let sentence = &mut sents[middle];
        match sentence.pop() {
            Some(p @ ('.' | '!' | '?')) => {
                sentence.push(' ');
                sentence.push_str(cite);
                sentence.push(p);
            }
            Some(other) => {
                sentence.push(other);
                sentence.push(' ');
                sentence.push_str(cite);
            }
            None => sentence.push_str(cite),
        }
    }

    for (index, sents) in body {
        blocks[index] = sents.join(" ");
    }
    (blocks.join("\n\n"), cites.len())
}

/// Remove a surrounding markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    match FENCE_REGEX.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text.trim(),
    }
}

/// Whether model output looks like prose rather than a fenced block or JSON.
pub fn is_prose(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty()
        && !trimmed.starts_with("```")
        && !trimmed.starts_with('{')
        && !trimmed.starts_with('[')
        && count_words(trimmed) > 0
}

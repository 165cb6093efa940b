//! Token-level lexical similarity used by token-triggered intents.
//!
//! Similarity is the Ratcliff/Obershelp ratio `2 * M / T` over characters. `M` counts the
//! characters in matching blocks: the longest common substring, then recursively the longest
//! ones left and right of it. `T` is the combined length of both tokens. Both sides are
//! lower-cased before comparison.

use std::collections::HashMap;

/// Second-side lengths from which very frequent characters stop seeding matches.
const POPULAR_MIN_LEN: usize = 200;

/// Similarity ratio in `[0, 1]` between two tokens, `1.0` meaning identical (ignoring case).
pub fn similarity_ratio(left: &str, right: &str) -> f32 {
    let left: Vec<char> = left.to_lowercase().chars().collect();
    let right: Vec<char> = right.to_lowercase().chars().collect();
    let total = left.len() + right.len();
    if total == 0 {
        return 1.0;
    }
    (2 * matching_characters(&left, &right)) as f32 / total as f32
}

/// Sum of the matching block sizes between `a` and `b`.
fn matching_characters(a: &[char], b: &[char]) -> usize {
    let positions = char_positions(b);
    let mut pending = vec![(0, a.len(), 0, b.len())];
    let mut matched = 0;

    while let Some((a_lo, a_hi, b_lo, b_hi)) = pending.pop() {
        let block = longest_block(a, b, &positions, (a_lo, a_hi), (b_lo, b_hi));
        if block.size == 0 {
            continue;
        }
        matched += block.size;
        if a_lo < block.a && b_lo < block.b {
            pending.push((a_lo, block.a, b_lo, block.b));
        }
        if block.a + block.size < a_hi && block.b + block.size < b_hi {
            pending.push((block.a + block.size, a_hi, block.b + block.size, b_hi));
        }
    }

    matched
}

/// Ascending positions of every character of `b`, minus the popular ones on long inputs.
fn char_positions(b: &[char]) -> HashMap<char, Vec<usize>> {
    let mut positions: HashMap<char, Vec<usize>> = HashMap::new();
    for (index, ch) in b.iter().enumerate() {
        positions.entry(*ch).or_default().push(index);
    }
    if b.len() >= POPULAR_MIN_LEN {
        let limit = b.len() / 100 + 1;
        positions.retain(|_, seen| seen.len() <= limit);
    }
    positions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    a: usize,
    b: usize,
    size: usize,
}

/// Longest common run inside the two windows. Ties go to the run that starts earliest in `a`,
/// then earliest in `b`.
fn longest_block(
    a: &[char],
    b: &[char],
    positions: &HashMap<char, Vec<usize>>,
    (a_lo, a_hi): (usize, usize),
    (b_lo, b_hi): (usize, usize),
) -> Block {
    let mut best = Block { a: a_lo, b: b_lo, size: 0 };
    let mut run_ending_at: HashMap<usize, usize> = HashMap::new();

    for (i, ch) in a.iter().enumerate().take(a_hi).skip(a_lo) {
        let mut next = HashMap::new();
        for &j in positions.get(ch).map(Vec::as_slice).unwrap_or_default() {
            if j < b_lo {
                continue;
            }
            if j >= b_hi {
                break;
            }
            let run = j
                .checked_sub(1)
                .and_then(|previous| run_ending_at.get(&previous))
                .copied()
                .unwrap_or(0)
                + 1;
            next.insert(j, run);
            if run > best.size {
                best = Block { a: i + 1 - run, b: j + 1 - run, size: run };
            }
        }
        run_ending_at = next;
    }

    // Popular characters never seed a run, so grow the winner over them.
    while best.a > a_lo && best.b > b_lo && a[best.a - 1] == b[best.b - 1] {
        best = Block { a: best.a - 1, b: best.b - 1, size: best.size + 1 };
    }
    while best.a + best.size < a_hi
        && best.b + best.size < b_hi
        && a[best.a + best.size] == b[best.b + best.size]
    {
        best.size += 1;
    }

    best
}

/// Returns true as soon as any `(standard, candidate)` pair reaches `min_ratio`.
pub fn words_match<S, C>(standard: &[S], candidates: &[C], min_ratio: f32) -> bool
where
    S: AsRef<str>,
    C: AsRef<str>,
{
    if candidates.is_empty() {
        return false;
    }

    standard.iter().any(|standard| {
        candidates
            .iter()
            .any(|candidate| similarity_ratio(standard.as_ref(), candidate.as_ref()) >= min_ratio)
    })
}

/// Splits an utterance into word-like runs (letters, digits and `_`), dropping everything else.
pub fn tokenize(text: &str) -> Vec<&str> {
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .filter(|token| !token.is_empty())
        .collect()
}

/// Trims the utterance and collapses every run of two or more whitespace characters into a
/// single space. A lone whitespace character is kept as is.
pub fn normalize_whitespace(text: &str) -> String {
    let trimmed = text.trim();
    let mut output = String::with_capacity(trimmed.len());
    let mut pending = String::new();

    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            pending.push(ch);
            continue;
        }
        flush_whitespace(&mut output, &mut pending);
        output.push(ch);
    }
    flush_whitespace(&mut output, &mut pending);

    output
}

fn flush_whitespace(output: &mut String, pending: &mut String) {
    match pending.chars().count() {
        0 => {}
        1 => output.push_str(pending),
        _ => output.push(' '),
    }
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::{normalize_whitespace, similarity_ratio, tokenize, words_match};

    #[test]
    fn identical_tokens_match_regardless_of_case() {
        assert_eq!(similarity_ratio("Hello", "hELLO"), 1.0);
        assert!(words_match(&["hello"], &["Hello", "there"], 1.0));
    }

    #[test]
    fn close_tokens_clear_threshold_and_distant_ones_do_not() {
        let ratio = similarity_ratio("регистраци", "регистрация");
        assert!(ratio > 0.9, "prefix stem should be close, got {ratio}");

        assert!(words_match(&["регистраци"], &["регистрацию"], 0.6));
        assert!(!words_match(&["когда"], &["погода", "завтра"], 0.8));
    }

    #[test]
    fn ratio_counts_matching_blocks_not_the_longest_subsequence() {
        assert_eq!(similarity_ratio("caa", "ababc"), 0.25);
        assert_eq!(similarity_ratio("abcd", "bcde"), 0.75);

        let typo = similarity_ratio("привет", "пиерт");
        assert!((typo - 6.0 / 11.0).abs() < 1e-6, "got {typo}");
        assert!(!words_match(&["привет"], &["пиерт"], 0.7));
    }

    #[test]
    fn blocks_recurse_on_both_sides_of_the_longest_run() {
        // "abyyy" first, then "cd" to its right
        assert_eq!(similarity_ratio("abyyycd", "xabyyyzcd"), 0.875);
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abc", ""), 0.0);
    }

    #[test]
    fn popular_characters_still_extend_a_block() {
        let long = "a".repeat(250);
        let ratio = similarity_ratio(&format!("b{long}"), &format!("b{long}c"));
        assert!(ratio > 0.99, "got {ratio}");
    }

    #[test]
    fn empty_candidates_never_match() {
        let none: [&str; 0] = [];
        assert!(!words_match(&["hello"], &none, 0.0));
    }

    #[test]
    fn tokenize_keeps_alphanumeric_runs_only() {
        assert_eq!(tokenize("Привет, бот! Когда meetup_73?"), vec![
            "Привет",
            "бот",
            "Когда",
            "meetup_73"
        ]);
        assert!(tokenize("?!  ...").is_empty());
    }

    #[test]
    fn normalize_collapses_long_whitespace_runs() {
        assert_eq!(normalize_whitespace("  добрый    день \t\t там "), "добрый день там");
        assert_eq!(normalize_whitespace("a\nb"), "a\nb");
    }
}

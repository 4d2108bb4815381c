// Text normalization - folds adversarial spellings into one comparable form.
//
// Every detector and threshold comparison works on the output of `normalize`.
// The function is pure and total: there is no error path, so the hot path
// never has to fall back to the raw text.

use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Longest run of one repeated character kept after normalization.
const MAX_RUN: usize = 2;

/// Digits folded back to the letters they stand for ("leet speak").
fn substitute_digit(c: char) -> char {
    match c {
        '0' => 'o',
        '1' => 'i',
        '3' => 'e',
        '4' => 'a',
        '5' => 's',
        '7' => 't',
        '8' => 'b',
        '9' => 'g',
        other => other,
    }
}

/// Symbols that double as letters inside a word (`b!tch`, `$uck`) but are
/// plain punctuation at the end of one (`kys!`).
fn cipher_symbol(c: char) -> Option<char> {
    match c {
        '!' | '¡' => Some('i'),
        '€' => Some('e'),
        '@' => Some('a'),
        '$' => Some('s'),
        '+' => Some('t'),
        '|' => Some('l'),
        _ => None,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether a run of cipher symbols at `chars[start..end]` spells letters.
///
/// A run folds when a word character follows it, or when it is a whole token
/// of two or more non-`!` symbols (`@$$`). Anything else is punctuation.
fn run_is_cipher(chars: &[char], start: usize, end: usize) -> bool {
    if chars.get(end).is_some_and(|c| is_word_char(*c)) {
        return true;
    }
    let token_start = start == 0 || chars[start - 1].is_whitespace();
    let token_end = chars.get(end).map_or(true, |c| c.is_whitespace());
    token_start
        && token_end
        && end - start >= 2
        && !chars[start..end].iter().any(|c| matches!(c, '!' | '¡'))
}

/// Canonicalize `text`:
/// - compatibility-decompose and drop diacritics (`é` -> `e`, fullwidth -> ASCII)
/// - lower-case
/// - map cipher digits, and cipher symbols inside words, to letters
/// - turn every other non-word character into a space
/// - collapse runs of 3+ identical characters to 2
/// - collapse whitespace and trim
///
/// `normalize(normalize(x)) == normalize(x)` for every input.
pub fn normalize(text: &str) -> String {
    let chars: Vec<char> = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| !is_combining_mark(*c))
        .collect();

    let mut folded = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if cipher_symbol(chars[i]).is_some() {
            let start = i;
            while i < chars.len() && cipher_symbol(chars[i]).is_some() {
                i += 1;
            }
            let spells = run_is_cipher(&chars, start, i);
            for &symbol in &chars[start..i] {
                match cipher_symbol(symbol) {
                    Some(letter) if spells => folded.push(letter),
                    _ => folded.push(' '),
                }
            }
            continue;
        }

        let mapped = substitute_digit(chars[i]);
        if is_word_char(mapped) {
            folded.push(mapped);
        } else {
            folded.push(' ');
        }
        i += 1;
    }

    let mut out = String::with_capacity(folded.len());
    for word in folded.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        push_collapsed(&mut out, word);
    }
    out
}

fn push_collapsed(out: &mut String, word: &str) {
    let mut prev: Option<char> = None;
    let mut run = 0usize;
    for c in word.chars() {
        if prev == Some(c) {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if run <= MAX_RUN {
            out.push(c);
        }
    }
}

/// Number of words in the normalized form of `text`.
pub fn normalized_word_count(text: &str) -> usize {
    normalize(text).split_whitespace().count()
}

/// Jaccard overlap of the normalized words (longer than 2 chars) of two texts.
pub fn similarity(a: &str, b: &str) -> f64 {
    fn words(text: &str) -> HashSet<String> {
        normalize(text)
            .split_whitespace()
            .filter(|w| w.chars().count() > 2)
            .map(str::to_string)
            .collect()
    }

    let left = words(a);
    let right = words(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

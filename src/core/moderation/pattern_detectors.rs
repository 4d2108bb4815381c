// Local pattern detectors - fast, stateless checks run before any scoring.
//
// Built-in term lists are compiled once into `Regex` values. A `Regex` keeps
// no match cursor between calls, so the same instance can serve concurrent
// checks. Guild-configured word lists are compiled per check.

use super::text_normalizer::normalize;
use once_cell::sync::Lazy;
use regex::Regex;

/* =========================================
   Built-in term lists
   ========================================= */

// Patterns run against normalized text: lower-case, no punctuation, runs of
// one character capped at two.
const PROFANITY_PATTERNS: &[&str] = &[
    r"\bf+u+c+k+(?:ing|in|er|ers|ed|s)?\b",
    r"\bmotherf+u+c+k+(?:er|ers|ing)?\b",
    r"\bsh+i+t+(?:ty|s|head)?\b",
    r"\bbi+t+ch(?:es|y)?\b",
    r"\bass+holes?\b",
    r"\bcunts?\b",
    r"\bdickheads?\b",
    r"\bwhores?\b",
    r"\bsluts?\b",
    r"\bbastards?\b",
];

const THREAT_PATTERNS: &[&str] = &[
    r"\b(?:i ?ll|i will|im going to|i m going to|im gonna|i m gonna|gonna) (?:kill|murder|shoot|stab|hurt|strangle) (?:you|u|ya)\b",
    r"\bkill (?:yourself|urself|your self|yoself)\b",
    r"\bkys\b",
    r"\b(?:you re|youre|you are|ur) (?:dead|going to die|gonna die)\b",
    r"\bi know where (?:you|u) live\b",
    r"\b(?:hope|wish) (?:you|u) (?:die|get killed)\b",
    r"\bwatch your back\b",
];

const EXPLICIT_PATTERNS: &[&str] = &[
    r"\bporn\w*\b",
    r"\bsend (?:me )?nudes?\b",
    r"\bnudes\b",
    r"\bhentai\b",
    r"\bonlyfans\b",
    r"\bnsfw\b",
    r"\bdick pics?\b",
    r"\bsexting\b",
];

/// Markers that turn an otherwise-matching threat into a likely false positive.
const SAFE_CONTEXT_INDICATORS: &[&str] = &[
    "in game",
    "in the game",
    "video game",
    "in minecraft",
    "in fortnite",
    "in valorant",
    "gg",
    "respawn",
    "in the movie",
    "the movie",
    "the show",
    "episode",
    "the news",
    "news article",
    "lyrics",
    "the song",
    "quote from",
];

/// Words that are violent on their own but common in harmless topics.
const CONTEXT_REQUIRED_WORDS: &[&str] = &[
    "kill", "killed", "killing", "shoot", "shot", "die", "died", "dead", "attack", "destroy",
    "murder", "bomb", "fight", "stab",
];

/// Topic words that make the ambiguous words above harmless.
const TOPIC_MARKERS: &[&str] = &[
    "game", "gaming", "match", "round", "boss", "level", "raid", "pvp", "lobby", "character",
    "movie", "film", "series", "book", "novel", "song", "news", "headline", "documentary",
    "history",
];

/// Single tokens counted when judging whether fragments form a toxic message.
const TOXIC_INDICATORS: &[&str] = &[
    "kill", "die", "hate", "stupid", "idiot", "dumb", "ugly", "loser", "trash", "worthless",
    "suck", "retard", "moron", "pathetic", "disgusting", "shut up",
];

/// Phrases that are toxic on their own wherever they appear.
const STRONG_TOXIC_PHRASES: &[&str] = &[
    "kys",
    "kill yourself",
    "kill urself",
    "i hate you",
    "you suck",
    "go die",
    "neck yourself",
];

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(pattern = %p, error = %e, "Built-in pattern failed to compile");
                None
            }
        })
        .collect()
}

fn compile_terms(terms: &[&'static str]) -> Vec<(&'static str, Regex)> {
    terms
        .iter()
        .filter_map(|t| phrase_regex(t).map(|re| (*t, re)))
        .collect()
}

static RE_PROFANITY: Lazy<Vec<Regex>> = Lazy::new(|| compile_all(PROFANITY_PATTERNS));
static RE_THREAT: Lazy<Vec<Regex>> = Lazy::new(|| compile_all(THREAT_PATTERNS));
static RE_EXPLICIT: Lazy<Vec<Regex>> = Lazy::new(|| compile_all(EXPLICIT_PATTERNS));
static RE_SAFE_CONTEXT: Lazy<Vec<(&'static str, Regex)>> =
    Lazy::new(|| compile_terms(SAFE_CONTEXT_INDICATORS));
static RE_CONTEXT_REQUIRED: Lazy<Vec<(&'static str, Regex)>> =
    Lazy::new(|| compile_terms(CONTEXT_REQUIRED_WORDS));
static RE_TOPIC: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| compile_terms(TOPIC_MARKERS));
static RE_TOXIC: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| compile_terms(TOXIC_INDICATORS));
static RE_STRONG_TOXIC: Lazy<Vec<(&'static str, Regex)>> =
    Lazy::new(|| compile_terms(STRONG_TOXIC_PHRASES));

/// Word-boundary matcher for a normalized phrase. `None` for empty phrases.
fn phrase_regex(phrase: &str) -> Option<Regex> {
    let phrase = phrase.trim();
    if phrase.is_empty() {
        return None;
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(phrase))).ok()
}

fn matching_terms<'a>(normalized: &str, terms: &'a [(&'static str, Regex)]) -> Vec<&'a str> {
    terms
        .iter()
        .filter(|(_, re)| re.is_match(normalized))
        .map(|(term, _)| *term)
        .collect()
}

/* =========================================
   Results
   ========================================= */

/// Result of a list/pattern check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternMatch {
    pub found: bool,
    pub matches: Vec<String>,
}

impl PatternMatch {
    fn from_matches(mut matches: Vec<String>) -> Self {
        matches.sort();
        matches.dedup();
        Self {
            found: !matches.is_empty(),
            matches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatConfidence {
    None,
    High,
    /// A safe-context indicator short-circuited the check.
    SafeContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreatCheck {
    pub is_threat: bool,
    pub confidence: ThreatConfidence,
    pub patterns: Vec<String>,
}

/* =========================================
   Guild word lists
   ========================================= */

/// Guild blacklist check over normalized text. Reports the configured words
/// (as written by the guild) that matched.
pub fn check_blacklist(normalized: &str, words: &[String]) -> PatternMatch {
    let matches = words
        .iter()
        .filter(|word| {
            phrase_regex(&normalize(word)).is_some_and(|re| re.is_match(normalized))
        })
        .cloned()
        .collect();
    PatternMatch::from_matches(matches)
}

/// Whether any guild-whitelisted word or phrase occurs in the normalized text.
pub fn contains_whitelisted(normalized: &str, words: &[String]) -> bool {
    words
        .iter()
        .any(|word| phrase_regex(&normalize(word)).is_some_and(|re| re.is_match(normalized)))
}

/* =========================================
   Built-in detectors
   ========================================= */

pub struct ProfanityDetector;

impl ProfanityDetector {
    pub fn check(normalized: &str) -> PatternMatch {
        let matches = RE_PROFANITY
            .iter()
            .flat_map(|re| re.find_iter(normalized).map(|m| m.as_str().to_string()))
            .collect();
        PatternMatch::from_matches(matches)
    }
}

pub struct ThreatDetector;

impl ThreatDetector {
    /// Whether a safe-context indicator appears in the (raw) text.
    pub fn has_safe_context(text: &str) -> bool {
        let normalized = normalize(text);
        !matching_terms(&normalized, &RE_SAFE_CONTEXT).is_empty()
    }

    /// Threat check over raw text. Safe context is tested first and wins over
    /// any pattern match.
    pub fn check(text: &str) -> ThreatCheck {
        if Self::has_safe_context(text) {
            tracing::debug!("Safe context detected, skipping threat patterns");
            return ThreatCheck {
                is_threat: false,
                confidence: ThreatConfidence::SafeContext,
                patterns: Vec::new(),
            };
        }

        let normalized = normalize(text);
        let patterns: Vec<String> = RE_THREAT
            .iter()
            .filter(|re| re.is_match(&normalized))
            .map(|re| re.as_str().to_string())
            .collect();

        ThreatCheck {
            is_threat: !patterns.is_empty(),
            confidence: if patterns.is_empty() {
                ThreatConfidence::None
            } else {
                ThreatConfidence::High
            },
            patterns,
        }
    }
}

pub struct ExplicitContentDetector;

impl ExplicitContentDetector {
    pub fn check(normalized: &str) -> PatternMatch {
        let matches = RE_EXPLICIT
            .iter()
            .filter_map(|re| re.find(normalized).map(|m| m.as_str().to_string()))
            .collect();
        PatternMatch::from_matches(matches)
    }
}

/* =========================================
   Context helpers
   ========================================= */

/// Whether the text uses a word whose meaning depends on topic.
pub fn requires_context_analysis(normalized: &str) -> bool {
    !matching_terms(normalized, &RE_CONTEXT_REQUIRED).is_empty()
}

/// Topic markers (gaming, media, news) present in the text.
pub fn topic_markers(normalized: &str) -> Vec<String> {
    matching_terms(normalized, &RE_TOPIC)
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Number of distinct toxic indicator tokens in the text.
pub fn toxic_indicator_count(normalized: &str) -> usize {
    matching_terms(normalized, &RE_TOXIC).len()
}

pub fn has_strong_toxic_phrase(normalized: &str) -> bool {
    !matching_terms(normalized, &RE_STRONG_TOXIC).is_empty()
}

/// Fragments joined into `normalized` read as one toxic message.
pub fn has_toxic_coherence(normalized: &str) -> bool {
    toxic_indicator_count(normalized) >= 2 || has_strong_toxic_phrase(normalized)
}

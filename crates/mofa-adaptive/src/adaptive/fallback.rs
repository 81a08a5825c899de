//! Algorithmic fallbacks.
//!
//! One pure function per capability. These never need a model, never touch
//! the cache and run on any tier. They are what `FeatureManager` returns when
//! the AI path is unavailable, and the primary path for `keywords` and
//! `stats`.
//!
//! Every function tolerates empty input and returns a well-formed result.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use super::types::{AnalysisContext, Capability};

const DEFAULT_TOP_K: usize = 10;
const WORDS_PER_MINUTE: f64 = 200.0;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "need", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "under", "over",
    "again", "further", "then", "once", "here", "there", "when", "where", "why", "how", "all",
    "each", "few", "more", "most", "other", "some", "such", "no", "nor", "not", "only", "own",
    "same", "so", "than", "too", "very", "just", "and", "but", "if", "or", "because", "until",
    "while", "about", "against", "this", "that", "these", "those", "what", "which", "who",
    "whom", "i", "me", "my", "myself", "we", "our", "you", "your", "he", "him", "his", "she",
    "her", "it", "its", "they", "them", "their", "am", "im", "ive", "really", "also", "got",
    "get", "today", "yesterday", "day",
];

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "nothing", "neither", "nor", "cannot", "can't", "don't",
    "didn't", "doesn't", "isn't", "wasn't", "aren't", "weren't", "won't", "wouldn't",
    "couldn't", "shouldn't", "hardly",
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "happy", "joy", "love", "loved", "excellent", "wonderful", "amazing",
    "calm", "grateful", "thankful", "proud", "excited", "peaceful", "hopeful", "glad",
    "fantastic", "enjoyed", "enjoy", "fun", "better", "best", "beautiful", "relaxed",
    "productive", "success", "successful", "kind", "nice", "delighted", "optimistic",
    "accomplished", "inspired", "confident", "content",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "sad", "angry", "hate", "hated", "terrible", "awful", "horrible", "stressed",
    "stress", "anxious", "anxiety", "worried", "tired", "exhausted", "lonely", "upset",
    "frustrated", "depressed", "worse", "worst", "hurt", "pain", "afraid", "scared", "fail",
    "failed", "failure", "overwhelmed", "disappointed", "miserable", "annoyed", "sick",
    "cry", "cried",
];

const EMOTION_LEXICON: &[(&str, &[&str])] = &[
    (
        "joy",
        &["happy", "joy", "glad", "delighted", "excited", "fun", "enjoyed", "laugh", "laughed", "cheerful"],
    ),
    (
        "sadness",
        &["sad", "lonely", "cry", "cried", "depressed", "miserable", "grief", "lost", "empty", "down"],
    ),
    (
        "anger",
        &["angry", "mad", "furious", "annoyed", "frustrated", "hate", "hated", "irritated", "rage"],
    ),
    (
        "fear",
        &["afraid", "scared", "anxious", "anxiety", "worried", "nervous", "panic", "fear", "terrified"],
    ),
    (
        "surprise",
        &["surprised", "shocked", "unexpected", "amazed", "astonished", "suddenly", "wow"],
    ),
    (
        "gratitude",
        &["grateful", "thankful", "thanks", "appreciate", "appreciated", "blessed", "love", "loved"],
    ),
];

const TOPIC_LEXICON: &[(&str, &[&str])] = &[
    (
        "work",
        &["work", "job", "office", "meeting", "project", "boss", "deadline", "career", "colleague", "client"],
    ),
    (
        "relationships",
        &["friend", "friends", "partner", "relationship", "date", "boyfriend", "girlfriend", "husband", "wife"],
    ),
    (
        "family",
        &["family", "mom", "dad", "mother", "father", "sister", "brother", "kids", "children", "parents"],
    ),
    (
        "health",
        &["health", "sleep", "exercise", "gym", "run", "doctor", "sick", "diet", "workout", "therapy"],
    ),
    (
        "finance",
        &["money", "budget", "rent", "salary", "bills", "savings", "debt", "spent", "pay", "invest"],
    ),
    (
        "learning",
        &["learn", "learned", "study", "class", "course", "book", "read", "reading", "school", "practice"],
    ),
    (
        "travel",
        &["travel", "trip", "flight", "vacation", "journey", "visit", "visited", "beach", "city", "hotel"],
    ),
    (
        "creativity",
        &["write", "writing", "paint", "music", "draw", "create", "design", "idea", "ideas", "art"],
    ),
];

// ============================================================================
// Tokenization
// ============================================================================

/// Lowercased word tokens. Apostrophes are kept so negations survive.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word) || word.len() < 3
}

fn sentences(text: &str) -> Vec<&str> {
    text.split(|c: char| matches!(c, '.' | '!' | '?'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Whether the token at `index` is preceded by a negation within two words.
fn negated(tokens: &[String], index: usize) -> bool {
    let start = index.saturating_sub(2);
    tokens[start..index]
        .iter()
        .any(|t| NEGATIONS.contains(&t.as_str()))
}

fn top_k(context: &AnalysisContext) -> usize {
    context
        .get("top_k")
        .and_then(Value::as_u64)
        .map(|k| k.clamp(1, 100) as usize)
        .unwrap_or(DEFAULT_TOP_K)
}

// ============================================================================
// Sentiment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentResult {
    pub label: String,
    /// In `[-1, 1]`.
    pub score: f64,
    pub positive_hits: usize,
    pub negative_hits: usize,
}

pub fn sentiment(text: &str) -> SentimentResult {
    let tokens = tokenize(text);
    let (mut positive, mut negative) = (0usize, 0usize);

    for (i, token) in tokens.iter().enumerate() {
        let polarity = if POSITIVE_WORDS.contains(&token.as_str()) {
            1
        } else if NEGATIVE_WORDS.contains(&token.as_str()) {
            -1
        } else {
            continue;
        };
        let polarity = if negated(&tokens, i) { -polarity } else { polarity };
        if polarity > 0 {
            positive += 1;
        } else {
            negative += 1;
        }
    }

    let total = positive + negative;
    let score = if total == 0 {
        0.0
    } else {
        (positive as f64 - negative as f64) / total as f64
    };
    let label = if score > 0.1 {
        "positive"
    } else if score < -0.1 {
        "negative"
    } else {
        "neutral"
    };

    SentimentResult {
        label: label.to_string(),
        score,
        positive_hits: positive,
        negative_hits: negative,
    }
}

// ============================================================================
// Emotion
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionResult {
    pub dominant: Option<String>,
    /// Share of emotion-bearing words per emotion, summing to 1 when any matched.
    pub scores: BTreeMap<String, f64>,
}

pub fn emotion(text: &str) -> EmotionResult {
    let tokens = tokenize(text);
    let mut counts: BTreeMap<String, usize> = EMOTION_LEXICON
        .iter()
        .map(|(emotion, _)| (emotion.to_string(), 0))
        .collect();

    for (i, token) in tokens.iter().enumerate() {
        if negated(&tokens, i) {
            continue;
        }
        for (emotion, words) in EMOTION_LEXICON {
            if words.contains(&token.as_str()) {
                *counts.entry(emotion.to_string()).or_default() += 1;
            }
        }
    }

    let total: usize = counts.values().sum();
    let dominant = counts
        .iter()
        .filter(|(_, c)| **c > 0)
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(e, _)| e.clone());
    let scores = counts
        .into_iter()
        .map(|(e, c)| {
            let share = if total == 0 { 0.0 } else { c as f64 / total as f64 };
            (e, share)
        })
        .collect();

    EmotionResult { dominant, scores }
}

// ============================================================================
// Topics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicScore {
    pub topic: String,
    pub score: f64,
    pub matched: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicsResult {
    pub topics: Vec<TopicScore>,
}

/// Lexicon topic matching. `candidate_labels` in the context restricts the
/// output to those labels; labels outside the lexicon match on their own name.
pub fn topics(text: &str, context: &AnalysisContext) -> TopicsResult {
    let tokens = tokenize(text);
    let words: HashSet<&str> = tokens.iter().map(String::as_str).collect();

    let candidates: Option<Vec<String>> = context
        .get("candidate_labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(Value::as_str)
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect()
        });

    let lexicon: Vec<(String, Vec<&str>)> = match candidates {
        Some(labels) => labels
            .into_iter()
            .map(|label| {
                let mut cues: Vec<&str> = TOPIC_LEXICON
                    .iter()
                    .find(|(topic, _)| *topic == label)
                    .map(|(_, cues)| cues.to_vec())
                    .unwrap_or_default();
                let own = tokenize(&label);
                let own: Vec<&str> = own
                    .iter()
                    .filter_map(|w| words.get(w.as_str()).copied())
                    .collect();
                cues.extend(own);
                (label, cues)
            })
            .collect(),
        None => TOPIC_LEXICON
            .iter()
            .map(|(topic, cues)| (topic.to_string(), cues.to_vec()))
            .collect(),
    };

    let mut scored: Vec<TopicScore> = lexicon
        .into_iter()
        .filter_map(|(topic, cues)| {
            let mut matched: Vec<String> = cues
                .iter()
                .filter(|cue| words.contains(*cue))
                .map(|cue| cue.to_string())
                .collect();
            matched.sort();
            matched.dedup();
            if matched.is_empty() {
                return None;
            }
            let score = (matched.len() as f64 / 3.0).min(1.0);
            Some(TopicScore {
                topic,
                score,
                matched,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.topic.cmp(&b.topic)));
    TopicsResult { topics: scored }
}

// ============================================================================
// Keywords
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordScore {
    pub term: String,
    pub count: usize,
    /// Term frequency relative to the most frequent keyword.
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordsResult {
    pub keywords: Vec<KeywordScore>,
}

/// Frequency-ranked content words. `top_k` in the context limits the output
/// (default 10).
pub fn keywords(text: &str, context: &AnalysisContext) -> KeywordsResult {
    let limit = top_k(context);
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();

    for (i, token) in tokenize(text).into_iter().enumerate() {
        if is_stop_word(&token) || token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        first_seen.entry(token.clone()).or_insert(i);
        *counts.entry(token).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    // Ties keep document order.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(first_seen[&a.0].cmp(&first_seen[&b.0])));
    ranked.truncate(limit);

    let max = ranked.first().map(|(_, c)| *c).unwrap_or(1) as f64;
    KeywordsResult {
        keywords: ranked
            .into_iter()
            .map(|(term, count)| KeywordScore {
                score: count as f64 / max,
                term,
                count,
            })
            .collect(),
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextStats {
    pub characters: usize,
    pub words: usize,
    pub unique_words: usize,
    pub sentences: usize,
    pub paragraphs: usize,
    pub avg_word_length: f64,
    pub avg_sentence_length: f64,
    pub lexical_diversity: f64,
    pub reading_time_secs: f64,
}

pub fn stats(text: &str) -> TextStats {
    let tokens = tokenize(text);
    let words = tokens.len();
    let unique_words = tokens.iter().collect::<HashSet<_>>().len();
    let sentence_count = sentences(text).len();
    let paragraphs = text
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .count();
    let letters: usize = tokens.iter().map(|t| t.chars().count()).sum();

    let ratio = |num: f64, den: usize| if den == 0 { 0.0 } else { num / den as f64 };

    TextStats {
        characters: text.chars().count(),
        words,
        unique_words,
        sentences: sentence_count,
        paragraphs,
        avg_word_length: ratio(letters as f64, words),
        avg_sentence_length: ratio(words as f64, sentence_count),
        lexical_diversity: ratio(unique_words as f64, words),
        reading_time_secs: words as f64 / WORDS_PER_MINUTE * 60.0,
    }
}

// ============================================================================
// Semantic
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticResult {
    /// Dominant content words, standing in for embedding-derived themes.
    pub themes: Vec<String>,
    /// The sentence sharing the most themes, if any.
    pub representative_sentence: Option<String>,
}

pub fn semantic(text: &str, context: &AnalysisContext) -> SemanticResult {
    let mut ctx = context.clone();
    ctx.entry("top_k").or_insert_with(|| Value::from(5u64));
    let themes: Vec<String> = keywords(text, &ctx)
        .keywords
        .into_iter()
        .map(|k| k.term)
        .collect();

    let representative_sentence = sentences(text)
        .into_iter()
        .map(|s| {
            let words: HashSet<String> = tokenize(s).into_iter().collect();
            let overlap = themes.iter().filter(|t| words.contains(*t)).count();
            (overlap, s)
        })
        .filter(|(overlap, _)| *overlap > 0)
        .max_by_key(|(overlap, _)| *overlap)
        .map(|(_, s)| s.to_string());

    SemanticResult {
        themes,
        representative_sentence,
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run the algorithmic implementation of `capability`.
pub fn run(
    capability: Capability,
    text: &str,
    context: &AnalysisContext,
) -> Result<Value, serde_json::Error> {
    match capability {
        Capability::Sentiment => serde_json::to_value(sentiment(text)),
        Capability::Emotion => serde_json::to_value(emotion(text)),
        Capability::Topics => serde_json::to_value(topics(text, context)),
        Capability::Semantic => serde_json::to_value(semantic(text, context)),
        Capability::Keywords => serde_json::to_value(keywords(text, context)),
        Capability::Stats => serde_json::to_value(stats(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> AnalysisContext {
        match value {
            Value::Object(map) => map,
            _ => AnalysisContext::new(),
        }
    }

    #[test]
    fn test_tokenize_keeps_negations() {
        assert_eq!(
            tokenize("I don't feel GREAT, honestly."),
            vec!["i", "don't", "feel", "great", "honestly"]
        );
    }

    #[test]
    fn test_sentiment_polarity_and_negation() {
        assert_eq!(sentiment("What a wonderful, happy day").label, "positive");
        assert_eq!(sentiment("I feel tired and stressed").label, "negative");
        assert_eq!(sentiment("I am not happy about this").label, "negative");
        assert_eq!(sentiment("").label, "neutral");
        assert_eq!(sentiment("").score, 0.0);
    }

    #[test]
    fn test_emotion_dominant() {
        let result = emotion("I was so anxious and worried before the exam, then happy");
        assert_eq!(result.dominant.as_deref(), Some("fear"));
        let total: f64 = result.scores.values().sum();
        assert!((total - 1.0).abs() < 1e-9);

        assert!(emotion("").dominant.is_none());
    }

    #[test]
    fn test_topics_builtin_and_candidates() {
        let text = "Long meeting with my boss about the project deadline, then gym";
        let result = topics(text, &AnalysisContext::new());
        assert_eq!(result.topics[0].topic, "work");
        assert!(result.topics.iter().any(|t| t.topic == "health"));

        let restricted = topics(text, &ctx(json!({"candidate_labels": ["health", "Project"]})));
        let names: Vec<&str> = restricted.topics.iter().map(|t| t.topic.as_str()).collect();
        assert!(names.contains(&"health"));
        assert!(names.contains(&"project"));
        assert!(!names.contains(&"work"));
    }

    #[test]
    fn test_keywords_rank_and_limit() {
        let text = "Rust rust RUST compiler compiler borrow checker and the lifetimes";
        let result = keywords(text, &ctx(json!({"top_k": 2})));
        assert_eq!(result.keywords.len(), 2);
        assert_eq!(result.keywords[0].term, "rust");
        assert_eq!(result.keywords[0].count, 3);
        assert_eq!(result.keywords[0].score, 1.0);
        assert_eq!(result.keywords[1].term, "compiler");

        let all = keywords(text, &AnalysisContext::new());
        assert!(!all.keywords.iter().any(|k| k.term == "the" || k.term == "and"));
    }

    #[test]
    fn test_stats() {
        let s = stats("One two three. Four five!\n\nSix?");
        assert_eq!(s.words, 6);
        assert_eq!(s.sentences, 3);
        assert_eq!(s.paragraphs, 2);
        assert_eq!(s.avg_sentence_length, 2.0);

        let empty = stats("");
        assert_eq!(empty.words, 0);
        assert_eq!(empty.avg_word_length, 0.0);
    }

    #[test]
    fn test_semantic_themes() {
        let text = "Garden tomatoes everywhere. The garden needs water. Tomatoes ripen in the garden.";
        let result = semantic(text, &AnalysisContext::new());
        assert_eq!(result.themes[0], "garden");
        assert!(result.representative_sentence.is_some());
    }

    #[test]
    fn test_run_dispatches_every_capability() {
        for capability in Capability::ALL {
            let value = run(capability, "A calm and productive morning.", &AnalysisContext::new())
                .unwrap();
            assert!(value.is_object(), "{} produced {}", capability, value);
        }
    }
}

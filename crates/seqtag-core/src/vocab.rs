//! # Vocabularies
//!
//! Word, character and tag index tables. They are built once (by the
//! trainer or loaded from a checkpoint), then shared immutably between the
//! embedder and the CRF layer. Tag indices are stable for the lifetime of a
//! model; START and STOP live just past the real tags.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqTagError};

/// Index of the padding entry in word and char vocabularies.
pub const PAD_ID: u32 = 0;
/// Index of the unknown entry in word and char vocabularies.
pub const UNK_ID: u32 = 1;

const PAD_TOKEN: &str = "<pad>";
const UNK_TOKEN: &str = "<unk>";

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d").expect("static regex"));

/// Normalize a word for lookup: lowercase, every digit mapped to `0`.
pub fn normalize_word(word: &str) -> String {
    DIGITS.replace_all(&word.to_lowercase(), "0").into_owned()
}

/// Structural role of a tag in the BIO scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind<'a> {
    /// `O`
    Outside,
    /// `B-X`
    Begin(&'a str),
    /// `I-X`
    Inside(&'a str),
    /// Synthetic sequence start.
    Start,
    /// Synthetic sequence end.
    Stop,
}

impl<'a> TagKind<'a> {
    fn parse(label: &'a str) -> Option<Self> {
        if label == TagVocab::OUTSIDE {
            return Some(TagKind::Outside);
        }
        match label.split_once('-') {
            Some(("B", ty)) if !ty.is_empty() => Some(TagKind::Begin(ty)),
            Some(("I", ty)) if !ty.is_empty() => Some(TagKind::Inside(ty)),
            _ => None,
        }
    }

    /// Entity type carried by a `B-`/`I-` tag.
    pub fn entity_type(&self) -> Option<&'a str> {
        match self {
            TagKind::Begin(ty) | TagKind::Inside(ty) => Some(ty),
            _ => None,
        }
    }
}

/// Ordered BIO tag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct TagVocab {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl TagVocab {
    /// Label of the outside tag.
    pub const OUTSIDE: &'static str = "O";

    /// Build the BIO tag set for the given entity types: `O`, then `B-X`, `I-X` per type.
    pub fn bio<S: AsRef<str>>(entity_types: &[S]) -> Result<Self> {
        let mut labels = vec![Self::OUTSIDE.to_string()];
        for ty in entity_types {
            let ty = ty.as_ref();
            labels.push(format!("B-{ty}"));
            labels.push(format!("I-{ty}"));
        }
        Self::from_labels(labels)
    }

    /// Build a tag set from explicit labels, keeping their order.
    pub fn from_labels(labels: Vec<String>) -> Result<Self> {
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if TagKind::parse(label).is_none() {
                return Err(SeqTagError::UnknownTag(format!(
                    "{label:?} is not an O/B-X/I-X label"
                )));
            }
            if index.insert(label.clone(), i).is_some() {
                return Err(SeqTagError::UnknownTag(format!("duplicate label {label:?}")));
            }
        }
        if labels.is_empty() {
            return Err(SeqTagError::InvalidConfig("tag set is empty".into()));
        }
        Ok(Self { labels, index })
    }

    /// Number of real tags (START/STOP excluded).
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Index of the START sentinel.
    pub fn start(&self) -> usize {
        self.labels.len()
    }

    /// Index of the STOP sentinel.
    pub fn stop(&self) -> usize {
        self.labels.len() + 1
    }

    /// Size of the transition state space, START and STOP included.
    pub fn num_states(&self) -> usize {
        self.labels.len() + 2
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn index(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }

    /// Map labels to indices, failing on the first unknown label.
    pub fn encode<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>> {
        labels
            .iter()
            .map(|l| {
                let l = l.as_ref();
                self.index(l)
                    .ok_or_else(|| SeqTagError::UnknownTag(l.to_string()))
            })
            .collect()
    }

    /// Map indices back to labels, failing on START/STOP or out-of-range indices.
    pub fn decode(&self, indices: &[usize]) -> Result<Vec<&str>> {
        indices
            .iter()
            .map(|&i| {
                self.label(i)
                    .ok_or_else(|| SeqTagError::UnknownTag(format!("index {i}")))
            })
            .collect()
    }

    /// Structural kind of a state index (START/STOP included).
    pub fn kind(&self, idx: usize) -> Option<TagKind<'_>> {
        if idx == self.start() {
            Some(TagKind::Start)
        } else if idx == self.stop() {
            Some(TagKind::Stop)
        } else {
            self.labels.get(idx).and_then(|l| TagKind::parse(l))
        }
    }

    /// Whether the transition `from -> to` is structurally possible.
    ///
    /// Nothing may enter START or leave STOP, and START may not jump straight
    /// to STOP. With `bio` set, the BIO scheme is enforced as well: an `I-X`
    /// must follow `B-X` or `I-X`.
    pub fn is_valid_transition(&self, from: usize, to: usize, bio: bool) -> bool {
        let (Some(from), Some(to)) = (self.kind(from), self.kind(to)) else {
            return false;
        };
        match (from, to) {
            (_, TagKind::Start) | (TagKind::Stop, _) => false,
            (TagKind::Start, TagKind::Stop) => false,
            (_, TagKind::Inside(ty)) if bio => matches!(
                from,
                TagKind::Begin(prev) | TagKind::Inside(prev) if prev == ty
            ),
            _ => true,
        }
    }
}

impl TryFrom<Vec<String>> for TagVocab {
    type Error = SeqTagError;

    fn try_from(labels: Vec<String>) -> Result<Self> {
        Self::from_labels(labels)
    }
}

impl From<TagVocab> for Vec<String> {
    fn from(vocab: TagVocab) -> Self {
        vocab.labels
    }
}

impl fmt::Display for TagVocab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagVocab[{}]", self.labels.join(", "))
    }
}

/// Frequency-ranked symbol table with `<pad>` = 0 and `<unk>` = 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SymbolVocab {
    symbols: Vec<String>,
    index: HashMap<String, u32>,
}

impl SymbolVocab {
    fn with_specials() -> Self {
        Self::from(vec![PAD_TOKEN.to_string(), UNK_TOKEN.to_string()])
    }

    /// Build from symbol occurrences, keeping those seen at least `min_freq` times.
    ///
    /// Symbols are ordered by descending frequency, ties broken lexicographically,
    /// so the same corpus always yields the same indices.
    pub fn build<I, S>(symbols: I, min_freq: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for s in symbols {
            *counts.entry(s.into()).or_default() += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(s, n)| *n >= min_freq && s != PAD_TOKEN && s != UNK_TOKEN)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut vocab = Self::with_specials();
        for (s, _) in ranked {
            vocab.push(s);
        }
        vocab
    }

    fn push(&mut self, symbol: String) {
        let id = self.symbols.len() as u32;
        self.index.insert(symbol.clone(), id);
        self.symbols.push(symbol);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Id of `symbol`, or [`UNK_ID`].
    pub fn id(&self, symbol: &str) -> u32 {
        self.index.get(symbol).copied().unwrap_or(UNK_ID)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.index.contains_key(symbol)
    }

    pub fn symbol(&self, id: u32) -> Option<&str> {
        self.symbols.get(id as usize).map(String::as_str)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

impl From<Vec<String>> for SymbolVocab {
    fn from(symbols: Vec<String>) -> Self {
        let index = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Self { symbols, index }
    }
}

impl From<SymbolVocab> for Vec<String> {
    fn from(vocab: SymbolVocab) -> Self {
        vocab.symbols
    }
}

/// The three tables a model is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub words: SymbolVocab,
    pub chars: SymbolVocab,
    pub tags: TagVocab,
}

impl Vocabulary {
    pub fn new(words: SymbolVocab, chars: SymbolVocab, tags: TagVocab) -> Self {
        Self { words, chars, tags }
    }

    /// Build word and char tables from raw sentences.
    ///
    /// Words are normalized with [`normalize_word`]; characters keep their case.
    pub fn build<S: AsRef<str>>(sentences: &[Vec<S>], tags: TagVocab, min_word_freq: usize) -> Self {
        let words = SymbolVocab::build(
            sentences
                .iter()
                .flatten()
                .map(|w| normalize_word(w.as_ref())),
            min_word_freq,
        );
        let chars = SymbolVocab::build(
            sentences
                .iter()
                .flatten()
                .flat_map(|w| w.as_ref().chars().map(String::from)),
            1,
        );
        Self { words, chars, tags }
    }

    /// Word id of a raw token.
    pub fn word_id(&self, word: &str) -> u32 {
        self.words.id(&normalize_word(word))
    }

    /// Character ids of a raw token.
    pub fn char_ids(&self, word: &str) -> Vec<u32> {
        let mut buf = [0u8; 4];
        word.chars()
            .map(|c| self.chars.id(c.encode_utf8(&mut buf)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_tags() -> TagVocab {
        TagVocab::bio(&["PER"]).unwrap()
    }

    #[test]
    fn test_bio_layout() {
        let tags = TagVocab::bio(&["LOC", "PER"]).unwrap();
        assert_eq!(tags.labels(), &["O", "B-LOC", "I-LOC", "B-PER", "I-PER"]);
        assert_eq!(tags.start(), 5);
        assert_eq!(tags.stop(), 6);
        assert_eq!(tags.num_states(), 7);
    }

    #[test]
    fn test_encode_decode() {
        let tags = per_tags();
        let ids = tags.encode(&["B-PER", "I-PER", "O"]).unwrap();
        assert_eq!(ids, vec![1, 2, 0]);
        assert_eq!(tags.decode(&ids).unwrap(), vec!["B-PER", "I-PER", "O"]);
        assert!(tags.encode(&["B-ORG"]).is_err());
        assert!(tags.decode(&[tags.start()]).is_err());
    }

    #[test]
    fn test_rejects_malformed_labels() {
        assert!(TagVocab::from_labels(vec!["O".into(), "PER".into()]).is_err());
        assert!(TagVocab::from_labels(vec!["O".into(), "O".into()]).is_err());
        assert!(TagVocab::from_labels(vec![]).is_err());
    }

    #[test]
    fn test_sentinel_transitions() {
        let tags = per_tags();
        let (start, stop) = (tags.start(), tags.stop());
        for t in 0..tags.num_states() {
            assert!(!tags.is_valid_transition(t, start, false));
            assert!(!tags.is_valid_transition(stop, t, false));
        }
        assert!(!tags.is_valid_transition(start, stop, false));
        assert!(tags.is_valid_transition(start, 0, false));
        assert!(tags.is_valid_transition(2, stop, false));
    }

    #[test]
    fn test_bio_transitions() {
        let tags = TagVocab::bio(&["LOC", "PER"]).unwrap();
        let o = tags.index("O").unwrap();
        let b_per = tags.index("B-PER").unwrap();
        let i_per = tags.index("I-PER").unwrap();
        let i_loc = tags.index("I-LOC").unwrap();

        assert!(tags.is_valid_transition(b_per, i_per, true));
        assert!(tags.is_valid_transition(i_per, i_per, true));
        assert!(!tags.is_valid_transition(o, i_per, true));
        assert!(!tags.is_valid_transition(b_per, i_loc, true));
        assert!(!tags.is_valid_transition(tags.start(), i_per, true));
        // unconstrained mode only forbids the sentinels
        assert!(tags.is_valid_transition(o, i_per, false));
    }

    #[test]
    fn test_tag_vocab_serde_roundtrip() {
        let tags = TagVocab::bio(&["MISC"]).unwrap();
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, r#"["O","B-MISC","I-MISC"]"#);
        let back: TagVocab = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tags);
        assert!(serde_json::from_str::<TagVocab>(r#"["O","X"]"#).is_err());
    }

    #[test]
    fn test_normalize_word() {
        assert_eq!(normalize_word("Paris"), "paris");
        assert_eq!(normalize_word("1984"), "0000");
        assert_eq!(normalize_word("F-16s"), "f-00s");
    }

    #[test]
    fn test_symbol_vocab_build() {
        let vocab = SymbolVocab::build(["b", "a", "b", "c", "a", "b"], 2);
        assert_eq!(vocab.symbols(), &["<pad>", "<unk>", "b", "a"]);
        assert_eq!(vocab.id("b"), 2);
        assert_eq!(vocab.id("c"), UNK_ID);
        assert_eq!(vocab.symbol(PAD_ID), Some("<pad>"));
    }

    #[test]
    fn test_vocabulary_build() {
        let sentences = vec![vec!["John", "lives", "in", "Paris"], vec!["Paris", "1999"]];
        let vocab = Vocabulary::build(&sentences, per_tags(), 1);
        assert_eq!(vocab.word_id("PARIS"), vocab.words.id("paris"));
        assert_eq!(vocab.word_id("2024"), vocab.words.id("0000"));
        assert_ne!(vocab.word_id("John"), UNK_ID);
        assert_eq!(vocab.word_id("Berlin"), UNK_ID);

        let ids = vocab.char_ids("Jo");
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|&id| id != UNK_ID && id != PAD_ID));
        assert_eq!(vocab.char_ids("Z"), vec![UNK_ID]);
    }
}

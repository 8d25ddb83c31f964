//! Data loading for CoNLL-style tagged corpora and pretrained word vectors.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, bail};
use candle_core::{Device, Tensor};
use seqtag_core::vocab::{PAD_ID, normalize_word};
use seqtag_core::{SymbolVocab, TagKind, TagVocab, Vocabulary};
use tracing::{info, warn};

/// Marker line separating documents in CoNLL-2003 files.
const DOCSTART: &str = "-DOCSTART-";

/// A single tagged sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub tokens: Vec<String>,
    pub tags: Vec<String>,
}

impl Example {
    pub fn new(tokens: Vec<String>, tags: Vec<String>) -> Self {
        Self { tokens, tags }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Borrowed token lists, the shape the tagger encodes.
pub(crate) fn token_lists<'a>(examples: impl IntoIterator<Item = &'a Example>) -> Vec<Vec<&'a str>> {
    examples
        .into_iter()
        .map(|e| e.tokens.iter().map(String::as_str).collect())
        .collect()
}

pub(crate) fn tag_lists<'a>(examples: impl IntoIterator<Item = &'a Example>) -> Vec<Vec<&'a str>> {
    examples
        .into_iter()
        .map(|e| e.tags.iter().map(String::as_str).collect())
        .collect()
}

/// Load a CoNLL file: token in the first column, tag in the last, blank
/// lines between sentences.
pub fn load_conll<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Example>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let examples = parse_conll(BufReader::new(file))
        .with_context(|| format!("reading {}", path.display()))?;
    info!(path = %path.display(), sentences = examples.len(), "loaded dataset");
    Ok(examples)
}

/// Parse CoNLL text from any reader.
pub fn parse_conll<R: BufRead>(reader: R) -> anyhow::Result<Vec<Example>> {
    let mut examples = Vec::new();
    let mut tokens = Vec::new();
    let mut tags = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() {
            if !tokens.is_empty() {
                examples.push(Example::new(
                    std::mem::take(&mut tokens),
                    std::mem::take(&mut tags),
                ));
            }
            continue;
        }
        if line.starts_with(DOCSTART) {
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        let (Some(token), Some(tag)) = (columns.first(), columns.last()) else {
            continue;
        };
        if columns.len() < 2 {
            bail!("line {}: expected a token and a tag, got {line:?}", line_no + 1);
        }
        tokens.push(token.to_string());
        tags.push(tag.to_string());
    }

    if !tokens.is_empty() {
        examples.push(Example::new(tokens, tags));
    }
    Ok(examples)
}

/// Entity types mentioned by `B-`/`I-` tags, sorted by name.
pub fn entity_types(examples: &[Example]) -> anyhow::Result<Vec<String>> {
    let mut types = BTreeSet::new();
    for tag in examples.iter().flat_map(|e| &e.tags) {
        if tag == TagVocab::OUTSIDE {
            continue;
        }
        match tag.split_once('-') {
            Some(("B" | "I", entity)) if !entity.is_empty() => {
                types.insert(entity.to_string());
            }
            _ => bail!("tag {tag:?} is not in BIO format"),
        }
    }
    Ok(types.into_iter().collect())
}

/// Build word, char and tag vocabularies from training data.
pub fn build_vocabulary(examples: &[Example], min_word_freq: usize) -> anyhow::Result<Vocabulary> {
    let tags = TagVocab::bio(&entity_types(examples)?)?;
    let vocab = Vocabulary::build(&token_lists(examples), tags, min_word_freq);
    info!(
        words = vocab.words.len(),
        chars = vocab.chars.len(),
        tags = vocab.tags.len(),
        "built vocabulary"
    );
    Ok(vocab)
}

/// Count tagged entities per type, for logging dataset composition.
pub fn entity_counts(examples: &[Example], tags: &TagVocab) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for tag in examples.iter().flat_map(|e| &e.tags) {
        let Some(TagKind::Begin(entity)) = tags.index(tag).and_then(|i| tags.kind(i)) else {
            continue;
        };
        match counts.iter_mut().find(|(name, _)| name.as_str() == entity) {
            Some((_, n)) => *n += 1,
            None => counts.push((entity.to_string(), 1)),
        }
    }
    counts.sort();
    counts
}

/// Load whitespace-separated word vectors (GloVe text format) for `words`.
///
/// Rows for words missing from the file get small deterministic random
/// values; the padding row is zero. Returns the `(words.len(), dim)` table.
pub fn load_pretrained<P: AsRef<Path>>(path: P, words: &SymbolVocab, seed: u64) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let (table, dim) = parse_pretrained(BufReader::new(file), words, seed)?;
    Ok(Tensor::from_vec(table, (words.len(), dim), &Device::Cpu)?)
}

/// word2vec text files open with a `count dim` line.
fn is_word2vec_header(line: &str) -> bool {
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields.len() == 2 && fields.iter().all(|f| f.parse::<usize>().is_ok())
}

fn parse_pretrained<R: BufRead>(reader: R, words: &SymbolVocab, seed: u64) -> anyhow::Result<(Vec<f32>, usize)> {
    let mut found: Vec<Option<Vec<f32>>> = vec![None; words.len()];
    let mut dim = None;
    let mut skipped = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line_no == 0 && is_word2vec_header(&line) {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else {
            continue;
        };
        let values: Vec<f32> = match parts.map(str::parse).collect() {
            Ok(values) => values,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        if values.is_empty() || values.len() != *dim.get_or_insert(values.len()) {
            skipped += 1;
            continue;
        }
        let word = normalize_word(word);
        if words.contains(&word) {
            let id = words.id(&word) as usize;
            // first occurrence wins
            if found[id].is_none() {
                found[id] = Some(values);
            }
        }
        if line_no > 0 && line_no % 500_000 == 0 {
            info!(lines = line_no, "reading pretrained vectors");
        }
    }

    let Some(dim) = dim else {
        bail!("no vectors found");
    };
    if skipped > 0 {
        warn!(skipped, "skipped malformed pretrained lines");
    }

    let hits = found.iter().filter(|v| v.is_some()).count();
    let coverage = hits as f32 / words.len().max(1) as f32;
    if coverage < 0.5 {
        warn!(hits, vocab = words.len(), "pretrained table covers under half of the vocabulary");
    } else {
        info!(hits, vocab = words.len(), dim, "matched pretrained vectors");
    }

    let scale = (3.0 / dim as f32).sqrt();
    let mut rng = oorandom::Rand32::new(seed);
    let mut table = Vec::with_capacity(words.len() * dim);
    for (id, vector) in found.into_iter().enumerate() {
        match vector {
            Some(v) => table.extend(v),
            None if id == PAD_ID as usize => table.extend(std::iter::repeat_n(0.0, dim)),
            None => table.extend((0..dim).map(|_| (rng.rand_float() * 2.0 - 1.0) * scale)),
        }
    }
    Ok((table, dim))
}

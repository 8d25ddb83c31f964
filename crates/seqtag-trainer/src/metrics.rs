//! Token accuracy and exact-match entity span scores.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use seqtag_core::SequenceTagger;
use serde::Serialize;
use tracing::debug;

use crate::data::{Example, token_lists};

/// A half-open token range `[start, end)` labelled with an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Span {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
}

/// Extract entity spans from a BIO tag sequence.
///
/// An `I-X` that does not continue an open `X` span starts a new one.
/// Anything that is not `B-`/`I-` closes the open span.
pub fn extract_spans<S: AsRef<str>>(tags: &[S]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<(&str, usize)> = None;

    for (i, tag) in tags.iter().enumerate() {
        let (prefix, entity) = match tag.as_ref().split_once('-') {
            Some((p @ ("B" | "I"), e)) if !e.is_empty() => (p, e),
            _ => ("O", ""),
        };
        let continues = prefix == "I" && matches!(open, Some((ty, _)) if ty == entity);
        if continues {
            continue;
        }
        if let Some((ty, start)) = open.take() {
            spans.push(Span {
                entity_type: ty.to_string(),
                start,
                end: i,
            });
        }
        if prefix != "O" {
            open = Some((entity, i));
        }
    }
    if let Some((ty, start)) = open {
        spans.push(Span {
            entity_type: ty.to_string(),
            start,
            end: tags.len(),
        });
    }
    spans
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpanCounts {
    pub true_positives: usize,
    pub predicted: usize,
    pub gold: usize,
}

impl SpanCounts {
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.predicted)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.gold)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Running evaluation totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub correct_tokens: usize,
    pub total_tokens: usize,
    pub spans: SpanCounts,
    pub per_type: BTreeMap<String, SpanCounts>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sentence. Tokens beyond the shorter sequence are counted wrong.
    pub fn update<G: AsRef<str>, P: AsRef<str>>(&mut self, gold: &[G], predicted: &[P]) {
        self.total_tokens += gold.len().max(predicted.len());
        self.correct_tokens += gold
            .iter()
            .zip(predicted)
            .filter(|(g, p)| g.as_ref() == p.as_ref())
            .count();

        let gold_spans: HashSet<Span> = extract_spans(gold).into_iter().collect();
        let predicted_spans: HashSet<Span> = extract_spans(predicted).into_iter().collect();

        for span in &gold_spans {
            self.spans.gold += 1;
            self.per_type.entry(span.entity_type.clone()).or_default().gold += 1;
        }
        for span in &predicted_spans {
            let hit = gold_spans.contains(span);
            let counts = self.per_type.entry(span.entity_type.clone()).or_default();
            counts.predicted += 1;
            self.spans.predicted += 1;
            if hit {
                counts.true_positives += 1;
                self.spans.true_positives += 1;
            }
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct_tokens, self.total_tokens)
    }

    pub fn precision(&self) -> f64 {
        self.spans.precision()
    }

    pub fn recall(&self) -> f64 {
        self.spans.recall()
    }

    pub fn f1(&self) -> f64 {
        self.spans.f1()
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "accuracy {:.4}  precision {:.4}  recall {:.4}  f1 {:.4}",
            self.accuracy(),
            self.precision(),
            self.recall(),
            self.f1()
        )?;
        for (ty, counts) in &self.per_type {
            writeln!(
                f,
                "  {ty:<10} precision {:.4}  recall {:.4}  f1 {:.4}  support {}",
                counts.precision(),
                counts.recall(),
                counts.f1(),
                counts.gold
            )?;
        }
        Ok(())
    }
}

/// Tag `examples` with `tagger` in batches and score against their gold tags.
pub fn evaluate(tagger: &SequenceTagger, examples: &[Example], batch_size: usize) -> anyhow::Result<Metrics> {
    let mut metrics = Metrics::new();
    for chunk in examples.chunks(batch_size.max(1)) {
        let predicted = tagger.predict(&token_lists(chunk))?;
        for (example, tags) in chunk.iter().zip(&predicted) {
            metrics.update(&example.tags, tags);
        }
        debug!(sentences = chunk.len(), "evaluated batch");
    }
    Ok(metrics)
}

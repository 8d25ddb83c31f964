//! # Contextual Embeddings
//!
//! Contextual vectors come from an external language model behind the
//! [`ContextualProvider`] trait. The provider sees raw token text one
//! sentence at a time and returns one vector per token; its parameters are
//! never trained here.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{info, warn};

use crate::error::{Result, SeqTagError};

/// Source of per-token contextual vectors.
pub trait ContextualProvider: Send + Sync {
    /// Width of each returned vector.
    fn dim(&self) -> usize;

    /// Embed one sentence, returning a `(tokens.len(), dim)` tensor.
    fn embed(&self, tokens: &[String], device: &Device) -> Result<Tensor>;
}

/// DistilBERT encoder that represents each word by its first word-piece.
pub struct DistilBertProvider {
    tokenizer: HfTokenizer,
    model: DistilBertModel,
    dim: usize,
    max_pieces: usize,
    device: Device,
}

impl DistilBertProvider {
    /// Load `config.json`, `tokenizer.json` and `model.safetensors` from `dir`.
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let tokenizer_path = dir.join("tokenizer.json");
        let tokenizer = HfTokenizer::from_file(&tokenizer_path).map_err(|e| {
            SeqTagError::ModelLoad(format!("{}: {e}", tokenizer_path.display()))
        })?;

        let config_str = std::fs::read_to_string(dir.join("config.json"))?;
        let config: DistilBertConfig = serde_json::from_str(&config_str)?;
        let raw: serde_json::Value = serde_json::from_str(&config_str)?;
        let dim = raw.get("dim").and_then(|v| v.as_u64()).unwrap_or(768) as usize;
        let max_pieces = raw
            .get("max_position_embeddings")
            .and_then(|v| v.as_u64())
            .unwrap_or(512) as usize;

        let weights = dir.join("model.safetensors");
        if !weights.exists() {
            return Err(SeqTagError::ModelLoad(format!(
                "weights not found at {}",
                weights.display()
            )));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        let model = DistilBertModel::load(vb.pp("distilbert"), &config)?;
        info!(dir = %dir.display(), dim, "loaded contextual encoder");

        Ok(Self {
            tokenizer,
            model,
            dim,
            max_pieces,
            device: device.clone(),
        })
    }
}

impl ContextualProvider for DistilBertProvider {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, tokens: &[String], device: &Device) -> Result<Tensor> {
        if tokens.is_empty() {
            return Ok(Tensor::zeros((0, self.dim), DType::F32, device)?);
        }
        let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let mut encoding = self
            .tokenizer
            .encode(words.as_slice(), true)
            .map_err(|e| SeqTagError::Contextual(e.to_string()))?;
        if encoding.len() > self.max_pieces {
            warn!(
                pieces = encoding.len(),
                max = self.max_pieces,
                "sentence truncated for the contextual encoder"
            );
            encoding.truncate(self.max_pieces, 0, tokenizers::TruncationDirection::Right);
        }

        let ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        // 1 marks a hidden position for this model; nothing is hidden
        let hidden_mask = Tensor::zeros((1, encoding.len()), DType::U8, &self.device)?;
        let hidden = self.model.forward(&ids, &hidden_mask)?.squeeze(0)?.detach();

        // first word-piece of each word; words that lost every piece stay zero
        let mut first_piece = vec![None; tokens.len()];
        for (piece, word) in encoding.get_word_ids().iter().enumerate() {
            if let Some(w) = word.map(|w| w as usize) {
                if w < tokens.len() && first_piece[w].is_none() {
                    first_piece[w] = Some(piece);
                }
            }
        }

        let zero = Tensor::zeros(self.dim, DType::F32, &self.device)?;
        let rows = first_piece
            .iter()
            .map(|piece| match piece {
                Some(p) => Ok(hidden.get(*p)?.to_dtype(DType::F32)?),
                None => Ok(zero.clone()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&rows, 0)?.to_device(device)?)
    }
}

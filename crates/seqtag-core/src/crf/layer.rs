//! Batched, differentiable CRF over candle tensors.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ILLEGAL_SCORE;
use super::lattice::{TransitionMatrix, allowed_transitions};
use super::viterbi::ViterbiDecoder;
use crate::error::{Result, SeqTagError};
use crate::mask::Mask;
use crate::vocab::TagVocab;

/// How per-sequence negative log-likelihoods are folded into a loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// One loss per sequence, shape `(batch,)`.
    None,
    /// `-Σ llh`.
    Sum,
    /// `-Σ llh / batch_size`.
    #[default]
    Mean,
}

impl Reduction {
    /// Fold per-sequence negative log-likelihoods `(batch,)`.
    pub fn apply(self, nll: Tensor) -> Result<Tensor> {
        let batch = nll.dim(0)?;
        Ok(match self {
            Reduction::None => nll,
            Reduction::Sum => nll.sum_all()?,
            Reduction::Mean => nll.sum_all()?.affine(1.0 / batch.max(1) as f64, 0.0)?,
        })
    }
}

/// `log Σ exp` along `dim`, shifted by the running maximum.
pub(crate) fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    Ok(sum.log()?.add(&max)?.squeeze(dim)?)
}

/// Linear-chain CRF with a learned `(T+2) × (T+2)` transition matrix.
pub struct CrfLayer {
    num_tags: usize,
    transitions: Tensor,
    allowed: Tensor,
    decoder: ViterbiDecoder,
}

impl CrfLayer {
    /// Create the layer, registering `transitions` under `vb`.
    ///
    /// With `constrain` set, BIO-illegal transitions are pinned along with
    /// the START/STOP sentinels.
    pub fn new(tags: &TagVocab, constrain: bool, vb: VarBuilder) -> Result<Self> {
        let n = tags.num_states();
        let transitions = vb.get_with_hints((n, n), "transitions", Init::Uniform { lo: -0.1, up: 0.1 })?;
        Self::from_tensor(tags, constrain, transitions)
    }

    /// Wrap an existing transition tensor.
    pub fn from_tensor(tags: &TagVocab, constrain: bool, transitions: Tensor) -> Result<Self> {
        let n = tags.num_states();
        if transitions.dims() != [n, n] {
            return Err(SeqTagError::ShapeMismatch(format!(
                "transitions for {} tags must be {n}x{n}, got {:?}",
                tags.len(),
                transitions.dims()
            )));
        }
        let allowed: Vec<u8> = allowed_transitions(tags, constrain)
            .into_iter()
            .map(u8::from)
            .collect();
        let allowed = Tensor::from_vec(allowed, (n, n), transitions.device())?;
        Ok(Self {
            num_tags: tags.len(),
            transitions,
            allowed,
            decoder: ViterbiDecoder::new(),
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    fn device(&self) -> &Device {
        self.transitions.device()
    }

    /// Effective transition scores with forbidden entries pinned.
    pub fn transitions(&self) -> Result<Tensor> {
        let illegal = Tensor::full(ILLEGAL_SCORE, self.transitions.dims(), self.device())?
            .to_dtype(self.transitions.dtype())?;
        Ok(self.allowed.where_cond(&self.transitions, &illegal)?)
    }

    /// Host copy of the effective transition scores.
    pub fn transition_matrix(&self) -> Result<TransitionMatrix> {
        let scores: Vec<f32> = self
            .transitions()?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        TransitionMatrix::from_scores(self.num_tags, scores)
    }

    fn check_emissions(&self, emissions: &Tensor, mask: &Mask) -> Result<(usize, usize)> {
        let (batch, len, tags) = emissions.dims3()?;
        if tags != self.num_tags {
            return Err(SeqTagError::ShapeMismatch(format!(
                "expected last dimension of emissions to be {}, got {tags}",
                self.num_tags
            )));
        }
        if (batch, len) != (mask.batch_size(), mask.max_len()) {
            return Err(SeqTagError::ShapeMismatch(format!(
                "emissions are {batch}x{len} but the mask is {}x{}",
                mask.batch_size(),
                mask.max_len()
            )));
        }
        Ok((batch, len))
    }

    /// Per-sequence `log P(gold | emissions)`, shape `(batch,)`.
    ///
    /// Empty sequences contribute exactly `0`.
    pub fn log_likelihood(&self, emissions: &Tensor, mask: &Mask, gold: &[Vec<usize>]) -> Result<Tensor> {
        let (batch, len) = self.check_emissions(emissions, mask)?;
        if gold.len() != batch {
            return Err(SeqTagError::ShapeMismatch(format!(
                "{} gold sequences for a batch of {batch}",
                gold.len()
            )));
        }
        for (row, tags) in gold.iter().enumerate() {
            if tags.len() != mask.len(row) {
                return Err(SeqTagError::LengthMismatch {
                    sentence: row,
                    expected: mask.len(row),
                    found: tags.len(),
                });
            }
            if let Some(&bad) = tags.iter().find(|&&t| t >= self.num_tags) {
                return Err(SeqTagError::UnknownTag(format!("index {bad}")));
            }
        }
        if len == 0 {
            return Ok(Tensor::zeros(batch, emissions.dtype(), emissions.device())?);
        }

        let numerator = self.gold_score(emissions, mask, gold)?;
        let denominator = self.log_partition(emissions, mask)?;
        let llh = numerator.sub(&denominator)?;

        let nonempty: Vec<u8> = mask.lengths().iter().map(|&l| u8::from(l > 0)).collect();
        let nonempty = Tensor::from_vec(nonempty, batch, emissions.device())?;
        let zeros = llh.zeros_like()?;
        debug!(batch, len, "crf log-likelihood");
        Ok(nonempty.where_cond(&llh, &zeros)?)
    }

    /// Negated log-likelihood folded by `reduction`.
    pub fn loss(
        &self,
        emissions: &Tensor,
        mask: &Mask,
        gold: &[Vec<usize>],
        reduction: Reduction,
    ) -> Result<Tensor> {
        reduction.apply(self.log_likelihood(emissions, mask, gold)?.neg()?)
    }

    /// Score of the gold path for every row, shape `(batch,)`.
    fn gold_score(&self, emissions: &Tensor, mask: &Mask, gold: &[Vec<usize>]) -> Result<Tensor> {
        let (batch, len) = (mask.batch_size(), mask.max_len());
        let device = emissions.device();
        let t = self.num_tags;
        let width = t + 2;
        let (start, stop) = (t, t + 1);

        // padded tags index the emission tensor; padding cells are masked out
        let mut padded = vec![0u32; batch * len];
        for (row, tags) in gold.iter().enumerate() {
            for (pos, &tag) in tags.iter().enumerate() {
                padded[row * len + pos] = tag as u32;
            }
        }
        let tag_ids = Tensor::from_vec(padded, (batch, len, 1), device)?;
        let mask_f = mask.to_tensor(emissions.dtype(), device)?;
        let emitted = emissions
            .contiguous()?
            .gather(&tag_ids, 2)?
            .squeeze(2)?
            .mul(&mask_f)?
            .sum(1)?;

        // START -> y0, y_{i-1} -> y_i, y_last -> STOP, one slot per boundary
        let slots = len + 1;
        let mut pair_idx = vec![0u32; batch * slots];
        let mut pair_on = vec![0f32; batch * slots];
        for (row, tags) in gold.iter().enumerate() {
            let Some(&last) = tags.last() else {
                continue;
            };
            let mut prev = start;
            for (pos, &tag) in tags.iter().enumerate() {
                pair_idx[row * slots + pos] = (prev * width + tag) as u32;
                pair_on[row * slots + pos] = 1.0;
                prev = tag;
            }
            pair_idx[row * slots + tags.len()] = (last * width + stop) as u32;
            pair_on[row * slots + tags.len()] = 1.0;
        }
        let pair_idx = Tensor::from_vec(pair_idx, batch * slots, device)?;
        let pair_on = Tensor::from_vec(pair_on, (batch, slots), device)?.to_dtype(emissions.dtype())?;
        let transitioned = self
            .transitions()?
            .flatten_all()?
            .index_select(&pair_idx, 0)?
            .reshape((batch, slots))?
            .mul(&pair_on)?
            .sum(1)?;

        Ok(emitted.add(&transitioned)?)
    }

    /// Forward algorithm, vectorized over the batch, shape `(batch,)`.
    ///
    /// A row stops updating once its true length is exhausted, so each row
    /// is closed with STOP at its own length.
    fn log_partition(&self, emissions: &Tensor, mask: &Mask) -> Result<Tensor> {
        let (batch, len) = (mask.batch_size(), mask.max_len());
        let t = self.num_tags;
        let trans = self.transitions()?;
        let tag_to_tag = trans.narrow(0, 0, t)?.narrow(1, 0, t)?;
        let from_start = trans.get(t)?.narrow(0, 0, t)?;
        let to_stop = trans.narrow(0, 0, t)?.narrow(1, t + 1, 1)?.squeeze(1)?;
        let keep = mask.to_tensor(DType::U8, emissions.device())?;

        let mut alpha = emissions.narrow(1, 0, 1)?.squeeze(1)?.broadcast_add(&from_start)?;
        for pos in 1..len {
            let emit = emissions.narrow(1, pos, 1)?;
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&tag_to_tag)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;
            let live = keep.narrow(1, pos, 1)?.broadcast_as((batch, t))?;
            alpha = live.where_cond(&next, &alpha)?;
        }
        log_sum_exp(&alpha.broadcast_add(&to_stop)?, 1)
    }

    /// Best tag path per row, each of exactly its true length.
    pub fn decode(&self, emissions: &Tensor, mask: &Mask) -> Result<Vec<Vec<usize>>> {
        let (_, len) = self.check_emissions(emissions, mask)?;
        let trans = self.transition_matrix()?;
        let rows = emissions_to_host(emissions, mask, len)?;
        self.decoder.decode_batch(&rows, &trans)
    }
}

/// Flatten each row's true-length prefix of a `(batch, len, tags)` tensor.
pub(crate) fn emissions_to_host(emissions: &Tensor, mask: &Mask, len: usize) -> Result<Vec<Vec<f32>>> {
    if len == 0 {
        return Ok(vec![Vec::new(); mask.batch_size()]);
    }
    let values: Vec<Vec<Vec<f32>>> = emissions.to_dtype(DType::F32)?.to_vec3()?;
    Ok(values
        .into_iter()
        .zip(mask.lengths())
        .map(|(rows, &l)| rows.into_iter().take(l).flatten().collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::lattice::tests::{pseudo_random, random_matrix};
    use crate::crf::lattice::{log_likelihood, log_partition};
    use candle_nn::VarMap;

    fn per_tags() -> TagVocab {
        TagVocab::bio(&["PER"]).unwrap()
    }

    fn layer_from(tags: &TagVocab, trans: &TransitionMatrix) -> CrfLayer {
        let n = tags.num_states();
        let t = Tensor::from_vec(trans.scores().to_vec(), (n, n), &Device::Cpu).unwrap();
        CrfLayer::from_tensor(tags, false, t).unwrap()
    }

    /// Pad per-row emissions into a `(batch, max_len, tags)` tensor filled with `pad`.
    fn pad_batch(rows: &[Vec<f32>], tags: usize, max_len: usize, pad: f32) -> Tensor {
        let mut data = Vec::new();
        for row in rows {
            data.extend_from_slice(row);
            data.extend(std::iter::repeat_n(pad, max_len * tags - row.len()));
        }
        Tensor::from_vec(data, (rows.len(), max_len, tags), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_log_sum_exp_tensor() {
        let xs = Tensor::new(&[[1000f32, 1000.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let lse: Vec<f32> = log_sum_exp(&xs, 1).unwrap().to_vec1().unwrap();
        assert!((lse[0] - (1000.0 + 2f32.ln())).abs() < 1e-3);
        assert!((lse[1] - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_matches_host_lattice() {
        let tags = per_tags();
        let trans = random_matrix(&tags, false, 21);
        let crf = layer_from(&tags, &trans);
        let lengths = [4usize, 2, 3];
        let rows: Vec<Vec<f32>> = lengths
            .iter()
            .enumerate()
            .map(|(i, &l)| pseudo_random(i as u64 + 30, l * tags.len()))
            .collect();
        let gold = vec![vec![1, 2, 0, 0], vec![0, 1], vec![1, 2, 2]];
        let mask = Mask::from_lengths(lengths.to_vec());
        let emissions = pad_batch(&rows, tags.len(), 4, 0.0);

        let llh: Vec<f32> = crf
            .log_likelihood(&emissions, &mask, &gold)
            .unwrap()
            .to_vec1()
            .unwrap();
        for (i, row) in rows.iter().enumerate() {
            let expected = log_likelihood(row, &gold[i], &trans).unwrap();
            assert!((llh[i] - expected).abs() < 1e-4, "row {i}: {} vs {expected}", llh[i]);
        }

        let z: Vec<f32> = crf.log_partition(&emissions, &mask).unwrap().to_vec1().unwrap();
        assert!((z[1] - log_partition(&rows[1], &trans).unwrap()).abs() < 1e-4);
    }

    #[test]
    fn test_padding_content_is_ignored() {
        let tags = per_tags();
        let trans = random_matrix(&tags, true, 5);
        let crf = layer_from(&tags, &trans);
        let rows = vec![pseudo_random(1, 2 * tags.len()), pseudo_random(2, 5 * tags.len())];
        let gold = vec![vec![1, 2], vec![0, 1, 2, 2, 0]];
        let mask = Mask::from_lengths(vec![2, 5]);

        let clean = pad_batch(&rows, tags.len(), 5, 0.0);
        let noisy = pad_batch(&rows, tags.len(), 5, 1234.5);
        let a: Vec<f32> = crf.log_likelihood(&clean, &mask, &gold).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = crf.log_likelihood(&noisy, &mask, &gold).unwrap().to_vec1().unwrap();
        assert!((a[0] - b[0]).abs() < 1e-4);
        assert_eq!(crf.decode(&clean, &mask).unwrap(), crf.decode(&noisy, &mask).unwrap());
    }

    #[test]
    fn test_batch_size_invariance() {
        let tags = per_tags();
        let trans = random_matrix(&tags, false, 9);
        let crf = layer_from(&tags, &trans);
        let lengths = [3usize, 1, 4];
        let rows: Vec<Vec<f32>> = lengths
            .iter()
            .enumerate()
            .map(|(i, &l)| pseudo_random(i as u64, l * tags.len()))
            .collect();
        let gold = vec![vec![0, 1, 2], vec![1], vec![1, 2, 0, 0]];

        let batch = pad_batch(&rows, tags.len(), 4, 0.0);
        let mask = Mask::from_lengths(lengths.to_vec());
        let batched: Vec<f32> = crf.log_likelihood(&batch, &mask, &gold).unwrap().to_vec1().unwrap();
        let batched_paths = crf.decode(&batch, &mask).unwrap();

        for (i, row) in rows.iter().enumerate() {
            let alone = pad_batch(std::slice::from_ref(row), tags.len(), lengths[i], 0.0);
            let alone_mask = Mask::from_lengths(vec![lengths[i]]);
            let llh: Vec<f32> = crf
                .log_likelihood(&alone, &alone_mask, &gold[i..=i])
                .unwrap()
                .to_vec1()
                .unwrap();
            assert!((llh[0] - batched[i]).abs() < 1e-4);
            let path = crf.decode(&alone, &alone_mask).unwrap();
            assert_eq!(path[0], batched_paths[i]);
            assert_eq!(path[0].len(), lengths[i]);
        }
    }

    #[test]
    fn test_empty_rows_are_noops() {
        let tags = per_tags();
        let trans = random_matrix(&tags, false, 2);
        let crf = layer_from(&tags, &trans);
        let rows = vec![pseudo_random(3, 2 * tags.len()), Vec::new()];
        let emissions = pad_batch(&rows, tags.len(), 2, 0.0);
        let mask = Mask::from_lengths(vec![2, 0]);
        let gold = vec![vec![1, 2], vec![]];

        let llh: Vec<f32> = crf.log_likelihood(&emissions, &mask, &gold).unwrap().to_vec1().unwrap();
        assert_eq!(llh[1], 0.0);
        assert!((llh[0] - log_likelihood(&rows[0], &gold[0], &trans).unwrap()).abs() < 1e-4);
        let paths = crf.decode(&emissions, &mask).unwrap();
        assert!(paths[1].is_empty());

        // all-empty batch short-circuits
        let empty = Tensor::zeros((2, 0, tags.len()), DType::F32, &Device::Cpu).unwrap();
        let mask = Mask::from_lengths(vec![0, 0]);
        let llh: Vec<f32> = crf
            .log_likelihood(&empty, &mask, &[vec![], vec![]])
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(llh, vec![0.0, 0.0]);
        assert_eq!(crf.decode(&empty, &mask).unwrap(), vec![Vec::<usize>::new(); 2]);
    }

    #[test]
    fn test_pins_forbidden_transitions() {
        let tags = per_tags();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let crf = CrfLayer::new(&tags, true, vb.pp("crf")).unwrap();
        let host = crf.transition_matrix().unwrap();
        let (o, i_per) = (0, 2);
        assert_eq!(host.get(o, i_per), ILLEGAL_SCORE);
        assert_eq!(host.get(0, host.start_index()), ILLEGAL_SCORE);
        assert_eq!(host.get(host.stop_index(), 1), ILLEGAL_SCORE);
        assert!(host.get(1, i_per) > ILLEGAL_SCORE);
    }

    #[test]
    fn test_loss_reductions_and_gradients() {
        let tags = per_tags();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let crf = CrfLayer::new(&tags, false, vb.pp("crf")).unwrap();
        let rows = vec![pseudo_random(1, 3 * tags.len()), pseudo_random(2, 2 * tags.len())];
        let emissions = pad_batch(&rows, tags.len(), 3, 0.0);
        let mask = Mask::from_lengths(vec![3, 2]);
        let gold = vec![vec![1, 2, 0], vec![0, 0]];

        let per_seq: Vec<f32> = crf
            .loss(&emissions, &mask, &gold, Reduction::None)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(per_seq.iter().all(|&l| l > 0.0));
        let sum = crf
            .loss(&emissions, &mask, &gold, Reduction::Sum)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let mean = crf.loss(&emissions, &mask, &gold, Reduction::Mean).unwrap();
        assert!((sum - per_seq.iter().sum::<f32>()).abs() < 1e-4);
        assert!((mean.to_scalar::<f32>().unwrap() - sum / 2.0).abs() < 1e-4);

        let grads = mean.backward().unwrap();
        let var = varmap.all_vars().pop().unwrap();
        let grad = grads.get(var.as_tensor()).expect("transitions receive a gradient");
        assert_eq!(grad.dims(), &[tags.num_states(), tags.num_states()]);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let tags = per_tags();
        let crf = layer_from(&tags, &TransitionMatrix::zeros(&tags, false));
        let emissions = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(crf.decode(&emissions, &Mask::from_lengths(vec![2])).is_err());

        let emissions = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let mask = Mask::from_lengths(vec![2]);
        assert!(crf.log_likelihood(&emissions, &mask, &[vec![0]]).is_err());
        assert!(crf.log_likelihood(&emissions, &mask, &[vec![0, 3]]).is_err());
    }
}

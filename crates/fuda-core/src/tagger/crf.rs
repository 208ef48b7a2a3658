//! # Linear-Chain CRF Layer
//!
//! A trainable transition matrix plus the negative log-likelihood of a gold
//! tag path: `log Z - score(gold)`, with the partition `Z` computed by the
//! forward algorithm in log space. All operations stay on candle tensors so
//! gradients flow into both the transitions and the emission network.

use candle_core::{IndexOp, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::error::{FudaError, Result};

/// Linear-chain CRF with learned transition scores `[from][to]`.
pub struct Crf {
    transitions: Tensor,
    num_tags: usize,
}

impl Crf {
    pub fn new(num_tags: usize, vb: VarBuilder) -> Result<Self> {
        let transitions =
            vb.get_with_hints((num_tags, num_tags), "transitions", Init::Const(0.0))?;
        Ok(Self {
            transitions,
            num_tags,
        })
    }

    /// The transition matrix (a view of the trainable parameter).
    pub fn transitions(&self) -> &Tensor {
        &self.transitions
    }

    /// Negative log-likelihood of `tags` given `emissions` (`[seq, tags]`).
    /// Non-negative up to floating point error; zero when the gold path
    /// holds all probability mass.
    pub fn nll(&self, emissions: &Tensor, tags: &[u32]) -> Result<Tensor> {
        let (seq_len, width) = emissions.dims2()?;
        if width != self.num_tags {
            return Err(FudaError::InvalidConfig(format!(
                "emission width {width} does not match {} CRF tags",
                self.num_tags
            )));
        }
        if seq_len != tags.len() || seq_len == 0 {
            return Err(FudaError::InvalidConfig(format!(
                "CRF sequence length mismatch: {seq_len} emissions, {} tags",
                tags.len()
            )));
        }

        // Score of the gold path.
        let mut gold = emissions.i((0, tags[0] as usize))?;
        for t in 1..seq_len {
            gold = (gold + emissions.i((t, tags[t] as usize))?)?;
            gold = (gold + self.transitions.i((tags[t - 1] as usize, tags[t] as usize))?)?;
        }

        // Forward recursion: alpha[j] = logsumexp_i(alpha[i] + T[i][j]) + e_t[j].
        let mut alpha = emissions.i(0)?;
        for t in 1..seq_len {
            let scores = alpha.unsqueeze(1)?.broadcast_add(&self.transitions)?;
            alpha = (log_sum_exp_dim0(&scores)? + emissions.i(t)?)?;
        }

        let max = alpha.max(0)?;
        let log_z = (alpha.broadcast_sub(&max)?.exp()?.sum(0)?.log()? + max)?;

        Ok((log_z - gold)?)
    }
}

/// Numerically stable `logsumexp` over dim 0 of a 2-D tensor.
fn log_sum_exp_dim0(scores: &Tensor) -> Result<Tensor> {
    let max = scores.max_keepdim(0)?;
    let summed = scores.broadcast_sub(&max)?.exp()?.sum(0)?.log()?;
    Ok((summed + max.squeeze(0)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn crf(num_tags: usize) -> Crf {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Crf::new(num_tags, vb).unwrap()
    }

    #[test]
    fn nll_is_finite_and_non_negative() {
        let crf = crf(3);
        let emissions =
            Tensor::new(&[[0.5f32, 1.0, -0.5], [0.1, 0.2, 0.3], [1.5, -1.0, 0.0]], &Device::Cpu)
                .unwrap();
        let loss = crf.nll(&emissions, &[1, 2, 0]).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());
        assert!(value >= -1e-4);
    }

    #[test]
    fn uniform_emissions_give_log_path_count() {
        // With zero emissions and zero transitions every path has equal
        // probability: nll = log(num_tags^seq_len) for any gold path.
        let crf = crf(2);
        let emissions = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let loss = crf.nll(&emissions, &[0, 1, 0]).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        let expected = (2f32.powi(3)).ln();
        assert!((value - expected).abs() < 1e-4);
    }

    #[test]
    fn confident_emissions_shrink_the_loss() {
        let crf = crf(2);
        let weak = Tensor::new(&[[0.1f32, 0.0], [0.0, 0.1]], &Device::Cpu).unwrap();
        let strong = Tensor::new(&[[10.0f32, 0.0], [0.0, 10.0]], &Device::Cpu).unwrap();
        let weak_loss = crf.nll(&weak, &[0, 1]).unwrap().to_scalar::<f32>().unwrap();
        let strong_loss = crf
            .nll(&strong, &[0, 1])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(strong_loss < weak_loss);
    }

    #[test]
    fn single_token_sequence() {
        let crf = crf(3);
        let emissions = Tensor::new(&[[2.0f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let loss = crf.nll(&emissions, &[0]).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let crf = crf(2);
        let emissions = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(crf.nll(&emissions, &[0, 1]).is_err());
    }
}

//! Text pre- and post-processing for the Perceiver encoder.

use candle_core::{Tensor, D};
use candle_nn::{Embedding, Module, VarBuilder};
use tracing::debug;

use crate::config::PerceiverConfig;
use crate::error::{Error, Result};

/// Token embedding plus learned absolute position embedding.
#[derive(Debug, Clone)]
pub struct TextPreprocessor {
    embeddings: Embedding,
    position_embeddings: Embedding,
    seq_len: usize,
    d_model: usize,
}

impl TextPreprocessor {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = candle_nn::embedding(config.vocab_size, config.d_model, vb.pp("embeddings"))?;
        let position_embeddings =
            candle_nn::embedding(config.seq_len, config.d_model, vb.pp("position_embeddings"))?;
        Ok(Self {
            embeddings,
            position_embeddings,
            seq_len: config.seq_len,
            d_model: config.d_model,
        })
    }

    /// Token embedding table, shared with [`TextPostprocessor`].
    pub fn embeddings(&self) -> &Embedding {
        &self.embeddings
    }

    pub fn num_channels(&self) -> usize {
        self.d_model
    }

    /// Embed `[batch, len]` token ids (u32) into `[batch, len, d_model]`.
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let (_, len) = inputs.dims2()?;
        if len > self.seq_len {
            return Err(Error::Shape(format!(
                "sequence of length {} exceeds the {} available positions",
                len, self.seq_len
            )));
        }
        let embeddings = self.embeddings.forward(inputs)?;
        let position_ids = Tensor::arange(0u32, len as u32, inputs.device())?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        debug!(embeddings = ?embeddings.dims(), "text preprocessor");
        Ok(embeddings.broadcast_add(&positions)?)
    }
}

/// Projects hidden states back onto the vocabulary with the (tied) token
/// embedding matrix plus a learned bias.
#[derive(Debug, Clone)]
pub struct TextPostprocessor {
    bias: Tensor,
    vocab_size: usize,
}

impl TextPostprocessor {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let bias = vb.get_with_hints(config.vocab_size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self {
            bias,
            vocab_size: config.vocab_size,
        })
    }

    /// Decode `[batch, len, d_model]` hidden states into
    /// `[batch, len, vocab_size]` logits.
    pub fn forward(&self, hidden_states: &Tensor, embedding_layer: &Embedding) -> Result<Tensor> {
        let (batch_size, seq_len, d_model) = hidden_states.dims3()?;
        let weight = embedding_layer.embeddings();
        if weight.dim(D::Minus1)? != d_model {
            return Err(Error::Shape(format!(
                "hidden size {} does not match embedding size {}",
                d_model,
                weight.dim(D::Minus1)?
            )));
        }
        let logits = hidden_states
            .reshape((batch_size * seq_len, d_model))?
            .matmul(&weight.t()?)?
            .broadcast_add(&self.bias)?;
        Ok(logits.reshape((batch_size, seq_len, self.vocab_size))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> PerceiverConfig {
        PerceiverConfig {
            vocab_size: 11,
            d_model: 6,
            seq_len: 5,
        }
    }

    #[test]
    fn test_preprocessor_adds_positions() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pre = TextPreprocessor::new(&small_config(), vb).unwrap();

        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let out = pre.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[2, 3, 6]);

        // same token at the same position embeds identically across the batch
        let ids = Tensor::new(&[[7u32, 7], [7, 7]], &Device::Cpu).unwrap();
        let out = pre.forward(&ids).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(out[0][1], out[1][1]);
        assert_ne!(out[0][0], out[0][1]);
    }

    #[test]
    fn test_preprocessor_rejects_long_sequences() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pre = TextPreprocessor::new(&small_config(), vb).unwrap();
        let ids = Tensor::zeros((1, 6), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(pre.forward(&ids), Err(Error::Shape(_))));
    }

    #[test]
    fn test_postprocessor_logits_match_embedding_product() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = small_config();
        let pre = TextPreprocessor::new(&config, vb.pp("pre")).unwrap();
        let post = TextPostprocessor::new(&config, vb.pp("post")).unwrap();

        let hidden = Tensor::ones((2, 4, 6), DType::F32, &Device::Cpu).unwrap();
        let logits = post.forward(&hidden, pre.embeddings()).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 11]);

        // zero bias: each logit is the row sum of the embedding matrix
        let row_sums = pre
            .embeddings()
            .embeddings()
            .sum(1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let got = logits.to_vec3::<f32>().unwrap();
        for (v, expected) in got[1][3].iter().zip(row_sums.iter()) {
            assert!((v - expected).abs() < 1e-4);
        }
    }
}

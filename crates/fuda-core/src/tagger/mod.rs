//! # Sequence Tagger
//!
//! A classification head over transformer word embeddings: optional
//! embedding reprojection, optional BiLSTM, a linear emission layer and
//! either per-token cross-entropy or a CRF with Viterbi decoding.

pub mod crf;
pub mod viterbi;

use std::path::Path;

use candle_core::{D, DType, Tensor};
use candle_nn::{LSTM, LSTMConfig, Linear, Module, RNN, VarBuilder, VarMap, linear, lstm};
use serde::{Deserialize, Serialize};

use crate::embeddings::{EncodedSentence, TransformerEmbeddingsConfig, TransformerWordEmbeddings};
use crate::error::{FudaError, Result};
use crate::labels::LabelDictionary;

pub use crf::Crf;
pub use viterbi::ViterbiDecoder;

/// Configuration for [`SequenceTagger`]. Consumed once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTaggerConfig {
    /// BiLSTM hidden size per direction (only used with `use_rnn`).
    pub hidden_size: usize,
    /// The annotation layer being predicted, e.g. `"ner"`.
    pub tag_type: String,
    /// Decode with a CRF instead of independent per-token softmax.
    pub use_crf: bool,
    /// Insert a BiLSTM between the embeddings and the emission layer.
    pub use_rnn: bool,
    /// Reproject embeddings through a linear layer before scoring.
    pub reproject_embeddings: bool,
}

impl Default for SequenceTaggerConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            tag_type: "ner".to_string(),
            use_crf: false,
            use_rnn: false,
            reproject_embeddings: false,
        }
    }
}

/// Two LSTM passes, one over the reversed sequence, concatenated.
struct BiLstm {
    fwd: LSTM,
    bwd: LSTM,
}

impl BiLstm {
    fn new(input_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fwd: lstm(input_dim, hidden, LSTMConfig::default(), vb.pp("fwd"))?,
            bwd: lstm(input_dim, hidden, LSTMConfig::default(), vb.pp("bwd"))?,
        })
    }

    /// `[batch, seq, in] -> [batch, seq, 2*hidden]`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let fwd_states = self.fwd.seq(xs)?;
        let fwd = self.fwd.states_to_tensor(&fwd_states)?;

        let reversed = reverse_time(xs)?;
        let bwd_states = self.bwd.seq(&reversed)?;
        let bwd = reverse_time(&self.bwd.states_to_tensor(&bwd_states)?)?;

        Ok(Tensor::cat(&[fwd, bwd], D::Minus1)?)
    }
}

fn reverse_time(xs: &Tensor) -> Result<Tensor> {
    let seq_len = xs.dim(1)?;
    let indices: Vec<u32> = (0..seq_len as u32).rev().collect();
    let indices = Tensor::new(indices, xs.device())?;
    Ok(xs.index_select(&indices, 1)?)
}

/// Metadata persisted next to checkpoints, enough to rebuild a tagger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerMetadata {
    pub tagger: SequenceTaggerConfig,
    pub embeddings: TransformerEmbeddingsConfig,
    pub labels: Vec<String>,
}

/// Token-level sequence tagger over transformer word embeddings.
pub struct SequenceTagger {
    embeddings: TransformerWordEmbeddings,
    label_dict: LabelDictionary,
    config: SequenceTaggerConfig,
    reproject: Option<Linear>,
    rnn: Option<BiLstm>,
    emission: Linear,
    crf: Option<Crf>,
    viterbi: ViterbiDecoder,
}

impl SequenceTagger {
    /// Build a tagger whose head parameters are registered in `varmap`
    /// under the `tagger.` prefix (the embeddings register theirs under
    /// `encoder.` when fine-tuning).
    pub fn new(
        embeddings: TransformerWordEmbeddings,
        label_dict: LabelDictionary,
        config: SequenceTaggerConfig,
        varmap: &VarMap,
    ) -> Result<Self> {
        if label_dict.is_empty() {
            return Err(FudaError::InvalidConfig(
                "cannot build a tagger over an empty label dictionary".into(),
            ));
        }

        let vb =
            VarBuilder::from_varmap(varmap, DType::F32, embeddings.device()).pp("tagger");
        let embedding_dim = embeddings.embedding_dim();

        let reproject = if config.reproject_embeddings {
            Some(linear(embedding_dim, embedding_dim, vb.pp("reproject"))?)
        } else {
            None
        };

        let (rnn, feature_dim) = if config.use_rnn {
            (
                Some(BiLstm::new(embedding_dim, config.hidden_size, vb.pp("rnn"))?),
                2 * config.hidden_size,
            )
        } else {
            (None, embedding_dim)
        };

        let emission = linear(feature_dim, label_dict.len(), vb.pp("emission"))?;

        let crf = if config.use_crf {
            Some(Crf::new(label_dict.len(), vb.pp("crf"))?)
        } else {
            None
        };

        let viterbi = ViterbiDecoder::new(&label_dict);

        Ok(Self {
            embeddings,
            label_dict,
            config,
            reproject,
            rnn,
            emission,
            crf,
            viterbi,
        })
    }

    pub fn embeddings(&self) -> &TransformerWordEmbeddings {
        &self.embeddings
    }

    pub fn label_dictionary(&self) -> &LabelDictionary {
        &self.label_dict
    }

    pub fn config(&self) -> &SequenceTaggerConfig {
        &self.config
    }

    /// Emission scores for each sentence: one `[n_words, n_labels]` tensor.
    pub fn emission_scores(&self, batch: &[&EncodedSentence]) -> Result<Vec<Tensor>> {
        let embedded = self.embeddings.embed(batch)?;
        embedded
            .into_iter()
            .map(|features| self.score(features))
            .collect()
    }

    fn score(&self, mut features: Tensor) -> Result<Tensor> {
        if let Some(reproject) = &self.reproject {
            features = reproject.forward(&features)?;
        }
        if let Some(rnn) = &self.rnn {
            features = rnn.forward(&features.unsqueeze(0)?)?.squeeze(0)?;
        }
        Ok(self.emission.forward(&features)?)
    }

    /// Mini-batch training loss.
    ///
    /// `tags[i]` holds one label index per word of `batch[i]`. Per-token
    /// cross-entropy by default; CRF negative log-likelihood when the
    /// tagger was built with `use_crf`.
    pub fn forward_loss(&self, batch: &[&EncodedSentence], tags: &[Vec<u32>]) -> Result<Tensor> {
        if batch.len() != tags.len() || batch.is_empty() {
            return Err(FudaError::InvalidConfig(format!(
                "batch of {} sentences with {} tag sequences",
                batch.len(),
                tags.len()
            )));
        }
        for (sentence, sentence_tags) in batch.iter().zip(tags) {
            if sentence.n_words() != sentence_tags.len() {
                return Err(FudaError::InvalidConfig(format!(
                    "sentence with {} words has {} tags",
                    sentence.n_words(),
                    sentence_tags.len()
                )));
            }
        }

        let emissions = self.emission_scores(batch)?;

        if let Some(crf) = &self.crf {
            let mut total: Option<Tensor> = None;
            for (scores, sentence_tags) in emissions.iter().zip(tags) {
                let nll = crf.nll(scores, sentence_tags)?;
                total = Some(match total {
                    Some(acc) => (acc + nll)?,
                    None => nll,
                });
            }
            let total = total.expect("non-empty batch");
            Ok((total / batch.len() as f64)?)
        } else {
            let logits = Tensor::cat(&emissions, 0)?;
            let flat: Vec<u32> = tags.iter().flatten().copied().collect();
            let targets = Tensor::new(flat, logits.device())?;
            Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
        }
    }

    /// Predict one label string per word for each sentence.
    pub fn predict(&self, batch: &[&EncodedSentence]) -> Result<Vec<Vec<String>>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let emissions = self.emission_scores(batch)?;
        let mut out = Vec::with_capacity(batch.len());

        for scores in emissions {
            let indices: Vec<usize> = if let Some(crf) = &self.crf {
                let emission_rows = scores.to_vec2::<f32>()?;
                let transition_rows = crf.transitions().to_vec2::<f32>()?;
                self.viterbi.decode(&emission_rows, &transition_rows)?
            } else {
                scores
                    .argmax(D::Minus1)?
                    .to_vec1::<u32>()?
                    .into_iter()
                    .map(|i| i as usize)
                    .collect()
            };

            let labels = indices
                .into_iter()
                .map(|i| {
                    self.label_dict
                        .label_of(i)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            FudaError::InvalidConfig(format!("predicted unknown label index {i}"))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            out.push(labels);
        }

        Ok(out)
    }

    /// Write `tagger.json` into a checkpoint directory.
    pub fn save_metadata(&self, dir: &Path) -> Result<()> {
        let metadata = TaggerMetadata {
            tagger: self.config.clone(),
            embeddings: self.embeddings.config().clone(),
            labels: self.label_dict.labels().to_vec(),
        };
        let json = serde_json::to_string_pretty(&metadata)?;
        std::fs::write(dir.join("tagger.json"), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::encoder::{Encoder, EncoderSpec};
    use candle_core::Device;
    use candle_transformers::models::distilbert::{
        Config as DistilBertConfig, DistilBertModel,
    };

    const TINY_CONFIG: &str = r#"{
        "activation": "gelu",
        "attention_dropout": 0.1,
        "dim": 16,
        "dropout": 0.1,
        "hidden_dim": 32,
        "initializer_range": 0.02,
        "max_position_embeddings": 64,
        "model_type": "distilbert",
        "n_heads": 2,
        "n_layers": 1,
        "pad_token_id": 0,
        "qa_dropout": 0.1,
        "seq_classif_dropout": 0.2,
        "sinusoidal_pos_embds": false,
        "vocab_size": 50
    }"#;

    fn tiny_tagger(config: SequenceTaggerConfig) -> (SequenceTagger, VarMap) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device).pp("encoder");

        let bert_config: DistilBertConfig = serde_json::from_str(TINY_CONFIG).unwrap();
        let model = DistilBertModel::load(vb, &bert_config).unwrap();
        let spec = EncoderSpec {
            model_type: "distilbert".to_string(),
            hidden_size: 16,
            num_hidden_layers: 1,
            max_position_embeddings: 64,
            pad_token_id: 0,
        };
        let encoder = Encoder::from_parts_distilbert(model, spec);

        let embeddings = TransformerWordEmbeddings::from_parts(
            encoder,
            TransformerEmbeddingsConfig {
                model: "tiny".into(),
                ..Default::default()
            },
            &device,
        );

        let mut dict = LabelDictionary::new();
        dict.add("B-PER");
        dict.add("I-PER");
        dict.add("B-LOC");

        let tagger = SequenceTagger::new(embeddings, dict, config, &varmap).unwrap();
        (tagger, varmap)
    }

    fn encoded(ids: &[u32], spans: &[(usize, usize)]) -> EncodedSentence {
        EncodedSentence {
            ids: ids.to_vec(),
            word_spans: spans.to_vec(),
        }
    }

    #[test]
    fn forward_loss_is_finite() {
        let (tagger, _varmap) = tiny_tagger(SequenceTaggerConfig::default());
        let a = encoded(&[2, 5, 6, 7, 3], &[(1, 1), (2, 2), (4, 1)]);
        let b = encoded(&[2, 8, 3], &[(1, 1)]);

        let loss = tagger
            .forward_loss(&[&a, &b], &[vec![1, 2, 0], vec![3]])
            .unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn predict_yields_one_tag_per_word() {
        let (tagger, _varmap) = tiny_tagger(SequenceTaggerConfig::default());
        let a = encoded(&[2, 5, 6, 7, 3], &[(1, 1), (2, 2), (4, 1)]);
        let b = encoded(&[2, 8, 3], &[(1, 1)]);

        let predictions = tagger.predict(&[&a, &b]).unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].len(), 3);
        assert_eq!(predictions[1].len(), 1);
        for tag in predictions.iter().flatten() {
            assert!(tagger.label_dictionary().index_of(tag).is_some());
        }
    }

    #[test]
    fn crf_variant_trains_and_decodes() {
        let (tagger, _varmap) = tiny_tagger(SequenceTaggerConfig {
            use_crf: true,
            ..Default::default()
        });
        let a = encoded(&[2, 5, 6, 3], &[(1, 1), (2, 1)]);

        let loss = tagger.forward_loss(&[&a], &[vec![1, 2]]).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());

        let predictions = tagger.predict(&[&a]).unwrap();
        assert_eq!(predictions[0].len(), 2);
    }

    #[test]
    fn rnn_and_reprojection_variant() {
        let (tagger, _varmap) = tiny_tagger(SequenceTaggerConfig {
            hidden_size: 8,
            use_rnn: true,
            reproject_embeddings: true,
            ..Default::default()
        });
        let a = encoded(&[2, 5, 6, 7, 3], &[(1, 2), (3, 1)]);

        let loss = tagger.forward_loss(&[&a], &[vec![0, 3]]).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        assert_eq!(tagger.predict(&[&a]).unwrap()[0].len(), 2);
    }

    #[test]
    fn tag_count_mismatch_is_an_error() {
        let (tagger, _varmap) = tiny_tagger(SequenceTaggerConfig::default());
        let a = encoded(&[2, 5, 3], &[(1, 1)]);
        assert!(tagger.forward_loss(&[&a], &[vec![0, 1]]).is_err());
    }

    #[test]
    fn head_parameters_are_registered_for_training() {
        let (_tagger, varmap) = tiny_tagger(SequenceTaggerConfig::default());
        let names: Vec<String> = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert!(names.iter().any(|n| n.starts_with("tagger.emission")));
        assert!(names.iter().any(|n| n.starts_with("encoder.")));
    }
}

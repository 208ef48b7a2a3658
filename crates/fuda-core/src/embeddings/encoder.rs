//! # Pretrained Encoder Loading
//!
//! Wraps the candle transformer graphs behind one enum. The encoder family
//! is chosen from the `model_type` field of the HF `config.json`; roberta
//! and xlm-roberta checkpoints run through the BERT graph with their weight
//! keys remapped at load time.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};
use tracing::{debug, info, warn};

use crate::error::{FudaError, Result};

/// The subset of the HF `config.json` the embedding layer needs directly.
/// The candle configs keep their fields private, so this is parsed
/// separately from the same file.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    pub model_type: String,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub max_position_embeddings: usize,
    pub pad_token_id: u32,
}

impl EncoderSpec {
    fn from_json(value: &serde_json::Value) -> Result<Self> {
        let model_type = value
            .get("model_type")
            .and_then(|v| v.as_str())
            .unwrap_or("bert")
            .to_string();

        let usize_field = |keys: &[&str]| -> Option<usize> {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(|v| v.as_u64()))
                .map(|v| v as usize)
        };

        let hidden_size = usize_field(&["hidden_size", "dim"]).ok_or_else(|| {
            FudaError::ModelLoad("config.json has no hidden_size/dim field".into())
        })?;
        let num_hidden_layers =
            usize_field(&["num_hidden_layers", "n_layers"]).ok_or_else(|| {
                FudaError::ModelLoad("config.json has no num_hidden_layers/n_layers field".into())
            })?;
        let max_position_embeddings =
            usize_field(&["max_position_embeddings"]).unwrap_or(512);
        let pad_token_id = value
            .get("pad_token_id")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        Ok(Self {
            model_type,
            hidden_size,
            num_hidden_layers,
            max_position_embeddings,
            pad_token_id,
        })
    }

    fn is_bert_family(&self) -> bool {
        matches!(
            self.model_type.as_str(),
            "bert" | "roberta" | "xlm-roberta" | "camembert" | "electra"
        )
    }

    /// Offset between the position ids the graph computes (`0..seq_len`)
    /// and the rows of the checkpoint's position embedding table.
    ///
    /// RoBERTa-family models reserve the first `padding_idx + 1` rows, so
    /// the embedding for position `p` lives at row `p + 2`.
    pub fn position_row_offset(&self) -> usize {
        match self.model_type.as_str() {
            "roberta" | "xlm-roberta" | "camembert" => 2,
            _ => 0,
        }
    }

    /// Positions a sequence may actually occupy: the table size minus the
    /// reserved rows (512 for xlm-roberta's 514-row table).
    pub fn usable_positions(&self) -> usize {
        self.max_position_embeddings
            .saturating_sub(self.position_row_offset())
    }
}

enum EncoderModel {
    Bert(BertModel),
    DistilBert(DistilBertModel),
}

/// A loaded transformer encoder with its configuration.
pub struct Encoder {
    model: EncoderModel,
    spec: EncoderSpec,
}

/// Weight-key prefixes tried when matching checkpoint tensors against the
/// graph's parameter names. MLM/classification checkpoints nest the encoder
/// under the architecture name.
const KEY_PREFIXES: &[&str] = &["", "bert.", "roberta.", "distilbert.", "electra."];

impl Encoder {
    /// Load an encoder from a model directory containing `config.json` and
    /// `model.safetensors`.
    ///
    /// With `fine_tune` the parameters are registered as trainable vars in
    /// `varmap` under the `encoder.` prefix and the pretrained weights are
    /// copied in by name; without it the weights are memory-mapped
    /// read-only and stay frozen.
    pub fn from_dir(
        dir: &Path,
        fine_tune: bool,
        varmap: Option<&VarMap>,
        device: &Device,
    ) -> Result<Self> {
        let config_path = dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            FudaError::ModelLoad(format!("cannot read {}: {e}", config_path.display()))
        })?;
        let config_value: serde_json::Value = serde_json::from_str(&config_str)?;
        let spec = EncoderSpec::from_json(&config_value)?;

        let weights_path = dir.join("model.safetensors");
        if !weights_path.exists() {
            return Err(FudaError::ModelLoad(format!(
                "model weights not found at {}",
                weights_path.display()
            )));
        }

        let model = if fine_tune {
            let varmap = varmap.ok_or_else(|| {
                FudaError::InvalidConfig("fine-tuning requires a parameter store".into())
            })?;
            let vb = VarBuilder::from_varmap(varmap, DType::F32, device).pp("encoder");
            let model = Self::build(&spec, &config_str, vb)?;
            copy_pretrained(
                varmap,
                &weights_path,
                "encoder.",
                spec.position_row_offset(),
                device,
            )?;
            model
        } else {
            let offset = spec.position_row_offset();
            let vb = if offset > 0 {
                // The position table needs realigning, so the tensors have
                // to be materialized rather than memory-mapped.
                let mut tensors = candle_core::safetensors::load(&weights_path, device)?;
                let keys: Vec<String> = tensors
                    .keys()
                    .filter(|k| k.ends_with("embeddings.position_embeddings.weight"))
                    .cloned()
                    .collect();
                for key in keys {
                    let aligned = align_position_rows(&tensors[&key], offset)?;
                    tensors.insert(key, aligned);
                }
                VarBuilder::from_tensors(tensors, DType::F32, device)
            } else {
                unsafe {
                    VarBuilder::from_mmaped_safetensors(&[&weights_path], DType::F32, device)?
                }
            };
            Self::load_frozen(&spec, &config_str, vb)?
        };

        Ok(Self { model, spec })
    }

    /// Build a freshly initialized graph (weights arrive via `copy_pretrained`).
    fn build(spec: &EncoderSpec, config_str: &str, vb: VarBuilder) -> Result<EncoderModel> {
        if spec.is_bert_family() {
            let config: BertConfig = serde_json::from_str(config_str)?;
            Ok(EncoderModel::Bert(BertModel::load(vb, &config)?))
        } else if spec.model_type == "distilbert" {
            let config: DistilBertConfig = serde_json::from_str(config_str)?;
            Ok(EncoderModel::DistilBert(DistilBertModel::load(vb, &config)?))
        } else {
            Err(FudaError::InvalidConfig(format!(
                "unsupported encoder architecture {:?}",
                spec.model_type
            )))
        }
    }

    /// Load directly from the checkpoint, probing the nesting prefixes.
    fn load_frozen(spec: &EncoderSpec, config_str: &str, vb: VarBuilder) -> Result<EncoderModel> {
        if spec.is_bert_family() {
            let config: BertConfig = serde_json::from_str(config_str)?;
            let mut last_err = None;
            for prefix in KEY_PREFIXES {
                let scoped = if prefix.is_empty() {
                    vb.clone()
                } else {
                    vb.pp(prefix.trim_end_matches('.'))
                };
                match BertModel::load(scoped, &config) {
                    Ok(model) => {
                        debug!(prefix, "loaded frozen encoder");
                        return Ok(EncoderModel::Bert(model));
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(FudaError::ModelLoad(format!(
                "checkpoint does not match the {} graph: {}",
                spec.model_type,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )))
        } else if spec.model_type == "distilbert" {
            let config: DistilBertConfig = serde_json::from_str(config_str)?;
            let mut last_err = None;
            for prefix in KEY_PREFIXES {
                let scoped = if prefix.is_empty() {
                    vb.clone()
                } else {
                    vb.pp(prefix.trim_end_matches('.'))
                };
                match DistilBertModel::load(scoped, &config) {
                    Ok(model) => {
                        debug!(prefix, "loaded frozen encoder");
                        return Ok(EncoderModel::DistilBert(model));
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(FudaError::ModelLoad(format!(
                "checkpoint does not match the distilbert graph: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )))
        } else {
            Err(FudaError::InvalidConfig(format!(
                "unsupported encoder architecture {:?}",
                spec.model_type
            )))
        }
    }

    /// Final-layer hidden states.
    ///
    /// `input_ids` and `attention_mask` are `[batch, seq]`; the mask is
    /// binary with 1 on real tokens and 0 on padding. Returns
    /// `[batch, seq, hidden]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let hidden = match &self.model {
            EncoderModel::Bert(model) => {
                let token_type_ids = input_ids.zeros_like()?;
                model.forward(input_ids, &token_type_ids, Some(attention_mask))?
            }
            EncoderModel::DistilBert(model) => {
                // The distilbert graph masks where the tensor is nonzero,
                // so flip the binary mask and shape it for broadcasting
                // over [batch, heads, seq, seq] attention scores.
                let blocked = attention_mask.eq(0u32)?.unsqueeze(1)?.unsqueeze(1)?;
                model.forward(input_ids, &blocked)?
            }
        };
        Ok(hidden)
    }

    pub fn spec(&self) -> &EncoderSpec {
        &self.spec
    }

    /// Construct from an already-built graph; used by in-process tests with
    /// tiny randomly initialized configurations.
    #[doc(hidden)]
    pub fn from_parts_distilbert(model: DistilBertModel, spec: EncoderSpec) -> Self {
        Self {
            model: EncoderModel::DistilBert(model),
            spec,
        }
    }
}

/// Copy checkpoint tensors into the trainable vars by name.
///
/// Var names carry the `strip` prefix added by the builder; checkpoint keys
/// may nest the encoder under an architecture prefix. Head weights present
/// in the checkpoint (lm_head, pooler) are intentionally left unmatched.
/// `position_offset` realigns the position embedding table for checkpoints
/// whose rows are shifted relative to the graph's `0..seq_len` position ids.
fn copy_pretrained(
    varmap: &VarMap,
    weights_path: &Path,
    strip: &str,
    position_offset: usize,
    device: &Device,
) -> Result<()> {
    let tensors = candle_core::safetensors::load(weights_path, device)?;
    let data = varmap.data().lock().unwrap();

    let mut copied = 0usize;
    let mut unmatched = 0usize;

    for (name, var) in data.iter() {
        let Some(stripped) = name.strip_prefix(strip) else {
            continue;
        };

        let found = KEY_PREFIXES
            .iter()
            .find_map(|prefix| tensors.get(&format!("{prefix}{stripped}")));

        let aligned;
        let source = match found {
            Some(t)
                if position_offset > 0
                    && stripped == "embeddings.position_embeddings.weight" =>
            {
                aligned = align_position_rows(t, position_offset)?;
                Some(&aligned)
            }
            other => other,
        };

        match source {
            Some(t) if t.shape() == var.shape() => {
                var.set(&t.to_dtype(DType::F32)?)?;
                copied += 1;
            }
            Some(t) => {
                warn!(
                    name = stripped,
                    expected = ?var.shape(),
                    found = ?t.shape(),
                    "shape mismatch, keeping fresh initialization"
                );
                unmatched += 1;
            }
            None => {
                warn!(name = stripped, "no checkpoint tensor, keeping fresh initialization");
                unmatched += 1;
            }
        }
    }

    if copied == 0 {
        return Err(FudaError::ModelLoad(format!(
            "no tensor in {} matched the encoder graph",
            weights_path.display()
        )));
    }

    info!(copied, unmatched, "loaded pretrained encoder weights");
    Ok(())
}

/// Shift a position embedding table so row `p` holds the checkpoint's
/// embedding for position `p`.
///
/// RoBERTa-family checkpoints store position `p` at row `p + offset`; the
/// graph indexes the table with raw `0..seq_len` ids. The tail rows freed
/// by the shift keep the checkpoint's trailing rows to preserve the shape;
/// they sit beyond any position the encoder can address after the shift.
fn align_position_rows(table: &Tensor, offset: usize) -> Result<Tensor> {
    let (rows, _dim) = table.dims2()?;
    if offset == 0 || offset >= rows {
        return Ok(table.clone());
    }
    let shifted = table.narrow(0, offset, rows - offset)?;
    let tail = table.narrow(0, rows - offset, offset)?;
    Ok(Tensor::cat(&[shifted, tail], 0)?)
}

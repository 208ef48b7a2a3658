//! # Fine-Tuning Loop
//!
//! AdamW over every registered variable (encoder and tagger head alike),
//! a linear warmup/decay schedule, per-epoch dev evaluation with
//! best-checkpoint tracking, and a final held-out test pass.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use fuda_core::corpus::Corpus;
use fuda_core::tagger::SequenceTagger;
use tracing::{info, warn};

use crate::batch::{self, EncodedExample};
use crate::eval::{EvaluationResult, evaluate};

/// Hyperparameters of one fine-tuning run.
#[derive(Debug, Clone)]
pub struct FineTuneConfig {
    pub learning_rate: f64,
    pub mini_batch_size: usize,
    pub max_epochs: usize,
    /// Threads used to pre-encode corpus splits.
    pub num_workers: usize,
    /// Fraction of total steps spent ramping the learning rate up from zero.
    pub warmup_fraction: f64,
    pub shuffle: bool,
    pub seed: u64,
    pub save_final_model: bool,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-6,
            mini_batch_size: 4,
            max_epochs: 10,
            num_workers: 12,
            warmup_fraction: 0.1,
            shuffle: true,
            seed: 42,
            save_final_model: true,
        }
    }
}

/// Learning rate at `step` of `total_steps`: linear ramp over the warmup
/// steps, then linear decay to zero.
fn linear_schedule(base_lr: f64, step: usize, total_steps: usize, warmup_fraction: f64) -> f64 {
    if total_steps == 0 {
        return base_lr;
    }
    let warmup = ((total_steps as f64 * warmup_fraction) as usize).max(1);
    if step < warmup {
        base_lr * (step + 1) as f64 / warmup as f64
    } else {
        let remaining = (total_steps - step) as f64;
        let decay_span = (total_steps - warmup) as f64;
        if decay_span <= 0.0 {
            base_lr
        } else {
            base_lr * (remaining / decay_span).clamp(0.0, 1.0)
        }
    }
}

/// Create the run directory without disturbing anything already in it.
fn prepare_output_dir(base_path: &Path) -> Result<()> {
    fs::create_dir_all(base_path)
        .with_context(|| format!("cannot create output directory {}", base_path.display()))?;
    Ok(())
}

/// Drives fine-tuning of a [`SequenceTagger`] on a [`Corpus`].
///
/// The `varmap` must be the one the tagger (and, when fine-tuning, its
/// encoder) registered parameters into; the optimizer steps exactly those
/// variables.
pub struct ModelTrainer {
    tagger: SequenceTagger,
    corpus: Corpus,
    varmap: VarMap,
}

impl ModelTrainer {
    pub fn new(tagger: SequenceTagger, corpus: Corpus, varmap: VarMap) -> Self {
        Self {
            tagger,
            corpus,
            varmap,
        }
    }

    /// Consume the trainer, returning the tagger for further use.
    pub fn into_tagger(self) -> SequenceTagger {
        self.tagger
    }

    /// Run the full fine-tuning schedule, writing checkpoints and results
    /// under `base_path`.
    ///
    /// Saves `best-model.safetensors` whenever the dev F1 improves,
    /// `final-model.safetensors` after the last epoch, and
    /// `test-results.json` from a final pass over the test split. Returns
    /// the test result (or the last dev result when the corpus has no test
    /// split).
    pub fn fine_tune(
        &mut self,
        base_path: impl AsRef<Path>,
        config: &FineTuneConfig,
    ) -> Result<EvaluationResult> {
        let base_path = base_path.as_ref();
        if config.mini_batch_size == 0 {
            bail!("mini_batch_size must be at least 1");
        }
        if config.max_epochs == 0 {
            bail!("max_epochs must be at least 1");
        }
        if self.corpus.train.is_empty() {
            bail!("corpus {} has no training sentences", self.corpus.name);
        }
        prepare_output_dir(base_path)?;
        self.tagger.save_metadata(base_path)?;

        let tag_type = self.tagger.config().tag_type.clone();
        let dict = self.tagger.label_dictionary().clone();

        info!(
            corpus = %self.corpus.name,
            train = self.corpus.train.len(),
            dev = self.corpus.dev.len(),
            test = self.corpus.test.len(),
            workers = config.num_workers,
            "pre-encoding corpus"
        );
        let mut train = batch::encode_split(
            self.tagger.embeddings(),
            &self.corpus.train,
            &dict,
            &tag_type,
            config.num_workers,
        )?;
        let dev = batch::encode_split(
            self.tagger.embeddings(),
            &self.corpus.dev,
            &dict,
            &tag_type,
            config.num_workers,
        )?;
        let test = batch::encode_split(
            self.tagger.embeddings(),
            &self.corpus.test,
            &dict,
            &tag_type,
            config.num_workers,
        )?;

        let batches_per_epoch = train.len().div_ceil(config.mini_batch_size);
        let total_steps = config.max_epochs * batches_per_epoch;

        let mut optimizer = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;

        info!(
            lr = config.learning_rate,
            batch_size = config.mini_batch_size,
            epochs = config.max_epochs,
            total_steps,
            "starting fine-tuning"
        );

        let mut best_f1 = f64::NEG_INFINITY;
        let mut last_dev: Option<EvaluationResult> = None;
        let mut step = 0usize;

        for epoch in 1..=config.max_epochs {
            if config.shuffle {
                batch::shuffle(&mut train, config.seed.wrapping_add(epoch as u64));
            }

            let mut epoch_loss = 0.0f64;
            let mut batches = 0usize;
            for chunk in train.chunks(config.mini_batch_size) {
                let lr = linear_schedule(
                    config.learning_rate,
                    step,
                    total_steps,
                    config.warmup_fraction,
                );
                optimizer.set_learning_rate(lr);

                let sentences: Vec<_> = chunk.iter().map(|e| &e.encoded).collect();
                let tags: Vec<Vec<u32>> = chunk.iter().map(|e| e.tags.clone()).collect();
                let loss = self.tagger.forward_loss(&sentences, &tags)?;
                optimizer.backward_step(&loss)?;

                epoch_loss += loss.to_scalar::<f32>()? as f64;
                batches += 1;
                step += 1;

                if batches % 100 == 0 {
                    info!(
                        epoch,
                        batch = batches,
                        of = batches_per_epoch,
                        lr,
                        avg_loss = epoch_loss / batches as f64,
                        "progress"
                    );
                }
            }

            let avg_loss = epoch_loss / batches.max(1) as f64;
            info!(epoch, avg_loss, "epoch complete");

            if !dev.is_empty() {
                let result = self.evaluate_split(&dev, config.mini_batch_size)?;
                info!(
                    epoch,
                    f1 = result.f1,
                    precision = result.precision,
                    recall = result.recall,
                    "dev evaluation"
                );
                if result.f1 > best_f1 {
                    best_f1 = result.f1;
                    self.save_checkpoint(base_path, "best-model.safetensors")?;
                    info!(epoch, f1 = result.f1, "new best model saved");
                }
                last_dev = Some(result);
            }
        }

        if config.save_final_model {
            self.save_checkpoint(base_path, "final-model.safetensors")?;
        }

        let result = if test.is_empty() {
            warn!("corpus has no test split, reporting last dev result");
            last_dev.unwrap_or_else(|| {
                warn!("no dev split either, reporting empty result");
                EvaluationResult {
                    precision: 0.0,
                    recall: 0.0,
                    f1: 0.0,
                    accuracy: 0.0,
                    true_positives: 0,
                    false_positives: 0,
                    false_negatives: 0,
                }
            })
        } else {
            let result = self.evaluate_split(&test, config.mini_batch_size)?;
            info!(
                f1 = result.f1,
                precision = result.precision,
                recall = result.recall,
                accuracy = result.accuracy,
                "test evaluation"
            );
            result
        };

        let report = serde_json::to_string_pretty(&result)?;
        fs::write(base_path.join("test-results.json"), report)?;

        Ok(result)
    }

    fn evaluate_split(
        &self,
        examples: &[EncodedExample],
        batch_size: usize,
    ) -> Result<EvaluationResult> {
        evaluate(&self.tagger, examples, batch_size)
    }

    fn save_checkpoint(&self, base_path: &Path, file: &str) -> Result<PathBuf> {
        let path = base_path.join(file);
        self.varmap
            .save(&path)
            .with_context(|| format!("cannot save checkpoint {}", path.display()))?;
        Ok(path)
    }
}

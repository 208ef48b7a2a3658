//! Fine-tune a FLERT-style NER tagger on CoNLL-03.
//!
//! The defaults reproduce the document-context recipe: XLM-RoBERTa large,
//! final layer only, first-subtoken pooling, no CRF, no RNN, no
//! reprojection, lr 5e-6, batch size 4.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use clap::Parser;
use fuda_core::embeddings::{TransformerEmbeddingsConfig, TransformerWordEmbeddings};
use fuda_core::tagger::{SequenceTagger, SequenceTaggerConfig};
use fuda_trainer::fetch::{self, Dataset};
use fuda_trainer::trainer::{FineTuneConfig, ModelTrainer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "train", about = "Fine-tune a transformer NER tagger")]
struct Args {
    /// Cache root for datasets and models (defaults to the user data dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Encoder model id on the HF hub, or a local directory.
    #[arg(long, default_value = "xlm-roberta-large")]
    model: String,

    /// Where checkpoints and results are written.
    #[arg(long, default_value = "resources/taggers/sota-ner-flert")]
    output: PathBuf,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 5e-6)]
    learning_rate: f64,

    #[arg(long, default_value_t = 4)]
    mini_batch_size: usize,

    /// Threads used to pre-encode corpus splits.
    #[arg(long, default_value_t = 12)]
    num_workers: usize,

    /// Force CPU even when a GPU is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0).context("cannot initialize compute device")?
    };
    info!(?device, "device selected");

    // 1. get the corpus
    let corpus = fetch::load_dataset(Dataset::Conll03, args.data_dir.as_deref())?;
    println!("{corpus}");

    // 2. what label do we want to predict?
    let tag_type = "ner";

    // 3. make the label dictionary from the corpus
    let label_dict = corpus.make_label_dictionary(tag_type)?;
    println!("{label_dict}");

    // 4. initialize fine-tuneable transformer embeddings with document context
    let varmap = VarMap::new();
    let model_dir = fetch::model_dir(&args.model, args.data_dir.as_deref())?;
    let embeddings = TransformerWordEmbeddings::load(
        &model_dir,
        TransformerEmbeddingsConfig {
            model: args.model.clone(),
            ..Default::default()
        },
        Some(&varmap),
        &device,
    )?;

    // 5. initialize bare-bones sequence tagger (no CRF, no RNN, no reprojection)
    let tagger = SequenceTagger::new(
        embeddings,
        label_dict,
        SequenceTaggerConfig {
            tag_type: tag_type.to_string(),
            ..Default::default()
        },
        &varmap,
    )?;

    // 6. run fine-tuning
    let mut trainer = ModelTrainer::new(tagger, corpus, varmap);
    let result = trainer.fine_tune(
        &args.output,
        &FineTuneConfig {
            learning_rate: args.learning_rate,
            mini_batch_size: args.mini_batch_size,
            max_epochs: args.epochs,
            num_workers: args.num_workers,
            ..Default::default()
        },
    )?;

    info!(
        f1 = result.f1,
        precision = result.precision,
        recall = result.recall,
        "training finished"
    );
    Ok(())
}

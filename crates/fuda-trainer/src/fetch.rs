//! # Dataset and Model Fetching
//!
//! Resolves benchmark corpora and pretrained encoder files into a local
//! cache. Freely redistributable datasets are downloaded on first use;
//! license-restricted ones must be placed in the cache manually and fail
//! with instructions otherwise. Downloads are atomic: temp file, then
//! rename, so an interrupted run never leaves a truncated artifact behind.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fuda_core::corpus::{ColumnFormat, Corpus, read_file};
use tracing::info;

/// A benchmark corpus known to the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    /// CoNLL-03 English NER (four columns: text, POS, chunk, NER; IOB1).
    Conll03,
    /// WNUT-17 emerging entities (two tab-separated columns).
    Wnut17,
}

/// One train/dev/test file of a dataset and where it comes from.
struct SplitSource {
    file: &'static str,
    url: Option<&'static str>,
}

impl Dataset {
    /// Cache directory name.
    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Conll03 => "conll_03",
            Dataset::Wnut17 => "wnut_17",
        }
    }

    fn column_format(&self) -> ColumnFormat {
        match self {
            Dataset::Conll03 => ColumnFormat::new([(1, "pos"), (2, "chunk"), (3, "ner")]),
            Dataset::Wnut17 => ColumnFormat::new([(1, "ner")]).with_separator('\t'),
        }
    }

    /// NER annotation scheme of the raw files is IOB1 (needs conversion).
    fn is_iob1(&self) -> bool {
        matches!(self, Dataset::Conll03)
    }

    fn splits(&self) -> [SplitSource; 3] {
        match self {
            Dataset::Conll03 => [
                SplitSource {
                    file: "eng.train",
                    url: None,
                },
                SplitSource {
                    file: "eng.testa",
                    url: None,
                },
                SplitSource {
                    file: "eng.testb",
                    url: None,
                },
            ],
            Dataset::Wnut17 => [
                SplitSource {
                    file: "wnut17train.conll",
                    url: Some("https://noisy-text.github.io/2017/files/wnut17train.conll"),
                },
                SplitSource {
                    file: "emerging.dev.conll",
                    url: Some("https://noisy-text.github.io/2017/files/emerging.dev.conll"),
                },
                SplitSource {
                    file: "emerging.test.annotated",
                    url: Some(
                        "https://noisy-text.github.io/2017/files/emerging.test.annotated",
                    ),
                },
            ],
        }
    }
}

/// Root of the local cache (`<data dir>/fuda`).
pub fn cache_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fuda")
}

/// Load a dataset into a [`Corpus`], downloading or validating its files
/// under `<root>/datasets/<name>/` first.
pub fn load_dataset(dataset: Dataset, root: Option<&Path>) -> Result<Corpus> {
    let root = root.map(Path::to_path_buf).unwrap_or_else(cache_root);
    let dir = root.join("datasets").join(dataset.name());
    fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create dataset cache {}", dir.display()))?;

    let format = dataset.column_format();
    let mut splits = Vec::with_capacity(3);
    for source in dataset.splits() {
        let path = ensure_file(&dir, source.file, source.url)?;
        splits.push(read_file(&path, &format)?);
    }
    let mut splits = splits.into_iter();
    let (train, dev, test) = (
        splits.next().unwrap_or_default(),
        splits.next().unwrap_or_default(),
        splits.next().unwrap_or_default(),
    );

    let mut corpus = Corpus::new(dataset.name(), train, dev, test);
    if dataset.is_iob1() {
        corpus.normalize_to_iob2("ner");
    }
    Ok(corpus)
}

/// Resolve an encoder model id to a local directory holding `config.json`,
/// `tokenizer.json` and `model.safetensors`.
///
/// An existing directory path is used as-is; otherwise the files are cached
/// under `<root>/models/<id>/` and fetched from the HF hub when missing.
pub fn model_dir(model: &str, root: Option<&Path>) -> Result<PathBuf> {
    let as_path = Path::new(model);
    if as_path.is_dir() {
        return Ok(as_path.to_path_buf());
    }

    let root = root.map(Path::to_path_buf).unwrap_or_else(cache_root);
    let dir = root.join("models").join(sanitize_model_id(model));
    fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create model cache {}", dir.display()))?;

    for file in ["config.json", "tokenizer.json", "model.safetensors"] {
        let url = format!("https://huggingface.co/{model}/resolve/main/{file}");
        ensure_file(&dir, file, Some(&url))?;
    }
    Ok(dir)
}

/// Model ids contain `/`; flatten them for use as a directory name.
fn sanitize_model_id(model: &str) -> String {
    model.replace(['/', '\\'], "--")
}

/// Return the path of `file` under `dir`, downloading it when absent.
/// Files without a source URL must be placed manually.
fn ensure_file(dir: &Path, file: &str, url: Option<&str>) -> Result<PathBuf> {
    let path = dir.join(file);
    if path.exists() {
        return Ok(path);
    }

    let Some(url) = url else {
        bail!(
            "{} is not present and cannot be downloaded automatically \
             (license-restricted); place the file at {} and re-run",
            file,
            path.display()
        );
    };

    info!(url, dest = %path.display(), "downloading");
    let bytes = block_on_download(url)
        .with_context(|| format!("failed to download {url}"))?;

    let tmp = dir.join(format!("{file}.partial"));
    fs::write(&tmp, &bytes)
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("cannot move {} into place", tmp.display()))?;

    info!(dest = %path.display(), size = bytes.len(), "download complete");
    Ok(path)
}

fn block_on_download(url: &str) -> Result<Vec<u8>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start download runtime")?;
    runtime.block_on(async {
        let response = reqwest::get(url).await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fuda-fetch-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn existing_file_is_reused_without_a_url() {
        let dir = temp_dir("reuse");
        let mut f = fs::File::create(dir.join("eng.train")).unwrap();
        f.write_all(b"EU NNP B-NP B-ORG\n").unwrap();

        let path = ensure_file(&dir, "eng.train", None).unwrap();
        assert!(path.ends_with("eng.train"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn restricted_file_missing_gives_instructions() {
        let dir = temp_dir("missing");
        let err = ensure_file(&dir, "eng.train", None).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("eng.train"));
        assert!(message.contains("place the file"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn conll03_without_files_fails_rather_than_downloading() {
        let root = temp_dir("conll-root");
        let err = load_dataset(Dataset::Conll03, Some(&root)).unwrap_err();
        assert!(err.to_string().contains("license-restricted"));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn conll03_loads_and_normalizes_from_local_files() {
        let root = temp_dir("conll-ok");
        let dir = root.join("datasets").join("conll_03");
        fs::create_dir_all(&dir).unwrap();
        // IOB1 annotation: entity at sentence start uses I-.
        fs::write(dir.join("eng.train"), "EU NNP B-NP I-ORG\nrejects VBZ B-VP O\n").unwrap();
        fs::write(dir.join("eng.testa"), "BRUSSELS NNP B-NP I-LOC\n").unwrap();
        fs::write(dir.join("eng.testb"), "Japan NNP B-NP I-LOC\n").unwrap();

        let corpus = load_dataset(Dataset::Conll03, Some(&root)).unwrap();
        assert_eq!(corpus.train.len(), 1);
        assert_eq!(corpus.train[0].tag_sequence("ner"), vec!["B-ORG", "O"]);
        assert_eq!(corpus.dev[0].tag_sequence("ner"), vec!["B-LOC"]);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn model_id_sanitization() {
        assert_eq!(sanitize_model_id("xlm-roberta-large"), "xlm-roberta-large");
        assert_eq!(
            sanitize_model_id("FacebookAI/xlm-roberta-large"),
            "FacebookAI--xlm-roberta-large"
        );
    }

    #[test]
    fn local_model_directory_is_used_directly() {
        let dir = temp_dir("model-dir");
        let resolved = model_dir(dir.to_str().unwrap(), None).unwrap();
        assert_eq!(resolved, dir);
        fs::remove_dir_all(&dir).ok();
    }
}

//! Binary checkpoint of a finished run, for tooling that wants both
//! matrices and the counted vocabulary without reparsing text tables.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::table::Table;
use crate::Real;

#[derive(Debug, Serialize, Deserialize)]
pub struct Model {
    pub dim: usize,
    pub ctxs: usize,
    /// Tokens with their corpus counts, in index order.
    pub vocab: Vec<(String, u64)>,
    /// Center embeddings, row-major with a `dim` stride.
    pub embeddings: Vec<Real>,
    /// Context embeddings, same layout.
    pub ctx_embeddings: Vec<Real>,
}

impl Model {
    pub fn from_training(
        dim: usize,
        ctxs: usize,
        ordered: &[String],
        freqs: &HashMap<String, u64>,
        table: &Table,
        ctx: &Table,
    ) -> Model {
        Model {
            dim,
            ctxs,
            vocab: ordered
                .iter()
                .map(|t| (t.clone(), freqs.get(t).copied().unwrap_or(0)))
                .collect(),
            embeddings: table.snapshot(),
            ctx_embeddings: ctx.snapshot(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let out = BufWriter::new(
            File::create(path)
                .with_context(|| format!("could not create model file '{}'", path.display()))?,
        );
        bincode::serialize_into(out, self)
            .with_context(|| format!("failed to write model to '{}'", path.display()))
    }

    pub fn load(path: &Path) -> Result<Model> {
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("failed to open model file '{}'", path.display()))?,
        );
        let model: Model = bincode::deserialize_from(file)
            .with_context(|| format!("failed to load model from '{}'", path.display()))?;

        let rows = model.vocab.len();
        anyhow::ensure!(
            model.embeddings.len() == rows * model.dim,
            "invalid model: embedding array length {} must be vocab size {rows} times dimension {}",
            model.embeddings.len(),
            model.dim,
        );
        anyhow::ensure!(
            model.ctx_embeddings.len() == rows * model.dim,
            "invalid model: context array length {} must be vocab size {rows} times dimension {}",
            model.ctx_embeddings.len(),
            model.dim,
        );
        Ok(model)
    }

    /// Center vector for word index `w`.
    pub fn vector(&self, w: usize) -> &[Real] {
        &self.embeddings[w * self.dim..][..self.dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> Model {
        let table = Table::new(2, 3);
        let ctx = Table::new(2, 3);
        table.set_row(0, &[1.0, 2.0, 3.0]);
        table.set_row(1, &[4.0, 5.0, 6.0]);
        let ordered = vec!["hello".to_owned(), "world".to_owned()];
        let freqs: HashMap<String, u64> = [("hello".to_owned(), 7), ("world".to_owned(), 3)].into();
        Model::from_training(3, 5, &ordered, &freqs, &table, &ctx)
    }

    #[test]
    fn save_then_load_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.model");
        let model = sample_model();
        model.save(&path).unwrap();

        let loaded = Model::load(&path).unwrap();
        assert_eq!(loaded.dim, 3);
        assert_eq!(loaded.vocab, model.vocab);
        assert_eq!(loaded.embeddings, model.embeddings);
        assert_eq!(loaded.vector(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn load_rejects_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.model");
        std::fs::write(&path, b"\x01\x02\x03").unwrap();
        assert!(Model::load(&path).is_err());
    }
}

//! Shared embedding matrices.
//!
//! Worker threads update rows concurrently without locks; learning
//! tolerates the resulting lost or interleaved updates. Every write is a
//! single relaxed store of one scalar cell, so a row update is `dim`
//! independent stores and readers never see torn floats.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use aligned_box::AlignedBox;
use anyhow::{bail, ensure, Context, Result};
use rand::Rng;

use crate::reader::{self, ReadMode};
use crate::vocab::Vocab;
use crate::{Real, Word};

#[cfg(not(feature = "gradcheck"))]
use std::sync::atomic::AtomicU32 as AtomicBits;
#[cfg(feature = "gradcheck")]
use std::sync::atomic::AtomicU64 as AtomicBits;
use std::sync::atomic::Ordering;

/// One embedding entry, stored as atomic bits so concurrent Hogwild
/// writes stay individual scalar stores.
#[derive(Default)]
#[repr(transparent)]
pub struct Cell {
    bits: AtomicBits,
}

impl Cell {
    pub fn get(&self) -> Real {
        Real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: Real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: Real) {
        self.set(self.get() + x);
    }

    pub fn sub(&self, x: Real) {
        self.set(self.get() - x);
    }
}

/// A vocabulary-sized embedding matrix: one `dim`-length row per word,
/// flat and 128-byte aligned.
pub struct Table {
    cells: AlignedBox<[Cell]>,
    dim: usize,
}

impl Table {
    pub fn new(rows: usize, dim: usize) -> Self {
        let cells =
            AlignedBox::slice_from_default(128, rows * dim).expect("embedding allocation failed");
        Table { cells, dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn rows(&self) -> usize {
        self.cells.len() / self.dim
    }

    pub fn row(&self, w: Word) -> &[Cell] {
        &self.cells[w as usize * self.dim..][..self.dim]
    }

    /// Fill every entry with a uniform draw from `[-0.5/dim, 0.5/dim)`.
    pub fn randomize<R: Rng>(&self, rng: &mut R) {
        let dim = self.dim as Real;
        for cell in self.cells.iter() {
            cell.set((rng.random::<Real>() - 0.5) / dim);
        }
    }

    pub fn set_row(&self, w: Word, values: &[Real]) {
        assert_eq!(values.len(), self.dim);
        for (cell, &v) in self.row(w).iter().zip(values) {
            cell.set(v);
        }
    }

    /// Copy the whole matrix out. Only meaningful once workers have
    /// joined.
    pub fn snapshot(&self) -> Vec<Real> {
        self.cells.iter().map(Cell::get).collect()
    }

    pub fn load_snapshot(&self, values: &[Real]) {
        assert_eq!(values.len(), self.cells.len());
        for (cell, &v) in self.cells.iter().zip(values) {
            cell.set(v);
        }
    }
}

pub fn dot(a: &[Cell], b: &[Cell]) -> Real {
    a.iter().zip(b).map(|(x, y)| x.get() * y.get()).sum()
}

pub fn dot_mixed(v: &[Real], cells: &[Cell]) -> Real {
    v.iter().zip(cells).map(|(x, y)| x * y.get()).sum()
}

/// Write the embedding table as text, one `TOKEN v1 .. vd` row per
/// vocabulary entry in index order.
pub fn save_embeddings(path: &Path, vocab: &Vocab, table: &Table) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("could not create embedding file '{}'", path.display()))?;
    let mut out = BufWriter::new(file);
    for (w, token) in vocab.iter().enumerate() {
        write!(out, "{token}").context("error writing embedding file")?;
        for cell in table.row(w as Word) {
            write!(out, " {}", cell.get()).context("error writing embedding file")?;
        }
        writeln!(out).context("error writing embedding file")?;
    }
    out.flush().context("error writing embedding file")?;
    Ok(())
}

/// Load a pretrained embedding table: `TOKEN v1 .. vd` per line. Vector
/// lengths must match `dim` and duplicate tokens are rejected.
pub fn load_pretrained(
    path: &Path,
    mode: ReadMode,
    dim: usize,
    strict: bool,
) -> Result<HashMap<String, Vec<Real>>> {
    let mut pretrained: HashMap<String, Vec<Real>> = HashMap::new();
    reader::for_each_line(
        std::slice::from_ref(&PathBuf::from(path)),
        mode,
        strict,
        |line| {
            let line = String::from_utf8_lossy(line);
            let mut fields = line.split(' ').filter(|f| !f.is_empty());
            let token = match fields.next() {
                Some(t) => t.to_owned(),
                None => return Ok(()), // blank line
            };
            let vector: Vec<Real> = fields
                .map(|f| {
                    f.parse::<Real>()
                        .with_context(|| format!("bad number '{f}' in pretrained table"))
                })
                .collect::<Result<_>>()?;
            ensure!(
                vector.len() == dim,
                "pretrained vector for '{token}' has {} dimensions, expected {dim}",
                vector.len()
            );
            if pretrained.insert(token.clone(), vector).is_some() {
                bail!("pretrained table has duplicate entries for '{token}'");
            }
            Ok(())
        },
    )?;
    Ok(pretrained)
}

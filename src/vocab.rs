//! Token/index bookkeeping and the on-disk vocabulary artifact.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::reader::{self, ReadMode};
use crate::{Word, UNK_TOKEN};

/// Insertion-ordered set of unique tokens with a token -> index map.
/// After the driver assembles the vocabulary, insertion order is
/// descending-frequency order (with the UNK sentinel pinned at 0 when
/// present), and the map never changes again.
#[derive(Default)]
pub struct Vocab {
    k2i: HashMap<String, Word>,
    i2k: Vec<String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `token` if absent. Returns its index either way.
    pub fn insert(&mut self, token: &str) -> Word {
        if let Some(&w) = self.k2i.get(token) {
            return w;
        }
        let w = self.i2k.len() as Word;
        self.k2i.insert(token.to_owned(), w);
        self.i2k.push(token.to_owned());
        w
    }

    pub fn get(&self, token: &str) -> Option<Word> {
        self.k2i.get(token).copied()
    }

    pub fn lookup(&self, token: &str) -> Result<Word> {
        self.get(token)
            .with_context(|| format!("token '{token}' is not in the vocabulary"))
    }

    pub fn reverse_lookup(&self, w: Word) -> Result<&str> {
        self.i2k
            .get(w as usize)
            .map(String::as_str)
            .with_context(|| format!("word index {w} is out of range"))
    }

    pub fn contains(&self, token: &str) -> bool {
        self.k2i.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.i2k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i2k.is_empty()
    }

    /// Tokens in index order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.i2k.iter().map(String::as_str)
    }
}

/// Write `TOKEN COUNT` lines in vocabulary order.
pub fn save_vocab_file(
    path: &Path,
    ordered: &[String],
    freqs: &HashMap<String, u64>,
) -> Result<()> {
    use std::io::Write;
    let file = std::fs::File::create(path)
        .with_context(|| format!("could not create vocab file '{}'", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    for token in ordered {
        writeln!(out, "{token} {}", freqs[token]).context("error writing vocab file")?;
    }
    out.flush().context("error writing vocab file")?;
    Ok(())
}

/// Read a vocabulary artifact back, enforcing its format: two columns per
/// line, counts in non-increasing order, and the UNK sentinel legal only
/// as the very first line.
pub fn load_vocab_file(path: &Path) -> Result<(Vec<String>, HashMap<String, u64>)> {
    let mut ordered: Vec<String> = Vec::new();
    let mut freqs: HashMap<String, u64> = HashMap::new();
    let mut last = u64::MAX;

    reader::for_each_line(std::slice::from_ref(&path.to_path_buf()), ReadMode::Text, true, |line| {
        let line = String::from_utf8_lossy(line);
        let fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
        ensure!(
            fields.len() == 2,
            "unexpected number of columns in vocab file '{}'",
            path.display()
        );
        let token = fields[0];
        let count: u64 = fields[1]
            .parse()
            .with_context(|| format!("bad frequency '{}' in vocab file", fields[1]))?;
        if token == UNK_TOKEN {
            ensure!(
                ordered.is_empty(),
                "only the first line of a vocab file can be {UNK_TOKEN}"
            );
        } else {
            ensure!(
                count <= last,
                "vocab file must be in descending frequency order \
                 (except for {UNK_TOKEN}, which must be the first line if present)"
            );
            last = count;
        }
        if freqs.insert(token.to_owned(), count).is_some() {
            bail!("duplicate token '{token}' in vocab file");
        }
        ordered.push(token.to_owned());
        Ok(())
    })?;

    Ok((ordered, freqs))
}

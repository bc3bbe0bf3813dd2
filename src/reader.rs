//! Streaming corpus input: line sources (plain or gzipped), tokenization
//! against a frozen vocabulary, and the two batch readers the driver
//! loops over.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use flate2::bufread::MultiGzDecoder;

use crate::vocab::Vocab;
use crate::{Sentence, Sentences, Word, UNK_TOKEN};

/// Longest line the readers will hold in memory at once.
pub const MAX_LINE_LEN: usize = 1_000_000;

/// How to decode training files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Treat every file as plain text.
    Text,
    /// Treat every file as gzip.
    Gzip,
    /// Gzip for `*.gz`, plain text otherwise.
    Auto,
}

fn open_source(path: &Path, mode: ReadMode) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).with_context(|| {
        format!(
            "could not open input file '{}' -- make sure it exists",
            path.display()
        )
    })?;
    let is_gz = path.extension().and_then(|e| e.to_str()) == Some("gz");
    Ok(match mode {
        ReadMode::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))),
        ReadMode::Auto if is_gz => {
            Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file))))
        }
        _ => Box::new(BufReader::new(file)),
    })
}

/// Reads newline-terminated lines with a fixed length cap. In strict mode
/// an overlong line is an error; otherwise it is truncated to the cap and
/// the rest of the physical line is discarded.
struct LineReader {
    src: Box<dyn BufRead + Send>,
    strict: bool,
    path: PathBuf,
}

impl LineReader {
    fn open(path: &Path, mode: ReadMode, strict: bool) -> Result<Self> {
        Ok(LineReader {
            src: open_source(path, mode)?,
            strict,
            path: path.to_path_buf(),
        })
    }

    /// Fill `buf` with the next line, without its newline. Returns false
    /// at end of input.
    fn next_line(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let n = (&mut self.src)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', buf)
            .with_context(|| format!("error reading '{}'", self.path.display()))?;
        if n == 0 {
            return Ok(false);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            return Ok(true);
        }
        if n < MAX_LINE_LEN {
            // Final line with no trailing newline.
            return Ok(true);
        }
        if self.strict {
            bail!(
                "a line in input file '{}' is longer than {MAX_LINE_LEN} characters",
                self.path.display()
            );
        }
        self.skip_rest_of_line()?;
        Ok(true)
    }

    fn skip_rest_of_line(&mut self) -> Result<()> {
        loop {
            let chunk = self
                .src
                .fill_buf()
                .with_context(|| format!("error reading '{}'", self.path.display()))?;
            if chunk.is_empty() {
                return Ok(());
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.src.consume(i + 1);
                    return Ok(());
                }
                None => {
                    let len = chunk.len();
                    self.src.consume(len);
                }
            }
        }
    }
}

/// Apply `f` to every line of every file in order. Used for the vocabulary
/// scan and for loading the auxiliary table files.
pub fn for_each_line<F>(paths: &[PathBuf], mode: ReadMode, strict: bool, mut f: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut buf = Vec::with_capacity(256);
    for path in paths {
        let mut lines = LineReader::open(path, mode, strict)?;
        while lines.next_line(&mut buf)? {
            f(&buf)?;
        }
    }
    Ok(())
}

/// Split a line on ASCII space and map tokens to indices. Unknown tokens
/// are dropped, or replaced with `unk` when one is given.
pub fn parse_sentence(vocab: &Vocab, unk: Option<Word>, line: &[u8]) -> Sentence {
    let mut sentence = Sentence::new();
    for token in line.split(|&b| b == b' ') {
        if token.is_empty() {
            continue;
        }
        let token = String::from_utf8_lossy(token);
        match vocab.get(token.as_ref()) {
            Some(w) => sentence.push(w),
            None => {
                if let Some(u) = unk {
                    sentence.push(u);
                }
            }
        }
    }
    sentence
}

fn resolve_unk(vocab: &Vocab, discard: bool) -> Result<Option<Word>> {
    if discard {
        Ok(None)
    } else {
        Ok(Some(vocab.lookup(UNK_TOKEN)?))
    }
}

/// Produces batches of index sequences until an epoch's worth of corpus
/// has been handed out, then reports false exactly once so a
/// `while reader.get_next(&mut batch)? { .. }` loop ends the epoch.
pub trait CorpusReader {
    fn get_next(&mut self, out: &mut Sentences) -> Result<bool>;
}

/// Reader for corpora that fit in memory: the first call hands out
/// everything, and from then on the return value alternates so the driver
/// can re-iterate the same batch across epochs.
pub struct OnceReader {
    vocab: Arc<Vocab>,
    paths: Vec<PathBuf>,
    mode: ReadMode,
    strict: bool,
    unk: Option<Word>,
    read: bool,
    pretend_eof: bool,
}

impl OnceReader {
    pub fn new(
        vocab: Arc<Vocab>,
        paths: Vec<PathBuf>,
        discard: bool,
        mode: ReadMode,
        strict: bool,
    ) -> Result<Self> {
        let unk = resolve_unk(&vocab, discard)?;
        Ok(OnceReader {
            vocab,
            paths,
            mode,
            strict,
            unk,
            read: false,
            pretend_eof: false,
        })
    }
}

impl CorpusReader for OnceReader {
    fn get_next(&mut self, out: &mut Sentences) -> Result<bool> {
        if !self.read {
            for_each_line(&self.paths, self.mode, self.strict, |line| {
                out.push(parse_sentence(&self.vocab, self.unk, line));
                Ok(())
            })?;
            self.read = true;
        }
        self.pretend_eof = !self.pretend_eof;
        Ok(self.pretend_eof)
    }
}

struct Fill {
    sentences: Sentences,
    /// Whether this fill consumed the last file's end of input.
    eofs: bool,
    producer: Producer,
}

struct Producer {
    vocab: Arc<Vocab>,
    paths: Vec<PathBuf>,
    mode: ReadMode,
    strict: bool,
    unk: Option<Word>,
    buffer_size: usize,
    lines: LineReader,
    path_idx: usize,
}

impl Producer {
    /// Read up to `buffer_size` sentences from the current position. A
    /// fill never crosses a file boundary: hitting end of file reopens
    /// the next one (wrapping past the last) and ends the fill.
    fn fill(mut self) -> Result<Fill> {
        let mut sentences = Sentences::with_capacity(self.buffer_size);
        let mut eofs = false;
        let mut buf = Vec::with_capacity(256);
        while sentences.len() < self.buffer_size {
            if self.lines.next_line(&mut buf)? {
                sentences.push(parse_sentence(&self.vocab, self.unk, &buf));
            } else {
                self.path_idx = (self.path_idx + 1) % self.paths.len();
                if self.path_idx == 0 {
                    eofs = true;
                }
                self.lines = LineReader::open(&self.paths[self.path_idx], self.mode, self.strict)?;
                break;
            }
        }
        Ok(Fill {
            sentences,
            eofs,
            producer: self,
        })
    }
}

/// Reader that keeps a background thread filling the next batch while the
/// current one is being trained on. Streams continuously across epochs by
/// wrapping back to the first file; the per-epoch stop comes from the
/// single false returned on the call after an end-of-corpus fill.
pub struct ThreadedReader {
    pending: Option<JoinHandle<Result<Fill>>>,
    eofs_prev: bool,
}

impl ThreadedReader {
    pub fn new(
        vocab: Arc<Vocab>,
        paths: Vec<PathBuf>,
        buffer_size: usize,
        discard: bool,
        mode: ReadMode,
        strict: bool,
    ) -> Result<Self> {
        let unk = resolve_unk(&vocab, discard)?;
        let lines = LineReader::open(&paths[0], mode, strict)?;
        let producer = Producer {
            vocab,
            paths,
            mode,
            strict,
            unk,
            buffer_size,
            lines,
            path_idx: 0,
        };
        let mut reader = ThreadedReader {
            pending: None,
            eofs_prev: false,
        };
        reader.launch(producer);
        Ok(reader)
    }

    fn launch(&mut self, producer: Producer) {
        self.pending = Some(std::thread::spawn(move || producer.fill()));
    }

    fn join(&mut self) -> Result<Fill> {
        self.pending
            .take()
            .expect("corpus producer not running")
            .join()
            .map_err(|_| anyhow!("corpus producer thread panicked"))?
    }
}

impl CorpusReader for ThreadedReader {
    fn get_next(&mut self, out: &mut Sentences) -> Result<bool> {
        // Return false when we could not read at the *current* call,
        // which means the previous call's fill ran out of corpus.
        if self.eofs_prev {
            self.eofs_prev = false;
            return Ok(false);
        }
        let fill = self.join()?;
        self.eofs_prev = fill.eofs;
        *out = fill.sentences;
        // Hand the batch out and immediately start filling the next one.
        self.launch(fill.producer);
        Ok(true)
    }
}

impl Drop for ThreadedReader {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn abc_vocab() -> Arc<Vocab> {
        let mut v = Vocab::new();
        for t in ["a", "b", "c"] {
            v.insert(t);
        }
        Arc::new(v)
    }

    #[test]
    fn parse_drops_oov_in_discard_mode() {
        let v = abc_vocab();
        assert_eq!(parse_sentence(&v, None, b"a x b  c"), vec![0, 1, 2]);
        assert_eq!(parse_sentence(&v, None, b"x y"), Vec::<Word>::new());
    }

    #[test]
    fn parse_replaces_oov_with_unk() {
        let mut v = Vocab::new();
        v.insert(UNK_TOKEN);
        v.insert("a");
        assert_eq!(parse_sentence(&v, Some(0), b"a x a"), vec![1, 0, 1]);
    }

    #[test]
    fn once_reader_alternates() {
        let f = fixture("a b\nb c\nc\n");
        let mut reader = OnceReader::new(
            abc_vocab(),
            vec![f.path().to_path_buf()],
            true,
            ReadMode::Text,
            false,
        )
        .unwrap();

        let mut batch = Sentences::new();
        assert!(reader.get_next(&mut batch).unwrap());
        assert_eq!(batch, vec![vec![0, 1], vec![1, 2], vec![2]]);
        assert!(!reader.get_next(&mut batch).unwrap());
        assert!(reader.get_next(&mut batch).unwrap());
        assert_eq!(batch.len(), 3, "batch survives across epochs");
        assert!(!reader.get_next(&mut batch).unwrap());
    }

    #[test]
    fn threaded_reader_signals_epoch_end_once() {
        let f = fixture("a\nb\nc\n");
        let mut reader = ThreadedReader::new(
            abc_vocab(),
            vec![f.path().to_path_buf()],
            8,
            true,
            ReadMode::Text,
            false,
        )
        .unwrap();

        let mut batch = Sentences::new();
        assert!(reader.get_next(&mut batch).unwrap());
        assert_eq!(batch, vec![vec![0], vec![1], vec![2]]);
        assert!(!reader.get_next(&mut batch).unwrap());
        // Wraps around and streams the same corpus again.
        assert!(reader.get_next(&mut batch).unwrap());
        assert_eq!(batch, vec![vec![0], vec![1], vec![2]]);
        assert!(!reader.get_next(&mut batch).unwrap());
    }

    #[test]
    fn threaded_reader_small_buffer_partitions_corpus() {
        let f = fixture("a\nb\nc\n");
        let mut reader = ThreadedReader::new(
            abc_vocab(),
            vec![f.path().to_path_buf()],
            2,
            true,
            ReadMode::Text,
            false,
        )
        .unwrap();

        let mut batch = Sentences::new();
        let mut seen = Sentences::new();
        while reader.get_next(&mut batch).unwrap() {
            seen.extend(batch.drain(..));
        }
        assert_eq!(seen, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn threaded_reader_concatenates_files() {
        let f1 = fixture("a\n");
        let f2 = fixture("b\n");
        let mut reader = ThreadedReader::new(
            abc_vocab(),
            vec![f1.path().to_path_buf(), f2.path().to_path_buf()],
            16,
            true,
            ReadMode::Text,
            false,
        )
        .unwrap();

        let mut batch = Sentences::new();
        let mut seen = Sentences::new();
        while reader.get_next(&mut batch).unwrap() {
            seen.extend(batch.drain(..));
        }
        assert_eq!(seen, vec![vec![0], vec![1]]);
    }

    #[test]
    fn empty_sentences_pass_through() {
        let f = fixture("a\n\nb\n");
        let mut reader = OnceReader::new(
            abc_vocab(),
            vec![f.path().to_path_buf()],
            true,
            ReadMode::Text,
            false,
        )
        .unwrap();
        let mut batch = Sentences::new();
        reader.get_next(&mut batch).unwrap();
        assert_eq!(batch, vec![vec![0], vec![], vec![1]]);
    }

    #[test]
    fn long_line_is_an_error_in_strict_mode() {
        let mut content = "a ".repeat(MAX_LINE_LEN / 2 + 8);
        content.push('\n');
        let f = fixture(&content);
        let err = for_each_line(
            &[f.path().to_path_buf()],
            ReadMode::Text,
            true,
            |_| Ok(()),
        );
        assert!(err.is_err());
    }

    #[test]
    fn long_line_is_truncated_in_lenient_mode() {
        let mut content = "a ".repeat(MAX_LINE_LEN / 2 + 8);
        content.push_str("\nb\n");
        let f = fixture(&content);
        let mut lines: Vec<usize> = Vec::new();
        for_each_line(&[f.path().to_path_buf()], ReadMode::Text, false, |line| {
            lines.push(line.len());
            Ok(())
        })
        .unwrap();
        assert_eq!(lines, vec![MAX_LINE_LEN, 1]);
    }

    #[test]
    fn gzip_roundtrip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut f = tempfile::Builder::new().suffix(".gz").tempfile().unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"a b\nc\n").unwrap();
        f.write_all(&enc.finish().unwrap()).unwrap();
        f.flush().unwrap();

        for mode in [ReadMode::Gzip, ReadMode::Auto] {
            let mut seen = Vec::new();
            for_each_line(&[f.path().to_path_buf()], mode, false, |line| {
                seen.push(line.to_vec());
                Ok(())
            })
            .unwrap();
            assert_eq!(seen, vec![b"a b".to_vec(), b"c".to_vec()]);
        }
    }

    #[test]
    fn malformed_gzip_is_an_error() {
        let f = fixture("definitely not gzip\n");
        let err = for_each_line(&[f.path().to_path_buf()], ReadMode::Gzip, false, |_| Ok(()));
        assert!(err.is_err());
    }
}

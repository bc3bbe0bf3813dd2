//! Training orchestration: vocabulary assembly, sampling distributions,
//! the learning-rate schedule, and the parallel batch loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model::Model;
use crate::progress::{self, Progress};
use crate::reader::{self, CorpusReader, OnceReader, ReadMode, ThreadedReader};
use crate::table::{self, Table};
use crate::trainer::{TrainMode, Trainer, TrainerParams, Worker};
use crate::vocab::{self, Vocab};
use crate::{Real, Sentences, Word, BASE_SEED, SHUFFLE_SEED, UNK_TOKEN};

/// Which vocabulary to use when continuing from pretrained embeddings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinueVocab {
    /// Only the pretrained token set.
    Old,
    /// Only tokens discovered in the corpus.
    New,
    /// Both.
    Union,
}

#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub files: Vec<PathBuf>,
    pub dim: usize,
    pub ctxs: usize,
    pub negatives: usize,
    pub init_lr: Real,
    pub min_lr: Real,
    /// Frequency threshold; `None` means 1 (keep everything). Must stay
    /// unset when a vocabulary file is preloaded.
    pub min_count: Option<u64>,
    /// Drop OOV and rare words instead of replacing them with UNK.
    pub discard: bool,
    pub cbow: bool,
    pub use_bad_update: bool,
    pub downsample_threshold: Real,
    pub ns_exponent: Real,
    pub epochs: usize,
    pub start_lr_schedule_epoch: usize,
    /// Scheduling horizon in epochs; 0 means `start + epochs`.
    pub max_lr_schedule_epochs: usize,
    pub vocab_size: Option<usize>,
    pub vocab_load_path: Option<PathBuf>,
    /// Known sentence total when preloading a vocabulary; 0 = unknown.
    pub total_sentences: u64,
    pub threads: usize,
    pub buffer_size: usize,
    pub shuffle: bool,
    pub partitioned: bool,
    pub pretrained_path: Option<PathBuf>,
    pub continue_vocab: ContinueVocab,
    pub read_mode: ReadMode,
    pub enforce_max_line_length: bool,
    pub embedding_path: PathBuf,
    pub model_path: Option<PathBuf>,
    pub no_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            files: Vec::new(),
            dim: 200,
            ctxs: 5,
            negatives: 5,
            init_lr: 0.025,
            min_lr: 1e-4,
            min_count: None,
            discard: true,
            cbow: false,
            use_bad_update: false,
            downsample_threshold: 1e-3,
            ns_exponent: 0.75,
            epochs: 1,
            start_lr_schedule_epoch: 0,
            max_lr_schedule_epochs: 0,
            vocab_size: None,
            vocab_load_path: None,
            total_sentences: 0,
            threads: 1,
            buffer_size: 500_000,
            shuffle: false,
            partitioned: false,
            pretrained_path: None,
            continue_vocab: ContinueVocab::Union,
            read_mode: ReadMode::Auto,
            enforce_max_line_length: false,
            embedding_path: PathBuf::from("embeddings.txt"),
            model_path: None,
            no_progress: false,
        }
    }
}

/// Reject inconsistent or out-of-range configurations before any file is
/// touched.
pub fn validate(config: &TrainConfig) -> Result<()> {
    ensure!(!config.files.is_empty(), "at least one training file is required");
    ensure!(config.epochs > 0, "epochs must be positive");
    ensure!(config.dim > 0, "dim must be positive");
    ensure!(config.ctxs > 0, "context-size must be positive");
    ensure!(config.negatives > 0, "negatives must be positive");
    ensure!(config.threads > 0, "threads must be positive");
    ensure!(config.buffer_size > 0, "buffer-size must be positive");
    ensure!(
        (0.0..=1.0).contains(&config.ns_exponent),
        "ns-exponent must be within [0, 1]"
    );
    if config.max_lr_schedule_epochs != 0 {
        ensure!(
            config.max_lr_schedule_epochs >= config.epochs,
            "max-lr-schedule-epochs must be at least epochs"
        );
        ensure!(
            config.start_lr_schedule_epoch < config.max_lr_schedule_epochs,
            "start-lr-schedule-epoch must be below max-lr-schedule-epochs"
        );
    }
    if config.vocab_load_path.is_some() {
        ensure!(
            config.min_count.is_none(),
            "min-count should not be passed in when preloading a vocabulary"
        );
        ensure!(
            config.vocab_size.is_none(),
            "vocab-size should not be passed in when preloading a vocabulary"
        );
    }
    if config.total_sentences > 0 {
        ensure!(
            config.vocab_load_path.is_some(),
            "total-sentences should not be passed in without a vocabulary file"
        );
    }
    Ok(())
}

/// The vocabulary artifact lives next to the embedding output.
pub fn vocab_artifact_path(embedding_path: &Path) -> PathBuf {
    let mut path = embedding_path.as_os_str().to_owned();
    path.push(".vocab");
    PathBuf::from(path)
}

/// Count token frequencies over the whole corpus. Returns tokens in
/// first-seen order (the tie-break for the frequency sort), their counts,
/// and the number of lines.
fn scan_corpus(config: &TrainConfig) -> Result<(Vec<String>, HashMap<String, u64>, u64)> {
    println!("Building vocab...");
    let started = Instant::now();
    let spinner = progress::scan_spinner("lines", config.no_progress);

    let mut order: Vec<String> = Vec::new();
    let mut freqs: HashMap<String, u64> = HashMap::new();
    let mut lines: u64 = 0;
    reader::for_each_line(
        &config.files,
        config.read_mode,
        config.enforce_max_line_length,
        |line| {
            for token in line.split(|&b| b == b' ') {
                if token.is_empty() {
                    continue;
                }
                let token = String::from_utf8_lossy(token);
                if let Some(count) = freqs.get_mut(token.as_ref()) {
                    *count += 1;
                } else {
                    let token = token.into_owned();
                    order.push(token.clone());
                    freqs.insert(token, 1);
                }
            }
            lines += 1;
            if lines % 10_000 == 0 {
                spinner.set_position(lines);
            }
            Ok(())
        },
    )?;
    spinner.finish_and_clear();
    println!("Done in {}s.", started.elapsed().as_secs());
    Ok((order, freqs, lines))
}

/// Build or load the ordered vocabulary plus its frequency table.
/// Returns `(ordered tokens, freqs, total sentences, discard mode)`.
fn assemble_vocab(
    config: &TrainConfig,
    pretrained: &HashMap<String, Vec<Real>>,
) -> Result<(Vec<String>, HashMap<String, u64>, u64, bool)> {
    if let Some(path) = &config.vocab_load_path {
        println!("Loading vocab file {} ...", path.display());
        let (ordered, freqs) = vocab::load_vocab_file(path)?;
        println!("Done.");
        // Replace-OOV mode is encoded in the artifact by its first line.
        let discard = ordered.first().map_or(true, |t| t != UNK_TOKEN);
        return Ok((ordered, freqs, config.total_sentences, discard));
    }

    let (order, mut freqs, lines) = scan_corpus(config)?;
    let min_count = config.min_count.unwrap_or(1);

    let mut ordered: Vec<String> = Vec::new();
    if !config.discard {
        ordered.push(UNK_TOKEN.to_owned());
        freqs.insert(UNK_TOKEN.to_owned(), 0);
    }

    // Pretrained tokens unseen in the corpus participate with a
    // pseudo-count of min_count when the old vocabulary is kept. Sorted
    // so that runs do not depend on hash order.
    let mut pretrained_tokens: Vec<&String> = pretrained.keys().collect();
    pretrained_tokens.sort();
    let mut unseen: Vec<String> = Vec::new();
    if matches!(config.continue_vocab, ContinueVocab::Old | ContinueVocab::Union) {
        for &token in &pretrained_tokens {
            if !freqs.contains_key(token) {
                freqs.insert(token.clone(), min_count);
                unseen.push(token.clone());
            }
        }
    }

    match config.continue_vocab {
        ContinueVocab::Old if config.pretrained_path.is_some() => {
            for &token in &pretrained_tokens {
                if freqs[token] >= min_count {
                    ordered.push(token.clone());
                }
            }
        }
        _ => {
            for token in &order {
                if freqs[token] >= min_count {
                    ordered.push(token.clone());
                }
            }
            if config.continue_vocab == ContinueVocab::Union {
                ordered.extend(unseen);
            }
        }
    }

    // Keep UNK pinned at index 0 while sorting the rest by frequency.
    let begin = usize::from(!config.discard);
    ordered[begin..].sort_by(|a, b| freqs[b].cmp(&freqs[a]));

    if let Some(limit) = config.vocab_size {
        if ordered.len() > limit {
            ordered.truncate(limit);
        }
    }

    ensure!(
        ordered.len() < Word::MAX as usize,
        "vocab is too big for the word index type; shrink the vocab with --vocab-size or --min-count"
    );

    println!("Saving vocab file...");
    vocab::save_vocab_file(&vocab_artifact_path(&config.embedding_path), &ordered, &freqs)?;
    println!("Done.");

    Ok((ordered, freqs, lines, config.discard))
}

/// Probability of skipping each word while downsampling frequent words.
fn filter_probs(counts: &[u64], total: u64, threshold: Real) -> Vec<Real> {
    let t = threshold as f64;
    counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total as f64;
            (1.0 - (t / p).sqrt() - t / p) as Real
        })
        .collect()
}

/// Negative-sampling distribution: counts raised to `exponent`,
/// normalized to sum to 1.
fn neg_probs(counts: &[u64], exponent: Real) -> Vec<Real> {
    let powered: Vec<f64> = counts
        .iter()
        .map(|&c| (c as f64).powf(exponent as f64))
        .collect();
    let total: f64 = powered.iter().sum();
    powered.iter().map(|&p| (p / total) as Real).collect()
}

/// Linear learning-rate schedule over the whole training horizon. Pinned
/// to `init_lr` when the sentence total is unknown.
fn scheduled_lr(
    init_lr: Real,
    min_lr: Real,
    epoch: usize,
    start_epoch: usize,
    max_epochs: usize,
    sentence_idx: u64,
    total_sentences: u64,
) -> Real {
    if total_sentences == 0 {
        return init_lr;
    }
    let progress = (epoch + start_epoch) as Real / max_epochs as Real
        + (sentence_idx as Real / total_sentences as Real) / max_epochs as Real;
    init_lr - (init_lr - min_lr) * progress
}

/// Live counters the progress renderer reads without touching the
/// training loop.
#[derive(Default)]
pub struct Counters {
    pub sents: AtomicU64,
    pub tokens: AtomicU64,
    pub total_tokens: AtomicU64,
    lr_bits: AtomicU32,
}

impl Counters {
    pub fn set_lr(&self, lr: Real) {
        self.lr_bits.store((lr as f32).to_bits(), Ordering::Relaxed);
    }

    pub fn lr(&self) -> f32 {
        f32::from_bits(self.lr_bits.load(Ordering::Relaxed))
    }
}

/// Run `f(i, slot)` for every `i` in `[0, end)` on one thread per slot,
/// pulling indices from a shared atomic counter.
pub fn parallel_for<S, F>(end: usize, slots: &mut [S], f: F)
where
    S: Send,
    F: Fn(usize, &mut S) + Sync,
{
    let next = AtomicUsize::new(0);
    thread::scope(|scope| {
        for slot in slots.iter_mut() {
            let next = &next;
            let f = &f;
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= end {
                    break;
                }
                f(i, slot);
            });
        }
    });
}

/// Partitioned variant: each thread owns a contiguous chunk up front,
/// the last one absorbing the remainder. No shared counter, but skewed
/// sentence lengths can leave threads idle.
pub fn parallel_for_partitioned<S, F>(end: usize, slots: &mut [S], f: F)
where
    S: Send,
    F: Fn(usize, &mut S) + Sync,
{
    let threads = slots.len();
    let chunk = end / threads;
    thread::scope(|scope| {
        for (tid, slot) in slots.iter_mut().enumerate() {
            let f = &f;
            let lo = tid * chunk;
            let hi = if tid + 1 == threads { end } else { lo + chunk };
            scope.spawn(move || {
                for i in lo..hi {
                    f(i, slot);
                }
            });
        }
    });
}

/// Train end to end: assemble the vocabulary, initialize the matrices,
/// stream the corpus for the configured number of epochs, and write the
/// outputs.
pub fn run(config: TrainConfig) -> Result<()> {
    validate(&config)?;

    let pretrained = match &config.pretrained_path {
        Some(path) => {
            println!("Reading pretrained embeddings...");
            let table = table::load_pretrained(
                path,
                config.read_mode,
                config.dim,
                config.enforce_max_line_length,
            )?;
            println!("Done.");
            table
        }
        None => HashMap::new(),
    };

    let (ordered, mut freqs, total_sentences, discard) = assemble_vocab(&config, &pretrained)?;
    ensure!(
        ordered.len() < Word::MAX as usize,
        "vocab is too big for the word index type; shrink the vocab"
    );

    let mut vocab = Vocab::new();
    for token in &ordered {
        vocab.insert(token);
    }
    ensure!(
        vocab.len() == ordered.len(),
        "vocabulary contains duplicate tokens"
    );

    if !discard {
        freqs.insert(UNK_TOKEN.to_owned(), 0);
    }
    let counts: Vec<u64> = ordered
        .iter()
        .map(|t| freqs.get(t).copied().unwrap_or(0))
        .collect();
    let corpus_tokens: u64 = counts.iter().sum();

    let filter = filter_probs(&counts, corpus_tokens, config.downsample_threshold);
    let neg = neg_probs(&counts, config.ns_exponent);

    let table = Table::new(vocab.len(), config.dim);
    let ctx = Table::new(vocab.len(), config.dim);
    let mut init_rng = StdRng::seed_from_u64(BASE_SEED);
    table.randomize(&mut init_rng);
    ctx.randomize(&mut init_rng);
    for (token, vector) in &pretrained {
        if let Some(w) = vocab.get(token) {
            table.set_row(w, vector);
        }
    }
    drop(pretrained);

    if total_sentences > 0 {
        println!("Total training sentences: {total_sentences}");
    } else {
        eprintln!(
            "WARNING: total number of sentences is unknown, so learning rate \
             scheduling and the progress bar are disabled. Feed it in via \
             --total-sentences when preloading a vocabulary."
        );
    }

    let mut read_whole = false;
    if total_sentences > 0 && config.buffer_size as u64 > total_sentences {
        eprintln!(
            "WARNING: buffer size is larger than the total number of sentences \
             in the corpus -- will load the entire dataset into memory once \
             instead of streaming."
        );
        read_whole = true;
    }

    let params = TrainerParams {
        dim: config.dim,
        ctxs: config.ctxs,
        negatives: config.negatives,
        use_bad_update: config.use_bad_update,
    };
    let trainer = Trainer::new(params, &table, &ctx, filter, neg);
    let mut workers: Vec<Worker> = (0..config.threads)
        .map(|tid| trainer.worker(tid))
        .collect::<Result<_>>()?;
    let mode = if config.cbow {
        TrainMode::Cbow
    } else {
        TrainMode::SkipGram
    };

    let mut shuffle_rng = StdRng::seed_from_u64(SHUFFLE_SEED);
    let counters = Arc::new(Counters::default());

    let vocab = Arc::new(vocab);
    let mut corpus: Box<dyn CorpusReader> = if read_whole {
        Box::new(OnceReader::new(
            vocab.clone(),
            config.files.clone(),
            discard,
            config.read_mode,
            config.enforce_max_line_length,
        )?)
    } else {
        Box::new(ThreadedReader::new(
            vocab.clone(),
            config.files.clone(),
            config.buffer_size,
            discard,
            config.read_mode,
            config.enforce_max_line_length,
        )?)
    };

    let max_epochs = if config.max_lr_schedule_epochs == 0 {
        config.start_lr_schedule_epoch + config.epochs
    } else {
        config.max_lr_schedule_epochs
    };

    let started = Instant::now();
    // The batch lives outside the epoch loop: the whole-in-memory reader
    // hands the same sentences back every other call.
    let mut sentences = Sentences::new();

    for epoch in 0..config.epochs {
        counters.sents.store(0, Ordering::Relaxed);
        counters.tokens.store(0, Ordering::Relaxed);
        let retained_in_epoch = AtomicU64::new(0);
        let seen_in_epoch = AtomicU64::new(0);
        let mut batch_start: u64 = 0;

        println!("Epoch {epoch}");
        let progress = Progress::start(counters.clone(), total_sentences, config.no_progress);

        while corpus.get_next(&mut sentences)? {
            let mut perm: Vec<usize> = (0..sentences.len()).collect();
            if config.shuffle {
                perm.shuffle(&mut shuffle_rng);
            }

            let work = |i: usize, worker: &mut Worker| {
                let sentence = &sentences[perm[i]];
                let lr = scheduled_lr(
                    config.init_lr,
                    config.min_lr,
                    epoch,
                    config.start_lr_schedule_epoch,
                    max_epochs,
                    batch_start + i as u64,
                    total_sentences,
                );
                counters.set_lr(lr);
                let kept = trainer.train(worker, sentence, lr, mode) as u64;
                counters.sents.fetch_add(1, Ordering::Relaxed);
                counters.tokens.fetch_add(kept, Ordering::Relaxed);
                counters.total_tokens.fetch_add(kept, Ordering::Relaxed);
                retained_in_epoch.fetch_add(kept, Ordering::Relaxed);
                seen_in_epoch.fetch_add(sentence.len() as u64, Ordering::Relaxed);
            };

            if config.partitioned {
                parallel_for_partitioned(sentences.len(), &mut workers, work);
            } else {
                parallel_for(sentences.len(), &mut workers, work);
            }

            batch_start += sentences.len() as u64;
        }

        progress.finish();

        let seen = seen_in_epoch.load(Ordering::Relaxed);
        if seen > 0 {
            let retained = retained_in_epoch.load(Ordering::Relaxed);
            println!(
                "{:.2}% of tokens were retained while filtering.",
                100.0 * retained as f64 / seen as f64
            );
        }
    }

    let total_secs = started.elapsed().as_secs_f64();
    let trained = counters.total_tokens.load(Ordering::Relaxed);
    println!("Took {}s. (excluding vocab build)", total_secs as u64);
    println!("Overall speed was {:.0} toks/s.", trained as f64 / total_secs);

    println!("Saving to {}", config.embedding_path.display());
    table::save_embeddings(&config.embedding_path, &vocab, &table)?;

    if let Some(model_path) = &config.model_path {
        println!("Saving model to {}", model_path.display());
        Model::from_training(config.dim, config.ctxs, &ordered, &freqs, &table, &ctx)
            .save(model_path)?;
    }

    Ok(())
}

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, ValueEnum};

use wordvane::driver::{self, ContinueVocab, TrainConfig};
use wordvane::reader::ReadMode;
use wordvane::Real;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ContinueVocabArg {
    Old,
    New,
    Union,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReadModeArg {
    Text,
    Gzip,
    Auto,
}

fn ns_exponent_in_range(s: &str) -> Result<f64, String> {
    let x: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&x) {
        Ok(x)
    } else {
        Err(format!("{x} is outside the required range [0, 1]"))
    }
}

#[derive(Parser)]
#[command(
    name = "wordvane",
    about = "Train Skip-Gram or CBOW word embeddings by negative sampling"
)]
struct Options {
    /// Paths to training files
    #[arg(short, long, value_name = "paths", num_args = 1.., required = true)]
    files: Vec<PathBuf>,

    /// Word vector dimension
    #[arg(short, long, value_name = "n", default_value_t = 200)]
    dim: usize,

    /// One sided context size, excluding the center word
    #[arg(short, long = "context-size", value_name = "n", default_value_t = 5)]
    context_size: usize,

    /// Number of negative samples for each positive
    #[arg(short, long, value_name = "n", default_value_t = 5)]
    negatives: usize,

    /// (Starting) learning rate. 0.025 for skipgram and 0.075 for cbow is
    /// recommended.
    #[arg(short, long = "learning-rate", value_name = "x", default_value_t = 0.025)]
    learning_rate: f64,

    /// Minimum (ending) learning rate when linearly scheduling learning
    /// rate
    #[arg(short, long = "min-learning-rate", value_name = "x", default_value_t = 1e-4)]
    min_learning_rate: f64,

    /// Do not use word identities if raw frequency count is less than n.
    /// See --discard
    #[arg(short = 'k', long = "min-count", value_name = "n")]
    min_count: Option<u64>,

    /// If true, discard rare words (see --min-count) else, convert them
    /// to UNK
    #[arg(
        short = 'i',
        long,
        value_name = "true|false",
        action = ArgAction::Set,
        default_value_t = true
    )]
    discard: bool,

    /// If true, use cbow loss instead of skipgram
    #[arg(
        short = 'b',
        long,
        value_name = "true|false",
        action = ArgAction::Set,
        default_value_t = false
    )]
    cbow: bool,

    /// If true, use faulty CBOW update
    #[arg(
        short = 'u',
        long = "use-bad-update",
        value_name = "true|false",
        action = ArgAction::Set,
        default_value_t = false
    )]
    use_bad_update: bool,

    /// Downsample threshold
    #[arg(short = 'o', long = "downsample-threshold", value_name = "x", default_value_t = 1e-3)]
    downsample_threshold: f64,

    /// Exponent for negative sampling distribution
    #[arg(
        short = 'x',
        long = "ns-exponent",
        value_name = "x",
        default_value_t = 0.75,
        value_parser = ns_exponent_in_range
    )]
    ns_exponent: f64,

    /// Training epochs
    #[arg(short, long, value_name = "n", default_value_t = 1)]
    epochs: usize,

    /// Vocabulary size to pick top n words instead of all
    #[arg(short = 'V', long = "vocab-size", value_name = "n")]
    vocab_size: Option<usize>,

    /// If passed, load vocabulary from file and skip vocab build. If
    /// passed, continue-vocab option is ignored.
    #[arg(short = 'a', long = "vocab-load-path", value_name = "path")]
    vocab_load_path: Option<PathBuf>,

    /// If loading vocab from file (see vocab-load-path option), use this
    /// value as total number of sentences to measure percent completion.
    #[arg(short = 'I', long = "total-sentences", value_name = "n", default_value_t = 0)]
    total_sentences: u64,

    /// Number of worker threads
    #[arg(short, long, value_name = "n", default_value_t = 1)]
    threads: usize,

    /// Buffer size in number of sentences. Memory footprint is in the
    /// order of buffer-size x avg. length of sentence.
    #[arg(short = 'B', long = "buffer-size", value_name = "n", default_value_t = 500_000)]
    buffer_size: usize,

    /// Path embeddings should be saved to. Defaults to saving to a file
    /// named 'embeddings_${CURRENT_DATETIME}.txt'. A vocab file is stored
    /// using the same path with an additional '.vocab' suffix.
    #[arg(short = 'p', long = "embedding-path", value_name = "path")]
    embedding_path: Option<PathBuf>,

    /// If passed, continue training from an existing embedding table
    /// (also see continue-vocab)
    #[arg(short = 'r', long = "pretrained-path", value_name = "path")]
    pretrained_path: Option<PathBuf>,

    /// Which vocab to use when continuing training (see pretrained-path),
    /// old: from pretrained table, new: from data, union: combined
    #[arg(short = 'v', long = "continue-vocab", value_enum, default_value_t = ContinueVocabArg::Union)]
    continue_vocab: ContinueVocabArg,

    /// Force reading training files as text/gzip
    #[arg(long = "read-mode", value_enum, default_value_t = ReadModeArg::Auto)]
    read_mode: ReadModeArg,

    /// If true, will shuffle sentences in a batch before allocating to
    /// worker threads rather than assigning them consecutively to threads
    #[arg(
        short = 's',
        long = "shuffle-sentences",
        value_name = "true|false",
        action = ArgAction::Set,
        default_value_t = false
    )]
    shuffle_sentences: bool,

    /// If true, use the partitioned version of the main parallel for
    /// loop. Can be faster due to a lack of atomics, but also slower due
    /// to workers with less work waiting for others. Changes sentence
    /// processing order.
    #[arg(
        short = 'L',
        long,
        value_name = "true|false",
        action = ArgAction::Set,
        default_value_t = false
    )]
    partitioned: bool,

    /// Schedule learning rate as if training starts from the n-th epoch
    /// instead of the 0th.
    #[arg(short = 'S', long = "start-lr-schedule-epoch", value_name = "n", default_value_t = 0)]
    start_lr_schedule_epoch: usize,

    /// Schedule learning rate as if training will last for n epochs
    /// instead of what is specified by the epochs option. Zero default
    /// makes it the same as start-lr-schedule-epoch + epochs.
    #[arg(short = 'E', long = "max-lr-schedule-epochs", value_name = "n", default_value_t = 0)]
    max_lr_schedule_epochs: usize,

    /// Also save a binary model checkpoint (both matrices plus the
    /// counted vocabulary) to this path
    #[arg(long = "save-model", value_name = "path")]
    save_model: Option<PathBuf>,

    /// If passed, do not display counters and progress bars
    #[arg(short = 'P', long = "no-progress", action = ArgAction::SetTrue)]
    no_progress: bool,

    /// If passed, will throw an error if any line in a training file is
    /// longer than the line buffer. Otherwise, will silently truncate
    /// long lines.
    #[arg(long = "enforce-max-line-length", action = ArgAction::SetTrue)]
    enforce_max_line_length: bool,
}

impl Options {
    fn into_config(self) -> TrainConfig {
        let embedding_path = self.embedding_path.unwrap_or_else(|| {
            PathBuf::from(format!(
                "embeddings_{}.txt",
                chrono::Local::now().format("%F_%T")
            ))
        });
        TrainConfig {
            files: self.files,
            dim: self.dim,
            ctxs: self.context_size,
            negatives: self.negatives,
            init_lr: self.learning_rate as Real,
            min_lr: self.min_learning_rate as Real,
            min_count: self.min_count,
            discard: self.discard,
            cbow: self.cbow,
            use_bad_update: self.use_bad_update,
            downsample_threshold: self.downsample_threshold as Real,
            ns_exponent: self.ns_exponent as Real,
            epochs: self.epochs,
            start_lr_schedule_epoch: self.start_lr_schedule_epoch,
            max_lr_schedule_epochs: self.max_lr_schedule_epochs,
            vocab_size: self.vocab_size,
            vocab_load_path: self.vocab_load_path,
            total_sentences: self.total_sentences,
            threads: self.threads,
            buffer_size: self.buffer_size,
            shuffle: self.shuffle_sentences,
            partitioned: self.partitioned,
            pretrained_path: self.pretrained_path,
            continue_vocab: match self.continue_vocab {
                ContinueVocabArg::Old => ContinueVocab::Old,
                ContinueVocabArg::New => ContinueVocab::New,
                ContinueVocabArg::Union => ContinueVocab::Union,
            },
            read_mode: match self.read_mode {
                ReadModeArg::Text => ReadMode::Text,
                ReadModeArg::Gzip => ReadMode::Gzip,
                ReadModeArg::Auto => ReadMode::Auto,
            },
            enforce_max_line_length: self.enforce_max_line_length,
            embedding_path,
            model_path: self.save_model,
            no_progress: self.no_progress,
        }
    }
}

fn warn_suggested_ranges(options: &Options) {
    if !(1e-3..=1e-1).contains(&options.learning_rate) {
        eprintln!(
            "WARNING: --learning-rate {} is outside the suggested range [0.001, 0.1].",
            options.learning_rate
        );
    }
    if !(0.0..=1e-4).contains(&options.min_learning_rate) {
        eprintln!(
            "WARNING: --min-learning-rate {} is outside the suggested range [0, 0.0001].",
            options.min_learning_rate
        );
    }
}

fn main() {
    let options = Options::parse();
    warn_suggested_ranges(&options);
    if let Err(err) = driver::run(options.into_config()) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}

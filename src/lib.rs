pub mod driver;
pub mod model;
pub mod progress;
pub mod reader;
pub mod sample;
pub mod sigmoid;
pub mod table;
pub mod trainer;
pub mod vocab;

/// Precision of embedding entries and all training arithmetic.
///
/// The `gradcheck` build uses `f64` so that two-sided numeric derivatives
/// have enough headroom to compare against analytic updates.
#[cfg(not(feature = "gradcheck"))]
pub type Real = f32;
#[cfg(feature = "gradcheck")]
pub type Real = f64;

/// Index of a word in the vocabulary. Training refuses to start if the
/// vocabulary does not fit this width.
pub type Word = u32;

pub type Sentence = Vec<Word>;
pub type Sentences = Vec<Sentence>;

/// Sentinel token standing in for out-of-vocabulary words when OOV
/// replacement is active. Always at index 0 when present.
pub const UNK_TOKEN: &str = "___UNK___";

/// Seed for the table-initialization RNG; worker RNGs and negative
/// samplers use `BASE_SEED + tid`.
pub const BASE_SEED: u64 = 123457;

/// Seed for the batch-shuffling RNG.
pub const SHUFFLE_SEED: u64 = 12345;

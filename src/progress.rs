//! Live progress rendering. The training loop only publishes atomic
//! counters; a ticker thread here turns them into an indicatif bar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::driver::Counters;

const TICK: Duration = Duration::from_millis(100);

/// Spinner for the vocabulary scan. Hidden when progress is suppressed.
pub fn scan_spinner(unit: &str, disabled: bool) -> ProgressBar {
    if disabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template(&format!("{{spinner}} {{pos}} {unit}")).unwrap());
    bar
}

/// Epoch progress: a bar when the sentence total is known, a plain
/// counter otherwise.
pub struct Progress {
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
    bar: ProgressBar,
}

impl Progress {
    pub fn start(counters: Arc<Counters>, total_sentences: u64, disabled: bool) -> Progress {
        if disabled {
            return Progress {
                stop: Arc::new(AtomicBool::new(true)),
                ticker: None,
                bar: ProgressBar::hidden(),
            };
        }

        let bar = if total_sentences > 0 {
            let bar = ProgressBar::new(total_sentences);
            bar.set_style(
                ProgressStyle::with_template(
                    "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} sents  {msg}",
                )
                .unwrap(),
            );
            bar
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(ProgressStyle::with_template("{spinner} {pos} sents  {msg}").unwrap());
            bar
        };

        let stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let stop = stop.clone();
            let bar = bar.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    bar.set_position(counters.sents.load(Ordering::Relaxed));
                    bar.set_message(format!(
                        "{} toks  lr {:.5}",
                        counters.tokens.load(Ordering::Relaxed),
                        counters.lr()
                    ));
                    std::thread::sleep(TICK);
                }
            })
        };

        Progress {
            stop,
            ticker: Some(ticker),
            bar,
        }
    }

    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        self.bar.finish_and_clear();
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Progress bars for long-running stages.
//!
//! Bars draw to stderr and are hidden automatically when stderr is not a
//! terminal, so piped runs and tests stay quiet.

use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Create a styled progress bar for `total` steps.
#[must_use]
pub fn stage_progress(total: usize, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .map_or_else(|_| ProgressStyle::default_bar(), |style| style.progress_chars("#>-"));
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

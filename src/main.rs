//! Traducir CLI - encoder-decoder translation inference
//!
//! # Commands
//!
//! - `run` - Translate text (interactive when no text is given)
//! - `info` - Show model settings

use clap::Parser;
use traducir::cli::{entrypoint, Cli};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = entrypoint(cli) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

//! perctl entry point
//!
//! Parses arguments, runs one command through the CLI module and exits
//! non-zero on failure. All logic lives in `persistency::cli`.

use persistency::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

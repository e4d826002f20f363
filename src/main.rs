//! Points Ledger CLI
//!
//! Replays a CSV stream of `point.changed` events through the ledger and
//! prints the resulting balances.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- events.csv > balances.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `POINTS_LEDGER_DB`: SQLite file to persist into; replaying the same
//!   events against it is a no-op
//! - `POINTS_LEDGER_MAX_ATTEMPTS`, `POINTS_LEDGER_RETRY_BACKOFF_MS`: commit retry policy

use points_ledger::{
    EventConsumer, LedgerConfig, LedgerEngine, LedgerError, LedgerStore, MemoryStore, Result,
    SqliteStore,
};
use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::process;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return Err(LedgerError::MissingArgument);
    }

    let config = LedgerConfig::from_env()?;
    let input_path = &args[1];
    let file = File::open(input_path)?;
    let reader = BufReader::new(file);

    match &config.database_path {
        Some(path) => replay(SqliteStore::open(path)?, &config, reader),
        None => replay(MemoryStore::new(), &config, reader),
    }
}

fn replay<S: LedgerStore, Rd: Read>(store: S, config: &LedgerConfig, reader: Rd) -> Result<()> {
    let engine = LedgerEngine::open(store).configured(config);
    let summary = EventConsumer::new(&engine).consume_csv(reader)?;

    if !summary.dead_letters.is_empty() {
        eprintln!("{} event(s) dead-lettered", summary.dead_letters.len());
    }

    let stdout = io::stdout();
    let handle = stdout.lock();
    engine.write_balances(handle)?;

    Ok(())
}

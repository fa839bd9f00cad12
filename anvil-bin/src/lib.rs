//! # anvil-bin
//!
//! Support code of the `anvil-fuzz` binary: logging through the progress
//! bars and the result files.
//!
//! ## Quickstart
//!
//! ```sh
//! # reserve one 1 GiB hugepage and mount hugetlbfs
//! echo 1 | sudo tee /sys/kernel/mm/hugepages/hugepages-1048576kB/nr_hugepages
//! sudo mount -t hugetlbfs none /dev/hugepages
//!
//! cargo build --release
//! sudo target/release/anvil-fuzz --config config/bs-config.json --runtime 3600
//! ```
//!
//! `--dry-run` replaces the hugepage by an ordinary aligned mapping, which
//! exercises the whole pipeline without root but cannot hammer effectively.

#[macro_use]
extern crate log;

use anvil_core::suite::FlipRecord;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Installs `env_logger` (default filter `info`) behind a [`MultiProgress`]
/// so log lines do not tear the progress bars.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Writes the CSV header and one line per record.
pub fn write_flips<W: Write>(mut w: W, records: &[FlipRecord]) -> std::io::Result<()> {
    writeln!(w, "{}", FlipRecord::HEADER)?;
    for record in records {
        writeln!(w, "{}", record)?;
    }
    w.flush()
}

/// Writes `records` as CSV to `path`.
pub fn save_flips<P: AsRef<Path>>(path: P, records: &[FlipRecord]) -> anyhow::Result<()> {
    let file = File::create(path.as_ref())?;
    write_flips(BufWriter::new(file), records)?;
    info!("{} flips saved to {}", records.len(), path.as_ref().display());
    Ok(())
}

/// Writes `value` as pretty JSON to `path`.
pub fn save_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> anyhow::Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    info!("Results saved to {}", path.as_ref().display());
    Ok(())
}

//! Stdout rendering: one JSON document per line.

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use queuectl_infra::jobs::JobStats;

/// `status` output.
#[derive(Debug, Serialize)]
pub struct StatusView {
    #[serde(flatten)]
    pub stats: JobStats,
    pub stop_requested: bool,
}

/// Print `value` as one JSON line.
pub fn line<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, value).context("failed to serialize output")?;
    writeln!(out).context("failed to write to stdout")?;
    Ok(())
}

/// Print each item as its own JSON line.
pub fn lines<T: Serialize>(items: &[T]) -> Result<()> {
    for item in items {
        line(item)?;
    }
    Ok(())
}

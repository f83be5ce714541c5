//! Output rendering shared by every command.
//!
//! Two shapes, selected by the root `--json` flag. JSON is the machine
//! contract: snake_case fields, RFC 3339 UTC timestamps, byte blobs omitted,
//! one object or array per invocation. Human output is a header row plus
//! space-aligned columns, wide cells clipped by [`truncate`].

use std::io::Write;

use serde::Serialize;

use crate::errors::Result;

/// Serialize `value` as pretty JSON followed by a newline.
pub fn write_json<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *w, value)
        .map_err(|e| crate::errors::Error::Io(std::io::Error::other(e)))?;
    writeln!(w)?;
    Ok(())
}

/// Collapse newlines, trim, and clip to `max` characters with a trailing `…`.
pub fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    let flat = flat.trim();
    if max == 0 || flat.chars().count() <= max {
        return flat.to_string();
    }
    if max == 1 {
        return flat.chars().take(1).collect();
    }
    let clipped: String = flat.chars().take(max - 1).collect();
    format!("{clipped}…")
}

/// RFC 3339 in UTC; empty string for the zero timestamp (unsynced rows).
pub fn fmt_ts(unix_secs: i64) -> String {
    if unix_secs <= 0 {
        return String::new();
    }
    chrono::DateTime::<chrono::Utc>::from_timestamp(unix_secs, 0)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Minimal aligned-column writer: collect rows, then flush with each column
/// padded to its widest cell. Mirrors Go's tabwriter defaults (two-space gap).
pub struct Table {
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: &[&str]) -> Self {
        Self {
            rows: vec![header.iter().map(|h| (*h).to_string()).collect()],
        }
    }

    /// Key/value style table without a header row.
    pub fn plain() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn row(&mut self, cells: &[String]) {
        self.rows.push(cells.to_vec());
    }

    pub fn flush<W: Write>(&self, w: &mut W) -> Result<()> {
        let cols = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut widths = vec![0usize; cols];
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
        for row in &self.rows {
            let mut line = String::new();
            for (i, cell) in row.iter().enumerate() {
                if i + 1 == row.len() {
                    line.push_str(cell);
                } else {
                    let pad = widths[i] - cell.chars().count() + 2;
                    line.push_str(cell);
                    line.extend(std::iter::repeat(' ').take(pad));
                }
            }
            writeln!(w, "{}", line.trim_end())?;
        }
        Ok(())
    }
}

//! Diagnostics: store reachability, lock state, auth, connectivity, FTS.
//!
//! Read-only by design — the store is opened without the writer lock, the
//! lock itself is probed with an immediate release, and the network is only
//! touched with `--connect`.

use std::io::Write;

use serde::Serialize;

use crate::app::{App, Options};
use crate::config::Config;
use crate::errors::Result;
use crate::lock::StoreLock;
use crate::out::{self, Table};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub store_dir: String,
    pub lock_held: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_info: Option<String>,
    pub authenticated: bool,
    pub connected: bool,
    pub fts_enabled: bool,
}

/// Collect the report. `connect` additionally attempts a live socket, which
/// is a network op and therefore takes the writer lock for its duration;
/// when another process holds it, the connect probe is skipped.
pub async fn run(config: &Config, connect: bool) -> Result<Report> {
    let store_dir = config.store_dir().to_path_buf();

    let lock_held = StoreLock::is_held(&store_dir);
    let lock_info = if lock_held {
        StoreLock::owner_hint(&store_dir)
    } else {
        None
    };

    // Prefer a read-only probe of an existing db; fall back to a fresh open
    // for a store directory that has never been synced.
    let fts_enabled = match Store::open_read_only(&config.db_path()) {
        Ok(store) => store.has_fts(),
        Err(_) => Store::open(&config.db_path()).map(|s| s.has_fts())?,
    };

    let mut authenticated = false;
    let mut connected = false;
    let app = App::open(Options {
        config: config.clone(),
    })?;
    if app.open_wa().await.is_ok() {
        if let Ok(wa) = app.wa() {
            authenticated = wa.is_authed();
        }
        if connect && authenticated {
            match StoreLock::acquire(&store_dir) {
                Ok(lk) => {
                    connected = app.connect(true, false).await.is_ok();
                    let _ = lk.release();
                }
                Err(e) => tracing::warn!("skipping connect probe: {e}"),
            }
        }
    }
    app.close().await;

    Ok(Report {
        store_dir: store_dir.to_string_lossy().into_owned(),
        lock_held,
        lock_info,
        authenticated,
        connected,
        fts_enabled,
    })
}

pub fn render<W: Write>(w: &mut W, report: &Report, as_json: bool) -> Result<()> {
    if as_json {
        return out::write_json(w, report);
    }
    let mut table = Table::plain();
    table.row(&["STORE".into(), report.store_dir.clone()]);
    table.row(&["LOCKED".into(), report.lock_held.to_string()]);
    if let Some(info) = &report.lock_info {
        table.row(&["LOCK_INFO".into(), info.clone()]);
    }
    table.row(&["AUTHENTICATED".into(), report.authenticated.to_string()]);
    table.row(&["CONNECTED".into(), report.connected.to_string()]);
    table.row(&["FTS5".into(), report.fts_enabled.to_string()]);
    table.flush(w)?;

    if report.lock_held {
        writeln!(w)?;
        writeln!(
            w,
            "Tip: stop the running `wacli sync` before running write operations."
        )?;
    }
    Ok(())
}

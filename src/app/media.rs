//! Background media materialization.
//!
//! One worker task drains a bounded job queue; overflow drops the job (the
//! message itself is already stored, and a later sync re-enqueues it).
//! Failed downloads are logged and not retried. The worker pings the
//! activity signal after every job so `sync --once` can re-evaluate its
//! exit condition.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use super::App;
use crate::errors::{Error, Result};
use crate::store::{MediaDownloadInfo, Store};
use crate::wa::{MediaDownloadRequest, WaClient};

const MEDIA_QUEUE_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct MediaJob {
    pub chat_jid: String,
    pub msg_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaDownload {
    pub chat_jid: String,
    pub msg_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub media_type: String,
    pub mime_type: String,
}

pub(crate) struct MediaPipeline {
    tx: Mutex<Option<mpsc::Sender<MediaJob>>>,
    rx: Mutex<Option<mpsc::Receiver<MediaJob>>>,
    pending: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MediaPipeline {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(MEDIA_QUEUE_CAP);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    pub fn sender(&self) -> Option<mpsc::Sender<MediaJob>> {
        self.tx.lock().clone()
    }

    pub fn pending_counter(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Close the queue, then let the worker finish its current job. Stragglers
    /// past the grace period are aborted.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(mut worker) = self.worker.lock().take() {
            if tokio::time::timeout(std::time::Duration::from_secs(30), &mut worker)
                .await
                .is_err()
            {
                tracing::warn!("media worker did not drain in time, aborting");
                worker.abort();
            }
        }
    }
}

impl App {
    /// Spawn the single worker task, once. Jobs enqueued before the worker
    /// starts sit in the channel. The worker captures its own handles so it
    /// never touches App bookkeeping.
    pub(crate) fn start_media_worker(&self) {
        let Some(mut rx) = self.media.rx.lock().take() else {
            return;
        };
        let Ok(wa) = self.wa() else {
            // Put the receiver back so a later start can pick it up.
            *self.media.rx.lock() = Some(rx);
            return;
        };
        let store = self.store.clone();
        let media_dir = self.config.media_dir();
        let pending = self.media.pending.clone();
        let activity = self.activity.clone();

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome =
                    download_media_inner(&store, &wa, &media_dir, &job.chat_jid, &job.msg_id, None)
                        .await;
                if let Err(e) = outcome {
                    tracing::warn!("media download {}/{} failed: {e}", job.chat_jid, job.msg_id);
                }
                pending.fetch_sub(1, Ordering::SeqCst);
                activity.notify_one();
            }
        });
        *self.media.worker.lock() = Some(worker);
    }

    /// Fetch one attachment to disk and record the local path.
    pub async fn download_media(
        &self,
        chat_jid: &str,
        msg_id: &str,
        output: Option<&Path>,
    ) -> Result<MediaDownload> {
        let wa = self.wa()?;
        download_media_inner(
            &self.store,
            &wa,
            &self.config.media_dir(),
            chat_jid,
            msg_id,
            output,
        )
        .await
    }

    /// Run one media job inline, the same path the worker takes.
    pub async fn download_media_job(&self, job: &MediaJob) -> Result<MediaDownload> {
        self.download_media(&job.chat_jid, &job.msg_id, None).await
    }

    pub fn resolve_media_output_path(
        &self,
        info: &MediaDownloadInfo,
        output: Option<&Path>,
    ) -> PathBuf {
        resolve_output_path(&self.config.media_dir(), info, output)
    }
}

/// Validates the stored metadata before touching the filesystem so a
/// metadata-less message fails cleanly with no partial file.
async fn download_media_inner(
    store: &Store,
    wa: &Arc<dyn WaClient>,
    media_dir: &Path,
    chat_jid: &str,
    msg_id: &str,
    output: Option<&Path>,
) -> Result<MediaDownload> {
    let info = store.get_media_download_info(chat_jid, msg_id)?;
    if info.media_type.is_empty() || info.direct_path.is_empty() || info.media_key.is_empty() {
        return Err(Error::invalid(
            "message has no downloadable media metadata (run `wacli sync` first)",
        ));
    }

    let target = resolve_output_path(media_dir, &info, output);
    let bytes = wa
        .download_media_to_file(
            &MediaDownloadRequest {
                direct_path: info.direct_path.clone(),
                media_key: info.media_key.clone(),
                file_sha256: info.file_sha256.clone(),
                file_enc_sha256: info.file_enc_sha256.clone(),
                file_length: info.file_length,
                media_type: info.media_type.clone(),
                mime_type: info.mime_type.clone(),
            },
            &target,
        )
        .await?;

    store.mark_media_downloaded(chat_jid, msg_id, &target.to_string_lossy(), Utc::now())?;

    Ok(MediaDownload {
        chat_jid: info.chat_jid,
        msg_id: info.msg_id,
        path: target,
        bytes,
        media_type: info.media_type,
        mime_type: info.mime_type,
    })
}

/// Default layout: `<storeDir>/media/YYYY/MM/<filename-or-msgid>`. An
/// explicit output directory keeps the derived filename; an explicit file
/// path wins outright.
fn resolve_output_path(
    media_dir: &Path,
    info: &MediaDownloadInfo,
    output: Option<&Path>,
) -> PathBuf {
    let filename = media_filename(info);
    match output {
        Some(path) if path.extension().is_some() || path.is_file() => path.to_path_buf(),
        Some(dir) => dir.join(filename),
        None => {
            let now = Utc::now();
            media_dir
                .join(format!("{:04}", now.year()))
                .join(format!("{:02}", now.month()))
                .join(filename)
        }
    }
}

/// Original filename when present (path components stripped), otherwise the
/// message id with an extension guessed from the MIME type.
fn media_filename(info: &MediaDownloadInfo) -> String {
    let base = Path::new(&info.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if !base.is_empty() {
        return base.to_string();
    }
    match ext_from_mime(&info.mime_type) {
        Some(ext) => format!("{}.{ext}", info.msg_id),
        None => info.msg_id.clone(),
    }
}

fn ext_from_mime(mime: &str) -> Option<&'static str> {
    match mime.split(';').next().unwrap_or("").trim() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

//! Per-file download state machine (spec.md §4.5).
//!
//! `Empty -> Validating -> Loading -> Done|Failed`. One `Download` is
//! shared by every concurrent opener of the same file; `start_loading` is
//! idempotent and coalesces concurrent callers onto a single in-flight
//! fetch, the same `HashMap::entry` coalescing idiom
//! `BuildResultFS::inode_for_file` uses for its own cache.

use crate::error::{CampusFsError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Empty,
    Validating,
    Loading,
    Done,
    Failed,
}

/// mtime equality tolerance. `fuser` only mounts on Linux/macOS, so the
/// Windows drift allowance spec.md §9 open question (c) anticipates never
/// applies in practice; exact-second comparison matches HTTP's own
/// `Last-Modified` resolution.
const MTIME_TOLERANCE_SECS: i64 = 0;

struct Inner {
    state: State,
    total_length: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// A per-(file-id, local-path) handle. Multiple openers of the same file
/// share one `Download`, retained by the catalog's per-id cache.
pub struct Download {
    pub url: String,
    pub local_path: PathBuf,
    inner: Mutex<Inner>,
    /// Signalled whenever `state` transitions; `await_readable` waits on
    /// this rather than polling.
    notify: Notify,
}

impl Download {
    pub fn new(
        url: String,
        local_path: PathBuf,
        total_length: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            url,
            local_path,
            inner: Mutex::new(Inner {
                state: State::Empty,
                total_length,
                last_modified,
                last_error: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn is_completed(&self) -> bool {
        self.state() == State::Done
    }

    fn set_state(&self, state: State) {
        self.inner.lock().state = state;
        self.notify.notify_waiters();
    }

    /// Regular file exists at `local_path`, size matches `total_length` (if
    /// known), and on-disk mtime equals `last_modified` (if known). Size or
    /// mtime mismatch both mean "not cached".
    pub fn is_cached_locally(&self) -> bool {
        let meta = match std::fs::metadata(&self.local_path) {
            Ok(m) if m.is_file() => m,
            _ => return false,
        };
        let guard = self.inner.lock();
        if let Some(expected) = guard.total_length {
            if meta.len() != expected {
                return false;
            }
        }
        if let Some(expected_mtime) = guard.last_modified {
            let actual = match meta.modified() {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(_) => return false,
            };
            let drift = (actual.timestamp() - expected_mtime.timestamp()).abs();
            if drift > MTIME_TOLERANCE_SECS {
                return false;
            }
        }
        true
    }

    /// HEAD the URL to (re)derive `total_length`; a 405 response means the
    /// server doesn't support HEAD and validation is skipped, not an error.
    pub async fn validate_headers(&self, client: &reqwest::Client) -> Result<()> {
        self.inner.lock().state = State::Validating;
        let resp = client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "HEAD"))?;
        if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(CampusFsError::from_reqwest(
                resp.error_for_status().unwrap_err(),
                "HEAD",
            ));
        }
        if resp.headers().get(reqwest::header::ACCEPT_RANGES).map(|v| v.as_bytes())
            != Some(b"bytes")
        {
            log::warn!("{}: server did not advertise Accept-Ranges: bytes", self.url);
        }
        let total_length = if let Some(len) = resp.headers().get(reqwest::header::CONTENT_LENGTH) {
            len.to_str().ok().and_then(|s| s.parse::<u64>().ok())
        } else if let Some(range) = resp.headers().get(reqwest::header::CONTENT_RANGE) {
            parse_content_range_total(range.to_str().unwrap_or(""))
        } else {
            None
        };
        if let Some(total_length) = total_length {
            self.inner.lock().total_length = Some(total_length);
        }
        Ok(())
    }

    /// Idempotent: returns immediately if already `Done`; joins the
    /// in-flight fetch if `Loading`; otherwise validates and fetches.
    pub async fn start_loading(self: &Arc<Self>, client: &reqwest::Client) -> Result<()> {
        loop {
            let state = self.state();
            match state {
                State::Done => return Ok(()),
                State::Loading | State::Validating => {
                    self.notify.notified().await;
                    continue;
                }
                State::Empty | State::Failed => {
                    return self.load(client).await;
                }
            }
        }
    }

    async fn load(self: &Arc<Self>, client: &reqwest::Client) -> Result<()> {
        self.set_state(State::Validating);

        if self.is_cached_locally() {
            self.set_state(State::Done);
            return Ok(());
        }

        if let Err(err) = self.validate_headers(client).await {
            self.fail(err.to_string());
            return Err(err);
        }

        if self.is_cached_locally() {
            self.set_state(State::Done);
            return Ok(());
        }

        self.set_state(State::Loading);
        match self.fetch_to_disk(client).await {
            Ok(()) => {
                self.set_state(State::Done);
                Ok(())
            }
            Err(err) => {
                // A failed download must not leave behind a partial file
                // that would later satisfy `is_cached_locally` (spec.md
                // §4.5): delete whatever bytes made it to disk.
                let _ = std::fs::remove_file(&self.local_path);
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn fetch_to_disk(&self, client: &reqwest::Client) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CampusFsError::from_reqwest(e, "GET"))?;
        if !resp.status().is_success() {
            return Err(CampusFsError::from_reqwest(
                resp.error_for_status().unwrap_err(),
                "GET",
            ));
        }

        if let Some(parent) = self.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&self.local_path).await?;
        let mut stream = futures::StreamExt::fuse(resp.bytes_stream());
        let mut written: u64 = 0;
        loop {
            use futures::StreamExt;
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| CampusFsError::from_reqwest(e, "stream GET body"))?;
                    // Unbuffered: each chunk is written and flushed
                    // immediately rather than accumulated, so a
                    // cancellation leaves a well-formed prefix on disk.
                    file.write_all(&chunk).await?;
                    file.flush().await?;
                    written += chunk.len() as u64;
                }
                None => break,
            }
        }

        let expected = self.inner.lock().total_length;
        if let Some(expected) = expected {
            if written != expected {
                return Err(CampusFsError::Protocol(format!(
                    "server returned {written} bytes for {}, catalog said {expected}",
                    self.url
                )));
            }
        }

        if let Some(last_modified) = self.inner.lock().last_modified {
            set_mtime(&self.local_path, last_modified)?;
        }
        Ok(())
    }

    fn fail(&self, reason: String) {
        let mut guard = self.inner.lock();
        guard.state = State::Failed;
        guard.last_error = Some(reason);
        drop(guard);
        self.notify.notify_waiters();
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn total_length(&self) -> Option<u64> {
        self.inner.lock().total_length
    }

    /// Cancel an in-flight download: leaves any partial file in place but
    /// transitions to `Failed` so the next `start_loading` deletes and
    /// retries (spec.md §5 Cancellation).
    pub fn cancel(&self) {
        self.fail("cancelled".into());
    }

    /// In the base design this simply awaits download completion (spec.md
    /// §9 open question (a)): no partial-range serving.
    pub async fn await_readable(self: &Arc<Self>, client: &reqwest::Client, _offset: u64, _len: u64) -> Result<()> {
        self.start_loading(client).await
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    // "bytes a-b/c"
    let slash = value.rfind('/')?;
    value[slash + 1..].trim().parse::<u64>().ok()
}

#[cfg(unix)]
pub(crate) fn set_mtime(path: &std::path::Path, when: DateTime<Utc>) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| CampusFsError::Protocol(e.to_string()))?;
    let spec = libc::timespec {
        tv_sec: when.timestamp() as libc::time_t,
        tv_nsec: 0,
    };
    let times = [spec, spec];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

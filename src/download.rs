//! Streamed downloads with resume, overwrite policy and progress reporting.
//!
//! Downloads go through the normal pipeline (admission, retries, redirect
//! tracking and SSRF defense all apply) but the body is streamed straight to
//! disk instead of being materialized, so the in-memory body cap does not
//! apply. A failed transfer leaves the partial file on disk so a later call
//! with resume enabled can pick up where it stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::client::Client;
use crate::error::Error;
use crate::execute;
use crate::request::Request;
use crate::validate;

/// Progress callback: `(downloaded_bytes, total_bytes, bytes_per_second)`.
///
/// `downloaded_bytes` includes the resume offset; `total_bytes` is the
/// content length plus the resume offset when known.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>, f64) + Send + Sync + 'static>;

/// Options controlling one download.
pub struct DownloadOptions {
    file_path: PathBuf,
    overwrite: bool,
    resume: bool,
    progress: Option<ProgressCallback>,
}

impl DownloadOptions {
    /// Options targeting `path`: no overwrite, no resume, no progress.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
            overwrite: false,
            resume: false,
            progress: None,
        }
    }

    /// Truncate the file if it already exists.
    #[must_use]
    pub const fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Append to an existing partial file using a `Range` request.
    #[must_use]
    pub const fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Invoked after every chunk written.
    #[must_use]
    pub fn with_progress(
        mut self,
        progress: impl Fn(u64, Option<u64>, f64) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("file_path", &self.file_path)
            .field("overwrite", &self.overwrite)
            .field("resume", &self.resume)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Outcome of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Normalized destination path.
    pub file_path: PathBuf,
    /// Bytes written by *this* call (excludes any resume offset).
    pub bytes_written: u64,
    /// Whether the call appended to an existing partial file.
    pub resumed: bool,
    /// Final HTTP status (`416` means the file was already complete).
    pub status: u16,
    /// Wall time for the whole download, retries included.
    pub duration: Duration,
    /// Attempts made by the pipeline.
    pub attempts: u32,
}

pub(crate) async fn run(
    client: &Client,
    mut request: Request,
    options: DownloadOptions,
) -> Result<DownloadResult, Error> {
    let raw_path = options.file_path.to_str().ok_or_else(|| Error::InvalidFilePath {
        reason: "path is not valid UTF-8".into(),
    })?;
    let path = validate::file_path(raw_path)?;

    if let Some(parent) = path.parent() {
        create_dirs(parent).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::DestinationNotWritable {
                    path: parent.display().to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
    }

    // Existing-file policy: resume wins over overwrite, overwrite over fail.
    let mut resume_offset: u64 = 0;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {
            if options.resume {
                resume_offset = meta.len();
                if resume_offset > 0 {
                    request.set_header("range", format!("bytes={resume_offset}-"));
                    debug!(offset = resume_offset, "resuming download");
                }
            } else if !options.overwrite {
                return Err(Error::FileExists {
                    path: path.display().to_string(),
                });
            }
        }
        Ok(_) => {
            return Err(Error::DestinationNotWritable {
                path: path.display().to_string(),
            });
        }
        Err(_) => {}
    }

    let method = request.method.clone();
    let mut dispatched = execute::dispatch(client, request).await?;
    let status = dispatched.response.status().as_u16();
    let cancel = dispatched.cancel.clone();

    // The server says the range starts at/after EOF: already complete.
    if status == 416 && resume_offset > 0 {
        info!(path = %path.display(), "range not satisfiable, file already complete");
        return Ok(DownloadResult {
            file_path: path,
            bytes_written: 0,
            resumed: false,
            status,
            duration: dispatched.started.elapsed(),
            attempts: dispatched.meta.attempts,
        });
    }

    if !(200..300).contains(&status) {
        return Err(Error::HttpStatus {
            status,
            status_text: dispatched
                .response
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            method: method.to_string(),
            url: dispatched.meta.final_url.to_string(),
        });
    }

    // 206 appends to the partial file; 200 means the server ignored (or was
    // never sent) the range, so start over.
    let resumed = status == 206 && resume_offset > 0;

    let mut open_options = std::fs::OpenOptions::new();
    open_options.write(true).create(true);
    if resumed {
        open_options.append(true);
    } else {
        open_options.truncate(true);
        resume_offset = 0;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open_options.mode(0o644);
    }

    let open_options = tokio::fs::OpenOptions::from(open_options);
    let file = open_options.open(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::DestinationNotWritable {
                path: path.display().to_string(),
            }
        } else {
            Error::Io(e)
        }
    })?;

    let total = dispatched
        .response
        .content_length()
        .map(|length| length + resume_offset);
    let host = dispatched
        .meta
        .final_url
        .host_str()
        .unwrap_or_default()
        .to_string();

    let mut writer = BufWriter::new(file);
    let mut written: u64 = 0;
    let body_started = Instant::now();

    loop {
        let chunk = match cancel.as_ref() {
            Some(token) => tokio::select! {
                () = token.cancelled() => return Err(Error::Canceled),
                chunk = dispatched.response.chunk() => chunk,
            },
            None => dispatched.response.chunk().await,
        };
        let Some(chunk) = chunk.map_err(|e| Error::from_transport(e, &host))? else {
            break;
        };

        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if let Some(progress) = &options.progress {
            let elapsed = body_started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                #[allow(clippy::cast_precision_loss)]
                let speed = written as f64 / elapsed;
                speed
            } else {
                0.0
            };
            progress(resume_offset + written, total, speed);
        }
    }

    writer.flush().await?;

    info!(
        path = %path.display(),
        bytes = written,
        resumed,
        "download complete"
    );

    Ok(DownloadResult {
        file_path: path,
        bytes_written: written,
        resumed,
        status,
        duration: dispatched.started.elapsed(),
        attempts: dispatched.meta.attempts,
    })
}

/// Creates missing parent directories with mode 0755 on Unix.
fn create_dirs(parent: &std::path::Path) -> std::io::Result<()> {
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(parent)
}

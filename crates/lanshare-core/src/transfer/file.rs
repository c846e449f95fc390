//! Completed files and their on-disk handles.

use bytes::Bytes;
use lanshare_discovery::DeviceId;
use rand::RngCore;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Fallback MIME type
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const MIME_TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
];

/// MIME type for a file name, from its extension
#[must_use]
pub fn mime_from_name(name: &str) -> &'static str {
    let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
        return DEFAULT_MIME_TYPE;
    };
    let ext = ext.to_ascii_lowercase();

    MIME_TABLE
        .iter()
        .find(|(known, _)| *known == ext)
        .map_or(DEFAULT_MIME_TYPE, |&(_, mime)| mime)
}

/// Reduce a remote-supplied name to a safe single path component
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A completely received file
///
/// Owns its bytes; the engine keeps nothing once this is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name from the metadata
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type from the metadata
    pub mime_type: String,
    /// File contents
    pub data: Bytes,
    /// Completion time
    pub received_at: SystemTime,
    /// Sending device
    pub from: DeviceId,
}

impl ReceivedFile {
    /// Write the file into `dir` without overwriting anything
    ///
    /// The name is sanitized; on collision ` (1)`, ` (2)`, ... is inserted
    /// before the extension.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be written.
    pub async fn save_to(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir).await?;
        let name = sanitize_file_name(&self.name);

        for attempt in 0u32..10_000 {
            let path = dir.join(numbered(&name, attempt));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&self.data).await?;
                    file.flush().await?;
                    tracing::info!("Saved {} ({} bytes)", path.display(), self.size);
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name for {name}"),
        ))
    }

    /// Write the file to a uniquely named temporary location in `dir`
    ///
    /// The returned locator must be released by the consumer.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub async fn stage(&self, dir: &Path) -> io::Result<DownloadLocator> {
        let mut tag = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut tag);
        let path = dir.join(format!(
            "lanshare-{}-{}",
            hex::encode(tag),
            sanitize_file_name(&self.name)
        ));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&self.data).await?;
        file.flush().await?;

        Ok(DownloadLocator {
            path,
            released: false,
        })
    }
}

fn numbered(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{name} ({n})"),
    }
}

/// Temporary on-disk copy of a received file
///
/// Call [`DownloadLocator::release`] when done. Dropping an unreleased
/// locator removes the file on a best-effort basis.
#[derive(Debug)]
pub struct DownloadLocator {
    path: PathBuf,
    released: bool,
}

impl DownloadLocator {
    /// Location of the staged file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the staged file
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be removed.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for DownloadLocator {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

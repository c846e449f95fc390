//! Chunked file transfer over an open channel.
//!
//! ```text
//! sender                                   receiver
//!   │ {"kind":"meta",name,size,mimeType} ──►  open session
//!   │ [chunk ≤ CHUNK_SIZE]               ──►  append, progress
//!   │ ...                                     ...
//!   │ {"kind":"end"}                     ──►  ReceivedFile
//! ```
//!
//! At most one file is in flight per direction per channel.

pub mod engine;
pub mod file;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

pub use engine::{TransferConfig, TransferEngine};
pub use file::{
    DEFAULT_MIME_TYPE, DownloadLocator, ReceivedFile, mime_from_name, sanitize_file_name,
};
pub use protocol::{CHUNK_SIZE, ControlMessage, FileMeta};
pub use receiver::{ReceiveOutcome, ReceiveProgress, TransferReceiver};
pub use sender::{SendReport, send_stream};
pub use session::{TransferSession, TransferState};

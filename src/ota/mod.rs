// OTA (Over-The-Air) update client
//
// Update flow:
// 1. Caller picks the inactive slot and builds the HTTP request (updater)
// 2. Transport connects, request is sent
// 3. Response header parsed, body streamed straight into the slot
// 4. Completion at exactly Content-Length bytes, optional digest check
// 5. Caller flips the boot slot and resets

pub mod http;
pub mod manager;
pub mod session;
pub mod updater;
pub mod writer;

pub use manager::{OtaManager, OtaStatus, OtaTransport, UpdateRequest};
pub use session::{FailReason, SessionState, UpdateSession};
pub use updater::{Updater, UpdaterError};
pub use writer::SlotWriter;

use crate::flash::FlashError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest response header we are prepared to buffer
pub const HEADER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaOptions {
    pub connect_timeout_ms: u64,
    /// Armed once the request is sent, covers the whole download
    pub download_timeout_ms: u64,
    pub max_header: usize,
    pub max_chunk: usize,
    /// Hex SHA-256 the downloaded image must match
    pub expected_sha256: Option<String>,
}

impl Default for OtaOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            download_timeout_ms: 60_000,
            max_header: HEADER_CAPACITY,
            max_chunk: 1460,
            expected_sha256: None,
        }
    }
}

impl OtaOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn expected_digest(&self) -> Result<Option<[u8; 32]>, OtaError> {
        let Some(hex) = self.expected_sha256.as_deref() else {
            return Ok(None);
        };
        let hex = hex.trim();
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(OtaError::InvalidDigest);
        }
        let mut digest = [0u8; 32];
        for (i, byte) in digest.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| OtaError::InvalidDigest)?;
        }
        Ok(Some(digest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    AlreadyInProgress,
    /// Target slot is not an upgradeable slot
    InvalidSlot(u8),
    InvalidDigest,
    TooLarge,
    Transport(i32),
    Flash(FlashError),
}

impl std::fmt::Display for OtaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtaError::AlreadyInProgress => write!(f, "update already in progress"),
            OtaError::InvalidSlot(slot) => write!(f, "slot {} cannot be updated", slot),
            OtaError::InvalidDigest => write!(f, "expected digest is not 64 hex characters"),
            OtaError::TooLarge => write!(f, "image does not fit in slot"),
            OtaError::Transport(code) => write!(f, "transport error {}", code),
            OtaError::Flash(e) => write!(f, "flash error: {}", e),
        }
    }
}

impl std::error::Error for OtaError {}

impl From<FlashError> for OtaError {
    fn from(e: FlashError) -> Self {
        OtaError::Flash(e)
    }
}

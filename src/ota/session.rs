//! One firmware download, driven by network events.
//!
//! Every event has its own transition function. The session never blocks and never touches the
//! network itself: the owner forwards events in and acts on the resulting state.

use super::http::{parse_response_header, HeaderError};
use super::writer::SlotWriter;
use super::{OtaError, OtaOptions, HEADER_CAPACITY};
use crate::flash::{Flash, FlashError};
use crate::layout::Region;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    ConnectTimeout,
    DownloadTimeout,
    Disconnected,
    Transport(i32),
    Header(HeaderError),
    TooLarge,
    Flash(FlashError),
    DigestMismatch,
    Cancelled,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::ConnectTimeout => write!(f, "connect timed out"),
            FailReason::DownloadTimeout => write!(f, "download timed out"),
            FailReason::Disconnected => write!(f, "connection closed early"),
            FailReason::Transport(code) => write!(f, "transport error {}", code),
            FailReason::Header(e) => write!(f, "{}", e),
            FailReason::TooLarge => write!(f, "image larger than slot"),
            FailReason::Flash(e) => write!(f, "flash error: {}", e),
            FailReason::DigestMismatch => write!(f, "image digest mismatch"),
            FailReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<OtaError> for FailReason {
    fn from(e: OtaError) -> Self {
        match e {
            OtaError::Flash(e) => FailReason::Flash(e),
            OtaError::Transport(code) => FailReason::Transport(code),
            _ => FailReason::TooLarge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    RequestSent,
    ReceivingHeader,
    ReceivingBody,
    Complete,
    Failed(FailReason),
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed(_))
    }
}

pub struct UpdateSession {
    state: SessionState,
    slot: u8,
    request: Vec<u8>,
    writer: SlotWriter,
    header: heapless::Vec<u8, HEADER_CAPACITY>,
    max_header: usize,
    content_length: u32,
    received: u32,
    deadline: Instant,
    download_timeout: std::time::Duration,
    expected_digest: Option<[u8; 32]>,
    hasher: Sha256,
}

impl std::fmt::Debug for UpdateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSession")
            .field("state", &self.state)
            .field("slot", &self.slot)
            .field("content_length", &self.content_length)
            .field("received", &self.received)
            .finish()
    }
}

impl UpdateSession {
    /// Start in `Connecting`, with the connect timer running from `now`
    pub fn new(
        slot: u8,
        region: Region,
        request: Vec<u8>,
        options: &OtaOptions,
        now: Instant,
    ) -> Result<Self, OtaError> {
        Ok(Self {
            state: SessionState::Connecting,
            slot,
            request,
            writer: SlotWriter::new(region),
            header: heapless::Vec::new(),
            max_header: options.max_header.min(HEADER_CAPACITY),
            content_length: 0,
            received: 0,
            deadline: now + options.connect_timeout(),
            download_timeout: options.download_timeout(),
            expected_digest: options.expected_digest()?,
            hasher: Sha256::new(),
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Body bytes written so far and the total expected (0 until the header is parsed)
    pub fn progress_bytes(&self) -> (u32, u32) {
        (self.received, self.content_length)
    }

    pub fn progress(&self) -> u8 {
        if self.content_length == 0 {
            return 0;
        }
        ((self.received as u64 * 100) / self.content_length as u64) as u8
    }

    fn fail(&mut self, reason: FailReason) {
        if self.state.is_finished() {
            return;
        }
        error!("OTA failed: {}", reason);
        self.state = SessionState::Failed(reason);
    }

    /// Connection established. Returns the request to send; the connect timer keeps running
    /// until the send completes.
    pub fn on_connected(&mut self, _now: Instant) -> Option<&[u8]> {
        if self.state != SessionState::Connecting {
            return None;
        }
        debug!("OTA connected, sending {} byte request", self.request.len());
        self.state = SessionState::RequestSent;
        Some(&self.request)
    }

    /// Request sent. Arms the download timer.
    pub fn on_sent(&mut self, now: Instant) {
        if self.state == SessionState::RequestSent {
            self.state = SessionState::ReceivingHeader;
            self.deadline = now + self.download_timeout;
        }
    }

    pub fn on_data<F: Flash + ?Sized>(&mut self, flash: &mut F, data: &[u8], now: Instant) {
        match self.state {
            // some stacks deliver the response before the send confirmation
            SessionState::RequestSent => {
                self.on_sent(now);
                self.on_header_data(flash, data);
            }
            SessionState::ReceivingHeader => self.on_header_data(flash, data),
            SessionState::ReceivingBody => self.on_body_data(flash, data),
            SessionState::Connecting => warn!("OTA data before connect, ignored"),
            SessionState::Complete | SessionState::Failed(_) => {}
        }
    }

    fn on_header_data<F: Flash + ?Sized>(&mut self, flash: &mut F, data: &[u8]) {
        self.state = SessionState::ReceivingHeader;
        let start = self.header.len();
        let room = self.max_header - start;
        let take = data.len().min(room);
        // capacity is bounded by max_header so this cannot fail
        let _ = self.header.extend_from_slice(&data[..take]);

        match parse_response_header(&self.header) {
            Ok(None) if take < data.len() || self.header.len() >= self.max_header => {
                self.fail(FailReason::Header(HeaderError::TooLarge));
            }
            Ok(None) => {}
            Err(e) => self.fail(FailReason::Header(e)),
            Ok(Some(header)) => {
                if header.content_length == 0 {
                    self.fail(FailReason::Header(HeaderError::MissingLength));
                    return;
                }
                if header.content_length > self.writer.region().len {
                    self.fail(FailReason::TooLarge);
                    return;
                }
                info!("OTA kicked off update, {} bytes", header.content_length);
                self.content_length = header.content_length;
                self.state = SessionState::ReceivingBody;
                // body bytes that arrived with the header, from the buffer and the unread tail
                let body: Vec<u8> = self.header[header.body_offset.min(self.header.len())..]
                    .iter()
                    .chain(&data[take..])
                    .copied()
                    .collect();
                self.header.clear();
                self.on_body_data(flash, &body);
            }
        }
    }

    fn on_body_data<F: Flash + ?Sized>(&mut self, flash: &mut F, data: &[u8]) {
        let remaining = (self.content_length - self.received) as usize;
        // anything past Content-Length is not part of the image
        let data = &data[..data.len().min(remaining)];
        if data.is_empty() {
            return;
        }
        if let Err(e) = self.writer.write(flash, data) {
            self.fail(e.into());
            return;
        }
        self.hasher.update(data);
        self.received += data.len() as u32;

        if self.received == self.content_length {
            self.complete(flash);
        }
    }

    fn complete<F: Flash + ?Sized>(&mut self, flash: &mut F) {
        if let Err(e) = self.writer.finish(flash) {
            self.fail(e.into());
            return;
        }
        if let Some(expected) = self.expected_digest {
            let digest: [u8; 32] = self.hasher.clone().finalize().into();
            if digest != expected {
                self.fail(FailReason::DigestMismatch);
                return;
            }
        }
        info!("OTA finished, {} bytes written to slot {}", self.received, self.slot);
        self.state = SessionState::Complete;
    }

    pub fn on_disconnected(&mut self) {
        self.fail(FailReason::Disconnected);
    }

    pub fn on_error(&mut self, code: i32) {
        self.fail(FailReason::Transport(code));
    }

    pub fn cancel(&mut self) {
        self.fail(FailReason::Cancelled);
    }

    /// Check the running timer
    pub fn poll(&mut self, now: Instant) {
        if self.state.is_finished() || now < self.deadline {
            return;
        }
        let reason = if matches!(self.state, SessionState::Connecting | SessionState::RequestSent) {
            FailReason::ConnectTimeout
        } else {
            FailReason::DownloadTimeout
        };
        self.fail(reason);
    }
}

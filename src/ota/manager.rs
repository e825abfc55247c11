// OTA Manager - owns the single in-flight update session and its transport

use super::session::{SessionState, UpdateSession};
use super::{OtaError, OtaOptions};
use crate::flash::Flash;
use crate::layout::{FlashLayout, UPGRADE_SLOTS};
use log::{info, warn};
use std::net::SocketAddrV4;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OtaStatus {
    Idle,
    Connecting,
    Downloading { progress: u8 },
    Ready,
    Failed,
}

/// Network side of an update. Calls only start operations; results come back as events.
pub trait OtaTransport {
    fn connect(&mut self, addr: SocketAddrV4) -> Result<(), OtaError>;
    fn send(&mut self, data: &[u8]) -> Result<(), OtaError>;
    fn disconnect(&mut self);
}

/// What to download and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub addr: SocketAddrV4,
    pub slot: u8,
    pub request: Vec<u8>,
}

pub type CompletionCallback = Box<dyn FnOnce(bool)>;

struct ActiveUpdate {
    session: UpdateSession,
    callback: Option<CompletionCallback>,
}

pub struct OtaManager<T: OtaTransport> {
    transport: T,
    layout: FlashLayout,
    options: OtaOptions,
    active: Option<ActiveUpdate>,
    status: OtaStatus,
}

impl<T: OtaTransport> OtaManager<T> {
    pub fn init(transport: T, layout: FlashLayout, options: OtaOptions) -> Self {
        Self { transport, layout, options, active: None, status: OtaStatus::Idle }
    }

    /// Abandon any session and return to `Idle`
    pub fn reset(&mut self) {
        self.cancel();
        self.status = OtaStatus::Idle;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn options(&self) -> &OtaOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin an update. A session already running is left alone.
    pub fn start(
        &mut self,
        request: UpdateRequest,
        now: Instant,
        callback: impl FnOnce(bool) + 'static,
    ) -> Result<(), OtaError> {
        if self.active.is_some() {
            warn!("OTA start rejected, update already in progress");
            return Err(OtaError::AlreadyInProgress);
        }
        if !UPGRADE_SLOTS.contains(&request.slot) {
            return Err(OtaError::InvalidSlot(request.slot));
        }
        let region = self.layout.slot(request.slot).map_err(|_| OtaError::InvalidSlot(request.slot))?;
        let session = UpdateSession::new(request.slot, region, request.request, &self.options, now)?;

        self.transport.connect(request.addr)?;
        info!("OTA update of slot {} from {}", request.slot, request.addr);
        self.active = Some(ActiveUpdate { session, callback: Some(Box::new(callback)) });
        self.status = OtaStatus::Connecting;
        Ok(())
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }

    pub fn get_progress(&self) -> u8 {
        match self.status {
            OtaStatus::Downloading { progress } => progress,
            OtaStatus::Ready => 100,
            _ => 0,
        }
    }

    pub fn on_connected(&mut self, now: Instant) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let result = match active.session.on_connected(now) {
            Some(request) => self.transport.send(request),
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!("OTA request send failed: {}", e);
            active.session.on_error(error_code(&e));
        }
        self.settle();
    }

    pub fn on_sent(&mut self, now: Instant) {
        if let Some(active) = self.active.as_mut() {
            active.session.on_sent(now);
        }
        self.settle();
    }

    pub fn on_data<F: Flash + ?Sized>(&mut self, flash: &mut F, data: &[u8], now: Instant) {
        if let Some(active) = self.active.as_mut() {
            for chunk in data.chunks(self.options.max_chunk.max(1)) {
                active.session.on_data(flash, chunk, now);
            }
        }
        self.settle();
    }

    pub fn on_disconnected(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.session.on_disconnected();
        }
        self.settle();
    }

    pub fn on_error(&mut self, code: i32) {
        if let Some(active) = self.active.as_mut() {
            active.session.on_error(code);
        }
        self.settle();
    }

    pub fn poll(&mut self, now: Instant) {
        if let Some(active) = self.active.as_mut() {
            active.session.poll(now);
        }
        self.settle();
    }

    /// Abort the running session, reporting failure to its callback
    pub fn cancel(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.session.cancel();
        }
        self.settle();
    }

    /// Refresh status and tear down a finished session
    fn settle(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let ok = match active.session.state() {
            SessionState::Connecting | SessionState::RequestSent | SessionState::ReceivingHeader => {
                self.status = OtaStatus::Connecting;
                return;
            }
            SessionState::ReceivingBody => {
                self.status = OtaStatus::Downloading { progress: active.session.progress() };
                return;
            }
            SessionState::Complete => true,
            SessionState::Failed(_) => false,
        };

        self.transport.disconnect();
        self.status = if ok { OtaStatus::Ready } else { OtaStatus::Failed };
        if let Some(callback) = self.active.take().and_then(|mut a| a.callback.take()) {
            callback(ok);
        }
    }
}

impl<T: OtaTransport> Drop for OtaManager<T> {
    fn drop(&mut self) {
        // Clean up any ongoing session
        if self.active.take().is_some() {
            self.transport.disconnect();
        }
    }
}

/// Transport code carried into the session, -1 for errors raised outside the transport
fn error_code(e: &OtaError) -> i32 {
    match e {
        OtaError::Transport(code) => *code,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use std::cell::{Cell, RefCell};
    use std::net::Ipv4Addr;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        connects: Vec<SocketAddrV4>,
        sent: Vec<Vec<u8>>,
        disconnects: usize,
        fail_send: Option<i32>,
        send_error: Option<OtaError>,
    }

    impl OtaTransport for MockTransport {
        fn connect(&mut self, addr: SocketAddrV4) -> Result<(), OtaError> {
            self.connects.push(addr);
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> Result<(), OtaError> {
            if let Some(code) = self.fail_send.take() {
                return Err(OtaError::Transport(code));
            }
            if let Some(e) = self.send_error.take() {
                return Err(e);
            }
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn request(slot: u8) -> UpdateRequest {
        UpdateRequest {
            addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 10), 8080),
            slot,
            request: b"GET /fw.bin HTTP/1.1\r\n\r\n".to_vec(),
        }
    }

    fn manager() -> OtaManager<MockTransport> {
        OtaManager::init(MockTransport::default(), FlashLayout::default(), OtaOptions::default())
    }

    fn recorder() -> (Rc<RefCell<Vec<bool>>>, impl FnOnce(bool) + 'static) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |ok| sink.borrow_mut().push(ok))
    }

    fn response(body: &[u8]) -> Vec<u8> {
        let mut raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn test_full_update() {
        let now = Instant::now();
        let layout = FlashLayout::default();
        let mut flash = MemFlash::new(layout.flash_size);
        let mut ota = manager();
        let (calls, callback) = recorder();

        ota.start(request(1), now, callback).unwrap();
        assert_eq!(ota.status(), OtaStatus::Connecting);
        ota.on_connected(now);
        assert_eq!(ota.transport().sent.len(), 1);
        ota.on_sent(now);

        let body = vec![0x5A; 4000];
        let raw = response(&body);
        ota.on_data(&mut flash, &raw[..2000], now);
        assert!(matches!(ota.status(), OtaStatus::Downloading { progress } if progress > 0 && progress < 100));
        ota.on_data(&mut flash, &raw[2000..], now);

        assert_eq!(ota.status(), OtaStatus::Ready);
        assert_eq!(ota.get_progress(), 100);
        assert_eq!(*calls.borrow(), vec![true]);
        assert_eq!(ota.transport().disconnects, 1);
        let slot1 = layout.slot(1).unwrap().base;
        assert_eq!(flash.read_vec(slot1, body.len()).unwrap(), body);

        // a late disconnect does not call back twice
        ota.on_disconnected();
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_second_start_rejected_without_disturbing_first() {
        let now = Instant::now();
        let mut flash = MemFlash::new(FlashLayout::default().flash_size);
        let mut ota = manager();
        let (calls, callback) = recorder();
        let (second_calls, second) = recorder();

        ota.start(request(1), now, callback).unwrap();
        ota.on_connected(now);
        ota.on_sent(now);
        ota.on_data(&mut flash, &response(&[1; 100])[..50], now);
        let before = ota.status();

        assert_eq!(ota.start(request(0), now, second), Err(OtaError::AlreadyInProgress));
        assert_eq!(ota.status(), before);
        assert_eq!(ota.transport().connects.len(), 1);
        assert!(second_calls.borrow().is_empty());

        ota.on_data(&mut flash, &response(&[1; 100])[50..], now);
        assert_eq!(*calls.borrow(), vec![true]);
    }

    #[test]
    fn test_timeout_reports_failure_once() {
        let now = Instant::now();
        let mut ota = manager();
        let (calls, callback) = recorder();
        ota.start(request(0), now, callback).unwrap();
        ota.poll(now + Duration::from_secs(11));
        assert_eq!(ota.status(), OtaStatus::Failed);
        ota.poll(now + Duration::from_secs(20));
        ota.on_error(-1);
        assert_eq!(*calls.borrow(), vec![false]);
        assert!(!ota.is_active());
    }

    #[test]
    fn test_send_failure_fails_session() {
        let now = Instant::now();
        let mut ota = manager();
        ota.transport_mut().fail_send = Some(-8);
        let called = Rc::new(Cell::new(None));
        let sink = called.clone();
        ota.start(request(1), now, move |ok| sink.set(Some(ok))).unwrap();
        ota.on_connected(now);
        assert_eq!(called.get(), Some(false));
    }

    #[test]
    fn test_non_transport_send_error_fails_session() {
        let now = Instant::now();
        let mut ota = manager();
        ota.transport_mut().send_error = Some(OtaError::TooLarge);
        let (calls, callback) = recorder();
        ota.start(request(1), now, callback).unwrap();
        ota.on_connected(now);
        assert_eq!(*calls.borrow(), vec![false]);
        assert!(!ota.is_active());
        assert_eq!(ota.status(), OtaStatus::Failed);
        assert_eq!(ota.transport().disconnects, 1);
    }

    #[test]
    fn test_factory_slot_refused() {
        let mut ota = manager();
        let (calls, callback) = recorder();
        assert_eq!(ota.start(request(2), Instant::now(), callback), Err(OtaError::InvalidSlot(2)));
        assert!(calls.borrow().is_empty());
        assert_eq!(ota.status(), OtaStatus::Idle);
    }

    #[test]
    fn test_cancel_and_reset() {
        let now = Instant::now();
        let mut ota = manager();
        let (calls, callback) = recorder();
        ota.start(request(1), now, callback).unwrap();
        ota.cancel();
        assert_eq!(*calls.borrow(), vec![false]);
        assert_eq!(ota.status(), OtaStatus::Failed);
        ota.reset();
        assert_eq!(ota.status(), OtaStatus::Idle);
        let (_, callback) = recorder();
        assert!(ota.start(request(1), now, callback).is_ok());
    }
}

//! Command-level update handling: parse the request, pick the slot, and act on the result.

use super::manager::{OtaManager, OtaTransport, UpdateRequest};
use super::{OtaError, OtaOptions};
use crate::boot::config::{BootConfigError, BootConfigStore};
use crate::boot::platform::BootPlatform;
use crate::flash::Flash;
use crate::layout::FlashLayout;
use crate::system::reset::perform_reset;
use log::{error, info, warn};
use std::cell::Cell;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::time::Instant;

pub const REQUEST_MAX: usize = 512;
pub const DEFAULT_PORT: u16 = 80;
pub const UPDATE_REASON: &str = "OTA update";

const REQUEST_HEADERS: &str =
    "Connection: keep-alive\r\nCache-Control: no-cache\r\nUser-Agent: slotboot/1.0\r\nAccept: */*\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdaterError {
    InvalidArguments,
    InvalidIp,
    PathTooLong,
    InProgress,
    NoSlotNumber,
    InvalidSlot,
    SetSlotFailed,
    /// Download finished but the boot slot could not be switched
    SlotAfterUpdate,
    UpdateFailed,
    Internal,
}

impl UpdaterError {
    pub fn reason(&self) -> &'static str {
        match self {
            UpdaterError::InvalidArguments => "invalid arguments",
            UpdaterError::InvalidIp => "invalid ip",
            UpdaterError::PathTooLong => "path too long",
            UpdaterError::InProgress => "update already in progress",
            UpdaterError::NoSlotNumber => "no slot number",
            UpdaterError::InvalidSlot => "invalid slot number",
            UpdaterError::SetSlotFailed => "failed to set slot",
            UpdaterError::SlotAfterUpdate => "Failed to set boot slot after update",
            UpdaterError::UpdateFailed => "Update failed",
            UpdaterError::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for UpdaterError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCommand {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Without the leading '/'
    pub path: String,
}

/// Parse `ip[:port] path`
pub fn parse_update_command(args: &str) -> Result<UpdateCommand, UpdaterError> {
    let mut parts = args.split_whitespace();
    let (Some(host), Some(path), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(UpdaterError::InvalidArguments);
    };

    let (ip, port) = match host.split_once(':') {
        Some((ip, port)) => (ip, port.parse::<u16>().map_err(|_| UpdaterError::InvalidArguments)?),
        None => (host, DEFAULT_PORT),
    };
    let ip: Ipv4Addr = ip.parse().map_err(|_| UpdaterError::InvalidIp)?;
    if port == 0 {
        return Err(UpdaterError::InvalidArguments);
    }

    let path = path.split(':').next().unwrap_or_default();
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Err(UpdaterError::InvalidArguments);
    }

    Ok(UpdateCommand { ip, port, path: path.to_string() })
}

pub fn build_request(host: &str, path: &str) -> Result<String, UpdaterError> {
    let request = format!("GET /{} HTTP/1.1\r\nHost: {}\r\n{}", path, host, REQUEST_HEADERS);
    if request.len() >= REQUEST_MAX {
        return Err(UpdaterError::PathTooLong);
    }
    Ok(request)
}

/// The upgradeable slot we are not running from
pub fn update_target(current: u8) -> u8 {
    if current == 0 {
        1
    } else {
        0
    }
}

/// Starts updates and reacts to their completion
pub struct Updater<T: OtaTransport> {
    layout: FlashLayout,
    manager: OtaManager<T>,
    finished: Rc<Cell<Option<bool>>>,
    target: Option<u8>,
}

impl<T: OtaTransport> Updater<T> {
    pub fn new(layout: FlashLayout, transport: T, options: OtaOptions) -> Self {
        let manager = OtaManager::init(transport, layout.clone(), options);
        Self { layout, manager, finished: Rc::new(Cell::new(None)), target: None }
    }

    pub fn manager(&self) -> &OtaManager<T> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut OtaManager<T> {
        &mut self.manager
    }

    /// Kick off a download into the inactive slot. Returns that slot.
    pub fn start_update<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        args: &str,
        now: Instant,
    ) -> Result<u8, UpdaterError> {
        if self.manager.is_active() || self.target.is_some() {
            return Err(UpdaterError::InProgress);
        }
        let command = parse_update_command(args)?;
        let request = build_request(&command.ip.to_string(), &command.path)?;

        let slot = update_target(get_boot_slot(flash, &self.layout)?);
        info!(
            "Update slot: {} from host: {} port: {} path: /{}",
            slot, command.ip, command.port, command.path
        );

        let finished = self.finished.clone();
        finished.set(None);
        let request = UpdateRequest {
            addr: SocketAddrV4::new(command.ip, command.port),
            slot,
            request: request.into_bytes(),
        };
        match self.manager.start(request, now, move |ok| finished.set(Some(ok))) {
            Ok(()) => {
                self.target = Some(slot);
                Ok(slot)
            }
            Err(OtaError::AlreadyInProgress) => Err(UpdaterError::InProgress),
            Err(e) => {
                error!("Failed to start update: {}", e);
                Err(UpdaterError::Internal)
            }
        }
    }

    /// Outcome of a finished download, once
    pub fn take_result(&mut self) -> Option<bool> {
        self.finished.take()
    }

    /// Handle the end of a download: switch slot and reset on success
    pub fn on_update_complete<F, P>(&mut self, flash: &mut F, ok: bool, platform: &mut P) -> Result<(), UpdaterError>
    where
        F: Flash + ?Sized,
        P: BootPlatform + ?Sized,
    {
        let target = self.target.take();
        let Some(slot) = target.filter(|_| ok) else {
            warn!("Update failed");
            return Err(UpdaterError::UpdateFailed);
        };
        info!("Update succeeded");
        if let Err(e) = write_boot_slot(flash, &self.layout, slot) {
            error!("Failed to set slot to {}: {}", slot, e);
            return Err(UpdaterError::SlotAfterUpdate);
        }
        info!("Set slot to {}", slot);
        perform_reset(flash, platform, &self.layout, UPDATE_REASON);
        Ok(())
    }

    /// Check timers and finish a completed download. Returns the completion result if one was
    /// handled.
    pub fn service<F, P>(&mut self, flash: &mut F, platform: &mut P, now: Instant) -> Option<Result<(), UpdaterError>>
    where
        F: Flash + ?Sized,
        P: BootPlatform + ?Sized,
    {
        self.manager.poll(now);
        let ok = self.take_result()?;
        Some(self.on_update_complete(flash, ok, platform))
    }
}

/// Set the slot to boot next from a command argument
pub fn set_boot_slot<F: Flash + ?Sized>(
    flash: &mut F,
    layout: &FlashLayout,
    arg: Option<&str>,
) -> Result<(), UpdaterError> {
    let arg = arg.map(str::trim).filter(|a| !a.is_empty()).ok_or(UpdaterError::NoSlotNumber)?;
    let slot = match arg.parse::<u8>() {
        Ok(slot @ 0..=1) => slot,
        _ => return Err(UpdaterError::InvalidSlot),
    };
    write_boot_slot(flash, layout, slot).map_err(|e| {
        error!("Failed to set slot to {}: {}", slot, e);
        UpdaterError::SetSlotFailed
    })
}

fn write_boot_slot<F: Flash + ?Sized>(flash: &mut F, layout: &FlashLayout, slot: u8) -> Result<(), BootConfigError> {
    let store = BootConfigStore::new(layout);
    store.load(flash)?;
    store.set_current_slot(flash, slot)
}

/// Slot the next boot will try first. A missing boot config is replaced by the default.
pub fn get_boot_slot<F: Flash + ?Sized>(flash: &mut F, layout: &FlashLayout) -> Result<u8, UpdaterError> {
    match BootConfigStore::new(layout).load(flash) {
        Ok((config, _)) => Ok(config.current_slot),
        Err(e) => {
            error!("Failed to read boot slot: {}", e);
            Err(UpdaterError::Internal)
        }
    }
}

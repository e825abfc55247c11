//! Firmware image format and validation.
//!
//! An image is an 8-byte header (magic 0xE9, section count, SPI flags, entry point) followed by
//! sections of `{load address, length, data}`. The XOR of every section data byte, seeded with
//! 0xEF, is stored in the last byte of the 16-byte block that holds the end of the last
//! section. The extended format puts a 16-byte header (magic 0xEA 0x04) and an irom blob in
//! front of a standard image; the irom bytes are not covered by the checksum.
//!
//! Images may carry a SHA-256 trailer right after the checksum byte. Older images have none and
//! still boot under the default policy.

use crate::flash::{align_up, Flash, FlashError, ERASED, SECTOR_SIZE};
use crate::layout::Region;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ROM_MAGIC: u8 = 0xE9;
pub const ROM_MAGIC_EXT1: u8 = 0xEA;
pub const ROM_MAGIC_EXT2: u8 = 0x04;
pub const CHECKSUM_INIT: u8 = 0xEF;

pub const HEADER_LEN: u32 = 8;
pub const EXT_HEADER_LEN: u32 = 16;
pub const SECTION_HEADER_LEN: u32 = 8;

/// Bytes streamed per flash read while validating
pub const READ_BUFFER: usize = 0x100;

/// Upper bound on sections tracked per image
pub const MAX_SECTIONS: usize = 16;

pub const DIGEST_MAGIC: [u8; 4] = *b"SHA2";
pub const DIGEST_TRAILER_LEN: u32 = 4 + 4 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpiMode {
    Qio,
    Qout,
    Dio,
    Dout,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpiSpeed {
    Mhz40,
    Mhz26,
    Mhz20,
    Mhz80,
    Unknown(u8),
}

/// SPI flash parameters encoded in the header flag bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashInfo {
    pub mode: SpiMode,
    pub size_code: u8,
    pub speed: SpiSpeed,
}

impl Default for FlashInfo {
    /// QIO, 32Mbit, 40MHz
    fn default() -> Self {
        Self { mode: SpiMode::Qio, size_code: 4, speed: SpiSpeed::Mhz40 }
    }
}

impl FlashInfo {
    pub fn from_flags(flags1: u8, flags2: u8) -> Self {
        let mode = match flags1 {
            0 => SpiMode::Qio,
            1 => SpiMode::Qout,
            2 => SpiMode::Dio,
            3 => SpiMode::Dout,
            other => SpiMode::Unknown(other),
        };
        let speed = match flags2 & 0x0F {
            0 => SpiSpeed::Mhz40,
            1 => SpiSpeed::Mhz26,
            2 => SpiSpeed::Mhz20,
            0x0F => SpiSpeed::Mhz80,
            other => SpiSpeed::Unknown(other),
        };
        Self { mode, size_code: flags2 >> 4, speed }
    }

    pub fn to_flags(&self) -> (u8, u8) {
        let flags1 = match self.mode {
            SpiMode::Qio => 0,
            SpiMode::Qout => 1,
            SpiMode::Dio => 2,
            SpiMode::Dout => 3,
            SpiMode::Unknown(v) => v,
        };
        let speed = match self.speed {
            SpiSpeed::Mhz40 => 0,
            SpiSpeed::Mhz26 => 1,
            SpiSpeed::Mhz20 => 2,
            SpiSpeed::Mhz80 => 0x0F,
            SpiSpeed::Unknown(v) => v & 0x0F,
        };
        (flags1, (self.size_code << 4) | speed)
    }

    /// Chip size in bytes, None for an unknown size code
    pub fn size_bytes(&self) -> Option<u32> {
        match self.size_code {
            0 => Some(0x80000),
            1 => Some(0x40000),
            2 => Some(0x100000),
            3 => Some(0x200000),
            4 => Some(0x400000),
            5 => Some(0x800000),
            6 => Some(0x1000000),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlashInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.size_bytes() {
            Some(bytes) => write!(f, "{} Mbit", bytes / 0x20000)?,
            None => write!(f, "unknown size")?,
        }
        let mode = match self.mode {
            SpiMode::Qio => "QIO",
            SpiMode::Qout => "QOUT",
            SpiMode::Dio => "DIO",
            SpiMode::Dout => "DOUT",
            SpiMode::Unknown(_) => "unknown mode",
        };
        let speed = match self.speed {
            SpiSpeed::Mhz40 => "40 MHz",
            SpiSpeed::Mhz26 => "26.7 MHz",
            SpiSpeed::Mhz20 => "20 MHz",
            SpiSpeed::Mhz80 => "80 MHz",
            SpiSpeed::Unknown(_) => "unknown speed",
        };
        write!(f, ", {}, {}", mode, speed)
    }
}

/// Standard 8-byte image header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u8,
    pub count: u8,
    pub flags1: u8,
    pub flags2: u8,
    pub entry: u32,
}

impl ImageHeader {
    pub fn parse(raw: &[u8; HEADER_LEN as usize]) -> Self {
        Self {
            magic: raw[0],
            count: raw[1],
            flags1: raw[2],
            flags2: raw[3],
            entry: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    pub fn flash_info(&self) -> FlashInfo {
        FlashInfo::from_flags(self.flags1, self.flags2)
    }

    /// Read the header at the start of the bootloader region (flash offset 0)
    pub fn read_at<F: Flash + ?Sized>(flash: &mut F, addr: u32) -> Result<Self, FlashError> {
        let mut raw = [0u8; HEADER_LEN as usize];
        flash.read(addr, &mut raw)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    pub load_addr: u32,
    /// Flash address of the section data
    pub offset: u32,
    pub len: u32,
}

/// How much integrity checking an image must pass.
///
/// The XOR checksum covers section data only, so a flipped header byte (entry point, flash
/// flags, section addresses) is caught only by the SHA-256 trailer. `mkimage` appends the
/// trailer by default; images without one are accepted under `DigestIfPresent` on the
/// checksum alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// XOR checksum only; any trailer is ignored
    Checksum,
    /// Checksum, plus the SHA-256 trailer when one is present
    #[default]
    DigestIfPresent,
    /// Checksum and a valid SHA-256 trailer
    RequireDigest,
}

/// A slot that passed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidImage {
    pub slot_base: u32,
    /// Address of the standard header the loader starts from
    pub header_addr: u32,
    pub entry: u32,
    pub flash_info: FlashInfo,
    pub sections: heapless::Vec<SectionInfo, MAX_SECTIONS>,
    pub checksum_addr: u32,
    pub digest_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    Flash(FlashError),
    /// Slot registered at address 0 or 0xFFFFFFFF
    InvalidAddress(u32),
    BadMagic(u8),
    TooManySections(u8),
    /// Image layout runs outside its slot
    OutOfBounds { addr: u32, len: u32 },
    ChecksumMismatch { stored: u8, computed: u8 },
    DigestMissing,
    DigestMismatch,
    BadDigestTrailer,
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::Flash(e) => write!(f, "flash error: {}", e),
            ImageError::InvalidAddress(addr) => write!(f, "invalid slot address 0x{:08x}", addr),
            ImageError::BadMagic(magic) => write!(f, "bad image magic 0x{:02x}", magic),
            ImageError::TooManySections(n) => write!(f, "too many sections ({})", n),
            ImageError::OutOfBounds { addr, len } => {
                write!(f, "image data 0x{:06x}+{} outside slot", addr, len)
            }
            ImageError::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch: stored 0x{:02x}, computed 0x{:02x}",
                stored, computed
            ),
            ImageError::DigestMissing => write!(f, "image has no digest"),
            ImageError::DigestMismatch => write!(f, "image digest mismatch"),
            ImageError::BadDigestTrailer => write!(f, "malformed digest trailer"),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<FlashError> for ImageError {
    fn from(e: FlashError) -> Self {
        ImageError::Flash(e)
    }
}

/// Read that must stay inside the slot
fn read_in<F: Flash + ?Sized>(
    flash: &mut F,
    slot: &Region,
    addr: u32,
    buf: &mut [u8],
) -> Result<(), ImageError> {
    if !slot.contains(addr, buf.len() as u32) {
        return Err(ImageError::OutOfBounds { addr, len: buf.len() as u32 });
    }
    flash.read(addr, buf)?;
    Ok(())
}

fn le32(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Validate the image in `slot`, streaming section data through a small buffer
pub fn check_image<F: Flash + ?Sized>(
    flash: &mut F,
    slot: &Region,
    policy: IntegrityPolicy,
) -> Result<ValidImage, ImageError> {
    if slot.base == 0 || slot.base == 0xFFFF_FFFF {
        return Err(ImageError::InvalidAddress(slot.base));
    }

    let mut raw = [0u8; EXT_HEADER_LEN as usize];
    read_in(flash, slot, slot.base, &mut raw)?;

    let header_addr = if raw[0] == ROM_MAGIC {
        slot.base
    } else if raw[0] == ROM_MAGIC_EXT1 && raw[1] == ROM_MAGIC_EXT2 {
        // skip the extended header and irom blob
        let irom_len = le32(&raw[12..16]);
        let addr = slot.base as u64 + EXT_HEADER_LEN as u64 + irom_len as u64;
        if addr >= slot.end() as u64 {
            return Err(ImageError::OutOfBounds { addr: slot.base, len: irom_len });
        }
        addr as u32
    } else {
        return Err(ImageError::BadMagic(raw[0]));
    };

    let mut hdr = [0u8; HEADER_LEN as usize];
    read_in(flash, slot, header_addr, &mut hdr)?;
    let header = ImageHeader::parse(&hdr);
    if header.magic != ROM_MAGIC {
        return Err(ImageError::BadMagic(header.magic));
    }
    if header.count as usize > MAX_SECTIONS {
        return Err(ImageError::TooManySections(header.count));
    }

    let mut sections = heapless::Vec::new();
    let mut buffer = [0u8; READ_BUFFER];
    let mut chksum = CHECKSUM_INIT;
    let mut pos = header_addr + HEADER_LEN;

    for _ in 0..header.count {
        let mut sect = [0u8; SECTION_HEADER_LEN as usize];
        read_in(flash, slot, pos, &mut sect)?;
        pos += SECTION_HEADER_LEN;
        let load_addr = le32(&sect[0..4]);
        let len = le32(&sect[4..8]);
        if !slot.contains(pos, len) {
            return Err(ImageError::OutOfBounds { addr: pos, len });
        }
        let info = SectionInfo { load_addr, offset: pos, len };

        let mut remaining = len;
        while remaining > 0 {
            let chunk = (remaining as usize).min(READ_BUFFER);
            read_in(flash, slot, pos, &mut buffer[..chunk])?;
            chksum = buffer[..chunk].iter().fold(chksum, |acc, b| acc ^ b);
            pos += chunk as u32;
            remaining -= chunk as u32;
        }
        // bounded by MAX_SECTIONS above
        let _ = sections.push(info);
    }

    let checksum_addr = pos | 0x0F;
    let mut stored = [0u8; 1];
    read_in(flash, slot, checksum_addr, &mut stored)?;
    if stored[0] != chksum {
        return Err(ImageError::ChecksumMismatch { stored: stored[0], computed: chksum });
    }

    let digest_verified = match policy {
        IntegrityPolicy::Checksum => false,
        IntegrityPolicy::DigestIfPresent | IntegrityPolicy::RequireDigest => {
            let present = verify_digest(flash, slot, checksum_addr + 1)?;
            if !present && policy == IntegrityPolicy::RequireDigest {
                return Err(ImageError::DigestMissing);
            }
            present
        }
    };

    debug!(
        "Image at 0x{:06x}: {} sections, entry 0x{:08x}",
        slot.base, header.count, header.entry
    );

    Ok(ValidImage {
        slot_base: slot.base,
        header_addr,
        entry: header.entry,
        flash_info: header.flash_info(),
        sections,
        checksum_addr,
        digest_verified,
    })
}

/// Check the trailer at `trailer_addr`. Ok(false) when there is none.
fn verify_digest<F: Flash + ?Sized>(
    flash: &mut F,
    slot: &Region,
    trailer_addr: u32,
) -> Result<bool, ImageError> {
    if !slot.contains(trailer_addr, DIGEST_TRAILER_LEN) {
        return Ok(false);
    }
    let mut trailer = [0u8; DIGEST_TRAILER_LEN as usize];
    flash.read(trailer_addr, &mut trailer)?;
    if trailer[0..4] != DIGEST_MAGIC {
        return Ok(false);
    }
    let covered = le32(&trailer[4..8]);
    if covered != trailer_addr - slot.base {
        return Err(ImageError::BadDigestTrailer);
    }

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER];
    let mut pos = slot.base;
    while pos < trailer_addr {
        let chunk = ((trailer_addr - pos) as usize).min(READ_BUFFER);
        flash.read(pos, &mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        pos += chunk as u32;
    }
    if hasher.finalize().as_slice() != &trailer[8..] {
        return Err(ImageError::DigestMismatch);
    }
    Ok(true)
}

/// Erase the sectors an image needs and program it at the start of `slot`
pub fn write_image<F: Flash + ?Sized>(
    flash: &mut F,
    slot: &Region,
    image: &[u8],
) -> Result<(), ImageError> {
    let padded_len = align_up(image.len()) as u32;
    if padded_len > slot.len {
        return Err(ImageError::OutOfBounds { addr: slot.base, len: padded_len });
    }
    let sectors = (padded_len + SECTOR_SIZE - 1) / SECTOR_SIZE;
    for sector in slot.first_sector()..slot.first_sector() + sectors {
        flash.erase_sector(sector)?;
    }
    let mut data = image.to_vec();
    data.resize(padded_len as usize, ERASED);
    flash.write(slot.base, &data)?;
    Ok(())
}

/// Assembles images in the on-flash format, for tooling and tests
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    entry: u32,
    flash_info: FlashInfo,
    sections: Vec<(u32, Vec<u8>)>,
    irom: Option<Vec<u8>>,
    digest: bool,
}

impl ImageBuilder {
    pub fn new(entry: u32) -> Self {
        Self { entry, ..Default::default() }
    }

    pub fn flash_info(mut self, info: FlashInfo) -> Self {
        self.flash_info = info;
        self
    }

    pub fn section(mut self, load_addr: u32, data: impl Into<Vec<u8>>) -> Self {
        self.sections.push((load_addr, data.into()));
        self
    }

    /// Use the extended format with this irom blob in front
    pub fn irom(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.irom = Some(data.into());
        self
    }

    /// Append a SHA-256 trailer
    pub fn with_digest(mut self) -> Self {
        self.digest = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let (flags1, flags2) = self.flash_info.to_flags();
        let mut out = Vec::new();

        if let Some(irom) = &self.irom {
            out.extend_from_slice(&[ROM_MAGIC_EXT1, ROM_MAGIC_EXT2, flags1, flags2]);
            out.extend_from_slice(&self.entry.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(irom.len() as u32).to_le_bytes());
            out.extend_from_slice(irom);
        }

        out.extend_from_slice(&[ROM_MAGIC, self.sections.len() as u8, flags1, flags2]);
        out.extend_from_slice(&self.entry.to_le_bytes());

        let mut chksum = CHECKSUM_INIT;
        for (load_addr, data) in &self.sections {
            out.extend_from_slice(&load_addr.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
            chksum = data.iter().fold(chksum, |acc, b| acc ^ b);
        }

        // slot bases are sector aligned, so offset alignment matches flash alignment
        let checksum_pos = out.len() | 0x0F;
        out.resize(checksum_pos, 0);
        out.push(chksum);

        if self.digest {
            let covered = out.len() as u32;
            let digest = Sha256::digest(&out);
            out.extend_from_slice(&DIGEST_MAGIC);
            out.extend_from_slice(&covered.to_le_bytes());
            out.extend_from_slice(digest.as_slice());
        }
        out
    }
}

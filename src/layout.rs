// Flash layout: the named regions every other module addresses flash through

use crate::flash::{is_sector_aligned, SECTOR_SIZE};
use serde::{Deserialize, Serialize};

/// Number of image slots the boot config can register
pub const MAX_SLOTS: usize = 4;

/// Upgradeable slots, the targets of OTA writes
pub const UPGRADE_SLOTS: [u8; 2] = [0, 1];

/// Index of the factory / recovery slot
pub const FACTORY_SLOT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Bootloader,
    BootConfig,
    /// Upgradeable image slot with its index
    Slot(u8),
    /// Factory image, never written by OTA
    Factory,
    Config,
    RebootReason,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub kind: RegionKind,
    pub base: u32,
    pub len: u32,
}

impl Region {
    pub const fn new(kind: RegionKind, base: u32, len: u32) -> Self {
        Self { kind, base, len }
    }

    pub fn end(&self) -> u32 {
        self.base + self.len
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && (addr as u64 + len as u64) <= self.end() as u64
    }

    pub fn first_sector(&self) -> u32 {
        self.base / SECTOR_SIZE
    }

    pub fn sector_count(&self) -> u32 {
        self.len / SECTOR_SIZE
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    Unaligned(RegionKind),
    Overlap(RegionKind, RegionKind),
    PastEnd(RegionKind),
    Missing(RegionKind),
    UnequalSlots,
    FactoryTooLarge,
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::Unaligned(kind) => write!(f, "{:?} region not sector aligned", kind),
            LayoutError::Overlap(a, b) => write!(f, "{:?} overlaps {:?}", a, b),
            LayoutError::PastEnd(kind) => write!(f, "{:?} region past end of flash", kind),
            LayoutError::Missing(kind) => write!(f, "{:?} region missing", kind),
            LayoutError::UnequalSlots => write!(f, "upgradeable slots differ in size"),
            LayoutError::FactoryTooLarge => write!(f, "factory slot larger than slot 0"),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Table of flash regions, built once and indexed everywhere else
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    pub flash_size: u32,
    pub regions: Vec<Region>,
}

impl Default for FlashLayout {
    /// 4MB device map
    fn default() -> Self {
        Self {
            flash_size: 0x400000,
            regions: vec![
                Region::new(RegionKind::Bootloader, 0x000000, 0x1000),
                Region::new(RegionKind::BootConfig, 0x001000, 0x1000),
                Region::new(RegionKind::Slot(0), 0x002000, 0xFE000),
                Region::new(RegionKind::Log, 0x100000, 0x1000),
                Region::new(RegionKind::RebootReason, 0x101000, 0x1000),
                Region::new(RegionKind::Config, 0x200000, 0x1000),
                Region::new(RegionKind::Slot(1), 0x202000, 0xFE000),
                Region::new(RegionKind::Factory, 0x302000, 0xFA000),
            ],
        }
    }
}

impl FlashLayout {
    pub fn region(&self, kind: RegionKind) -> Result<Region, LayoutError> {
        self.regions
            .iter()
            .copied()
            .find(|r| r.kind == kind)
            .ok_or(LayoutError::Missing(kind))
    }

    /// Region for a slot index as used by the boot config (2 is the factory slot)
    pub fn slot(&self, index: u8) -> Result<Region, LayoutError> {
        if index == FACTORY_SLOT {
            self.region(RegionKind::Factory)
        } else {
            self.region(RegionKind::Slot(index))
        }
    }

    /// Slot index whose region starts at `base`
    pub fn slot_at(&self, base: u32) -> Option<u8> {
        (0..MAX_SLOTS as u8).find(|&i| self.slot(i).map(|r| r.base == base).unwrap_or(false))
    }

    pub fn boot_config(&self) -> Result<Region, LayoutError> {
        self.region(RegionKind::BootConfig)
    }

    pub fn config(&self) -> Result<Region, LayoutError> {
        self.region(RegionKind::Config)
    }

    pub fn reboot_reason(&self) -> Result<Region, LayoutError> {
        self.region(RegionKind::RebootReason)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        for region in &self.regions {
            if !is_sector_aligned(region.base) || !is_sector_aligned(region.len) {
                return Err(LayoutError::Unaligned(region.kind));
            }
            if region.end() as u64 > self.flash_size as u64 {
                return Err(LayoutError::PastEnd(region.kind));
            }
        }
        for (i, a) in self.regions.iter().enumerate() {
            for b in &self.regions[i + 1..] {
                if a.overlaps(b) {
                    return Err(LayoutError::Overlap(a.kind, b.kind));
                }
            }
        }

        for kind in [RegionKind::BootConfig, RegionKind::Config] {
            self.region(kind)?;
        }
        let slot0 = self.slot(0)?;
        let slot1 = self.slot(1)?;
        let factory = self.slot(FACTORY_SLOT)?;
        if slot0.len != slot1.len {
            return Err(LayoutError::UnequalSlots);
        }
        if factory.len > slot0.len {
            return Err(LayoutError::FactoryTooLarge);
        }
        Ok(())
    }
}

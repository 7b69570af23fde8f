//! Firmware image store
//!
//! An SCP controller's flash is split into banks, each mapped at a fixed address window.
//! Which banks exist, and how large bank 1 is, depends on the [RomVariant]:
//!
//! | Variant | Banks (address, length) |
//! |---|---|
//! | Small (88k) | bank 1 (0x12000, 0x8000), bank 8 (0x82000, 0xE000) |
//! | Medium (112k) | bank 1 (0x12000, 0xE000), bank 8 (0x82000, 0xE000) |
//! | Large (216k) | bank 0 (0x02000, 0xE000), bank 1 (0x12000, 0xC000), bank 9 (0x92000, 0xE000), bank 8 (0x82000, 0xE000) |
//!
//! Every variant additionally has bank 0xFE at 0xFE2000, which is addressable but never
//! transferred, exported or checksummed.

pub mod identity;

use std::ops::Range;

use log::debug;
use strum_macros::{Display, EnumIter};

pub use identity::IdentityBlock;
use identity::IDENTITY_BLOCK_LEN;

use crate::{ReflashError, ReflashResult};

/// Detected PCM memory configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RomVariant {
    /// 88k flash
    Small,
    /// 112k flash
    Medium,
    /// 216k flash
    Large,
}

/// Memory bank of a firmware image
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bank {
    /// Bank 0
    Bank0,
    /// Bank 1
    Bank1,
    /// Bank 8
    Bank8,
    /// Bank 9
    Bank9,
    /// Bank 0xFE
    BankFE,
}

/// Every bank other than bank 1 has this length
const BANK_LEN: usize = 0xE000;

impl Bank {
    /// Bank number
    pub fn id(&self) -> u8 {
        match self {
            Bank::Bank0 => 0,
            Bank::Bank1 => 1,
            Bank::Bank8 => 8,
            Bank::Bank9 => 9,
            Bank::BankFE => 0xFE,
        }
    }

    /// Start address of the bank's window
    pub fn base_address(&self) -> u32 {
        match self {
            Bank::Bank0 => 0x0_2000,
            Bank::Bank1 => 0x1_2000,
            Bank::Bank8 => 0x8_2000,
            Bank::Bank9 => 0x9_2000,
            Bank::BankFE => 0xFE_2000,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl RomVariant {
    /// Size code the PCM uses for this variant (flash size in kB)
    pub fn size_code(&self) -> u8 {
        match self {
            RomVariant::Small => 0x58,
            RomVariant::Medium => 0x70,
            RomVariant::Large => 0xD8,
        }
    }

    /// Length of bank `bank`, or `None` if the bank doesn't exist in this variant
    pub fn bank_len(&self, bank: Bank) -> Option<usize> {
        match (self, bank) {
            (RomVariant::Small, Bank::Bank1) => Some(0x8000),
            (RomVariant::Medium, Bank::Bank1) => Some(0xE000),
            (RomVariant::Large, Bank::Bank1) => Some(0xC000),
            (RomVariant::Large, Bank::Bank0 | Bank::Bank9) => Some(BANK_LEN),
            (_, Bank::Bank8 | Bank::BankFE) => Some(BANK_LEN),
            _ => None,
        }
    }

    /// Banks holding firmware, in transfer and export order
    pub fn layout(&self) -> &'static [Bank] {
        match self {
            RomVariant::Small | RomVariant::Medium => &[Bank::Bank1, Bank::Bank8],
            RomVariant::Large => &[Bank::Bank0, Bank::Bank1, Bank::Bank9, Bank::Bank8],
        }
    }

    /// Byte ranges (bank, bytes from the start of the bank) summed by the whole image checksum
    pub fn checksum_ranges(&self) -> &'static [(Bank, usize)] {
        match self {
            RomVariant::Small => &[(Bank::Bank1, 0x8000), (Bank::Bank8, 0xE000)],
            RomVariant::Medium => &[(Bank::Bank1, 0xDF80), (Bank::Bank8, 0xE000)],
            RomVariant::Large => &[
                (Bank::Bank0, 0xE000),
                (Bank::Bank1, 0xC000),
                (Bank::Bank8, 0xE000),
                (Bank::Bank9, 0xDF80),
            ],
        }
    }

    /// Address read when probing for this variant
    pub fn probe_address(&self) -> u32 {
        match self {
            RomVariant::Small => 0x01_9FFC,
            RomVariant::Medium => 0x01_FFFC,
            RomVariant::Large => 0x09_FF00,
        }
    }

    /// Probe order: largest layout first, since smaller layouts' probe
    /// addresses are also readable on larger controllers
    pub fn probe_order() -> [RomVariant; 3] {
        [RomVariant::Large, RomVariant::Medium, RomVariant::Small]
    }

    /// Address of the identity block
    pub fn identity_address(&self) -> u32 {
        match self {
            RomVariant::Small => 0x01_9F00,
            RomVariant::Medium => 0x01_FF00,
            RomVariant::Large => 0x09_FF00,
        }
    }

    /// Bank holding the identity block
    pub fn identity_bank(&self) -> Bank {
        match self {
            RomVariant::Small | RomVariant::Medium => Bank::Bank1,
            RomVariant::Large => Bank::Bank9,
        }
    }

    /// Length of the exported firmware file
    pub fn image_len(&self) -> usize {
        self.layout().iter().filter_map(|b| self.bank_len(*b)).sum()
    }

    fn from_image_len(len: usize) -> Option<Self> {
        use strum::IntoEnumIterator;
        RomVariant::iter().find(|v| v.image_len() == len)
    }

    fn diablo_padding(&self) -> usize {
        match self {
            RomVariant::Small => 0x22000,
            RomVariant::Medium => 0x1C000,
            RomVariant::Large => 0x2000,
        }
    }
}

/// Firmware image of one PCM, split into banks
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    variant: RomVariant,
    banks: [Vec<u8>; 5],
    identity: IdentityBlock,
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("variant", &self.variant)
            .field("checksum", &format_args!("0x{:08X}", self.checksum()))
            .field("identity", &self.identity)
            .finish()
    }
}

impl FirmwareImage {
    /// Creates an all zero image for a variant
    pub fn new(variant: RomVariant) -> Self {
        let banks = [Bank::Bank0, Bank::Bank1, Bank::Bank8, Bank::Bank9, Bank::BankFE]
            .map(|b| vec![0u8; variant.bank_len(b).unwrap_or(0)]);
        let mut image = Self {
            variant,
            banks,
            identity: IdentityBlock::default(),
        };
        image.refresh_identity();
        image
    }

    /// Memory layout of the image
    pub fn variant(&self) -> RomVariant {
        self.variant
    }

    /// Contents of a bank, or `None` if the bank doesn't exist in this variant
    pub fn bank(&self, bank: Bank) -> Option<&[u8]> {
        self.variant.bank_len(bank).map(|_| self.banks[bank.index()].as_slice())
    }

    // Resolves an address range to a single bank
    fn resolve(&self, address: u32, len: usize) -> ReflashResult<(Bank, Range<usize>)> {
        let end = address as u64 + len as u64;
        for bank in [Bank::Bank0, Bank::Bank1, Bank::Bank8, Bank::Bank9, Bank::BankFE] {
            let Some(bank_len) = self.variant.bank_len(bank) else {
                continue;
            };
            let base = bank.base_address() as u64;
            if address as u64 >= base && end <= base + bank_len as u64 {
                let offset = (address as u64 - base) as usize;
                return Ok((bank, offset..offset + len));
            }
        }
        Err(ReflashError::BoundsError { address, len })
    }

    /// Reads `len` bytes starting at `address`. The range must lie within one bank
    pub fn read_bytes(&self, address: u32, len: usize) -> ReflashResult<&[u8]> {
        let (bank, range) = self.resolve(address, len)?;
        Ok(&self.banks[bank.index()][range])
    }

    /// Writes `data` starting at `address`. The range must lie within one bank.
    ///
    /// Writes reaching into the identity block window refresh [FirmwareImage::identity_block]
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> ReflashResult<()> {
        let (bank, range) = self.resolve(address, data.len())?;
        self.banks[bank.index()][range].copy_from_slice(data);
        if bank == self.variant.identity_bank()
            && address as u64 + data.len() as u64 > self.variant.identity_address() as u64
        {
            self.refresh_identity();
        }
        Ok(())
    }

    fn refresh_identity(&mut self) {
        let (bank, range) = match self.resolve(self.variant.identity_address(), IDENTITY_BLOCK_LEN) {
            Ok(r) => r,
            Err(_) => return,
        };
        let mut raw = [0u8; IDENTITY_BLOCK_LEN];
        raw.copy_from_slice(&self.banks[bank.index()][range]);
        self.identity = IdentityBlock::from_raw(raw);
    }

    /// Identity block embedded in the image
    pub fn identity_block(&self) -> &IdentityBlock {
        &self.identity
    }

    /// Replaces the identity block, writing it into the image
    pub fn set_identity_block(&mut self, block: IdentityBlock) -> ReflashResult<()> {
        let address = self.variant.identity_address();
        self.write_bytes(address, block.as_bytes())
    }

    /// Whole image checksum: unsigned sum of the bytes in [RomVariant::checksum_ranges]
    pub fn checksum(&self) -> u32 {
        self.variant
            .checksum_ranges()
            .iter()
            .flat_map(|(bank, len)| self.banks[bank.index()][..*len].iter())
            .fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
    }

    /// Exports the firmware banks concatenated in [RomVariant::layout] order
    pub fn to_bin(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.variant.image_len());
        for bank in self.variant.layout() {
            out.extend_from_slice(&self.banks[bank.index()]);
        }
        out
    }

    /// Imports a file produced by [FirmwareImage::to_bin]. The variant is detected from the file length
    pub fn from_bin(data: &[u8]) -> ReflashResult<Self> {
        let variant =
            RomVariant::from_image_len(data.len()).ok_or(ReflashError::ImageSizeUnknown(data.len()))?;
        debug!("Loading {variant} firmware image, {} bytes", data.len());
        let mut image = Self::new(variant);
        let mut offset = 0;
        for bank in variant.layout() {
            let len = variant.bank_len(*bank).unwrap_or(0);
            image.write_bytes(bank.base_address(), &data[offset..offset + len])?;
            offset += len;
        }
        Ok(image)
    }

    /// Exports the alternate layout: bank 8, bank 1, zero padding, then bank 0 and bank 9 on the
    /// large variant. Every variant produces a file of the same length
    pub fn to_diablo_bin(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.banks[Bank::Bank8.index()]);
        out.extend_from_slice(&self.banks[Bank::Bank1.index()]);
        out.resize(out.len() + self.variant.diablo_padding(), 0);
        if self.variant == RomVariant::Large {
            out.extend_from_slice(&self.banks[Bank::Bank0.index()]);
            out.extend_from_slice(&self.banks[Bank::Bank9.index()]);
        }
        out
    }
}

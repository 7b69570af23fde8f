//! Identity block codec
//!
//! Every SCP firmware image carries a 256 byte block near the top of one of its banks
//! which holds the vehicle's identity: VIN, PATS (immobilizer) key material, strategy and
//! calibration file names. The block protects itself with a 16 bit checksum in its last
//! two bytes.
//!
//! Field map:
//!
//! | Offset | Length | Field |
//! |---|---|---|
//! | 0x06 | 11 | Calibration file name |
//! | 0x14 | 7 | Strategy name |
//! | 0x1C | 16 | PATS key |
//! | 0x60 | 2 | Axle ratio, signed, 2^-10 scale |
//! | 0x63 | 29 | Copyright text |
//! | 0x80 | 21 | VIN |
//! | 0xFE | 2 | Checksum, little endian |

/// Size of the identity block
pub const IDENTITY_BLOCK_LEN: usize = 0x100;

const FILE_NAME: (usize, usize) = (0x06, 0x0B);
const STRATEGY_NAME: (usize, usize) = (0x14, 0x07);
const PATS_KEY: (usize, usize) = (0x1C, 0x10);
const AXLE_RATIO: usize = 0x60;
const COPYRIGHT: (usize, usize) = (0x63, 0x1D);
const VIN: (usize, usize) = (0x80, 0x15);
const CHECKSUM: usize = 0xFE;

/// Length of the PATS key material
pub const PATS_KEY_LEN: usize = PATS_KEY.1;
/// Length of the VIN field
pub const VIN_LEN: usize = VIN.1;

/// 256 byte identity block.
///
/// Every setter recomputes the checksum before returning. Blocks built with
/// [IdentityBlock::from_raw] keep whatever checksum they were given, so
/// [IdentityBlock::is_checksum_valid] reports the state of the source data.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityBlock {
    raw: [u8; IDENTITY_BLOCK_LEN],
}

impl std::fmt::Debug for IdentityBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityBlock")
            .field("vin", &self.vin())
            .field("strategy", &self.strategy_name())
            .field("file_name", &self.file_name())
            .field("checksum", &format_args!("0x{:04X}", self.checksum()))
            .field("checksum_valid", &self.is_checksum_valid())
            .finish()
    }
}

impl Default for IdentityBlock {
    fn default() -> Self {
        let mut block = Self {
            raw: [0; IDENTITY_BLOCK_LEN],
        };
        block.fix_checksum();
        block
    }
}

impl IdentityBlock {
    /// Wraps raw identity block bytes as they are, without touching the checksum
    pub fn from_raw(raw: [u8; IDENTITY_BLOCK_LEN]) -> Self {
        Self { raw }
    }

    /// Raw block bytes
    pub fn as_bytes(&self) -> &[u8; IDENTITY_BLOCK_LEN] {
        &self.raw
    }

    fn text(&self, (offset, len): (usize, usize)) -> String {
        String::from_utf8_lossy(&self.raw[offset..offset + len]).into_owned()
    }

    // Copies at most `len` bytes into the field, zero filling the rest
    fn set_field(&mut self, (offset, len): (usize, usize), value: &[u8]) {
        let field = &mut self.raw[offset..offset + len];
        let n = value.len().min(len);
        field[..n].copy_from_slice(&value[..n]);
        field[n..].fill(0);
        self.fix_checksum();
    }

    /// Calibration file name
    pub fn file_name(&self) -> String {
        self.text(FILE_NAME)
    }

    /// Sets the calibration file name. Truncated to 11 bytes
    pub fn set_file_name(&mut self, name: &str) {
        self.set_field(FILE_NAME, name.as_bytes())
    }

    /// Strategy name
    pub fn strategy_name(&self) -> String {
        self.text(STRATEGY_NAME)
    }

    /// Sets the strategy name. Truncated to 7 bytes
    pub fn set_strategy_name(&mut self, name: &str) {
        self.set_field(STRATEGY_NAME, name.as_bytes())
    }

    /// Copyright text
    pub fn copyright(&self) -> String {
        self.text(COPYRIGHT)
    }

    /// Sets the copyright text. Truncated to 29 bytes
    pub fn set_copyright(&mut self, text: &str) {
        self.set_field(COPYRIGHT, text.as_bytes())
    }

    /// VIN as text
    pub fn vin(&self) -> String {
        self.text(VIN)
    }

    /// Raw VIN field bytes
    pub fn vin_bytes(&self) -> [u8; VIN_LEN] {
        let mut out = [0; VIN_LEN];
        out.copy_from_slice(&self.raw[VIN.0..VIN.0 + VIN.1]);
        out
    }

    /// Sets the VIN. Truncated to 21 bytes
    pub fn set_vin(&mut self, vin: &[u8]) {
        self.set_field(VIN, vin)
    }

    /// PATS immobilizer key material
    pub fn pats_key(&self) -> [u8; PATS_KEY_LEN] {
        let mut out = [0; PATS_KEY_LEN];
        out.copy_from_slice(&self.raw[PATS_KEY.0..PATS_KEY.0 + PATS_KEY.1]);
        out
    }

    /// Sets the PATS key material
    pub fn set_pats_key(&mut self, key: &[u8; PATS_KEY_LEN]) {
        self.set_field(PATS_KEY, key)
    }

    /// Axle ratio. Stored as a signed 16 bit value scaled by 2^10
    pub fn axle_ratio(&self) -> f32 {
        let raw = i16::from_le_bytes([self.raw[AXLE_RATIO], self.raw[AXLE_RATIO + 1]]);
        raw as f32 / 1024.0
    }

    /// Sets the axle ratio. Values outside the representable range saturate
    pub fn set_axle_ratio(&mut self, ratio: f32) {
        let raw = (ratio * 1024.0) as i16;
        self.set_field((AXLE_RATIO, 2), &raw.to_le_bytes())
    }

    /// Copies the PATS key and VIN from another block, so the image being written
    /// keeps the identity of the vehicle it is written to
    pub fn transplant_from(&mut self, other: &IdentityBlock) {
        let vin = other.vin_bytes();
        self.raw[VIN.0..VIN.0 + VIN.1].copy_from_slice(&vin);
        self.set_pats_key(&other.pats_key());
    }

    /// Checksum stored in the block
    pub fn checksum(&self) -> u16 {
        u16::from_le_bytes([self.raw[CHECKSUM], self.raw[CHECKSUM + 1]])
    }

    /// Checksum of the block contents: bit complement of the sum of all
    /// little endian 16 bit words before the checksum field
    pub fn calculate_checksum(&self) -> u16 {
        !self.raw[..CHECKSUM]
            .chunks_exact(2)
            .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
    }

    /// Returns true if the stored checksum matches the block contents
    pub fn is_checksum_valid(&self) -> bool {
        self.checksum() == self.calculate_checksum()
    }

    fn fix_checksum(&mut self) {
        let cs = self.calculate_checksum();
        self.raw[CHECKSUM..].copy_from_slice(&cs.to_le_bytes());
    }
}

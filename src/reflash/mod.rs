//! The reflash session controller
//!
//! A [ReflashSession] owns one [PwmChannel] for its lifetime and walks the controller through
//! the reflash handshake (see [ReflashState]) before any firmware is transferred.
//!
//! ## Reading firmware
//! ```no_run
//! use scp_reflash::reflash::{ReflashOptions, ReflashSession};
//! use scp_reflash::security::RngSalt;
//! # fn channel() -> scp_reflash::hardware::simulation::SimulatedPcm { unimplemented!() }
//!
//! let mut session = ReflashSession::new(channel(), ReflashOptions::default(), &mut RngSalt::thread());
//! let image = session.read_firmware().unwrap();
//! std::fs::write("read.bin", image.to_bin()).unwrap();
//! session.finish().unwrap();
//! ```
//!
//! Any failing operation leaves the session in [ReflashState::Failed]. A failed session
//! refuses every further operation with [ReflashError::SessionFailed], a new session
//! has to be created.

mod handshake;
mod transfer;

use std::time::Duration;

use log::{error, info};

use crate::{
    ReflashError, ReflashErrorKind, ReflashResult,
    channel::{PinVoltage, PwmChannel},
    image::{FirmwareImage, IdentityBlock, RomVariant},
    security::SaltSource,
};

/// OBD connector pin which carries the flash programming voltage
pub const PROGRAMMING_PIN: u8 = 13;
/// Flash programming voltage in millivolts
pub const PROGRAMMING_MILLIVOLTS: u32 = 18_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Reflash session options
pub struct ReflashOptions {
    /// Request 83.3kbps once level 2 security access is granted
    pub high_speed: bool,
    /// How long to wait for the controller's presence broadcast.
    /// `None` waits forever
    pub broadcast_timeout_ms: Option<u32>,
    /// Interval between presence broadcast checks
    pub broadcast_poll_ms: u32,
    /// Diagnostic heartbeat interval
    pub heartbeat_interval_ms: u32,
    /// Time the flash erase routine is given before it is stopped
    pub erase_settle_ms: u32,
    /// Time the checksum routine is given before it is stopped
    pub checksum_settle_ms: u32,
    /// Time allowed for all packets of one uploaded block to arrive
    pub transfer_rx_window_ms: u32,
    /// Attempts made at downloading a block which keeps failing without results
    pub write_attempts: u32,
}

impl Default for ReflashOptions {
    fn default() -> Self {
        Self {
            high_speed: true,
            broadcast_timeout_ms: None,
            broadcast_poll_ms: 200,
            heartbeat_interval_ms: 3000,
            erase_settle_ms: 4000,
            checksum_settle_ms: 2000,
            transfer_rx_window_ms: 600,
            write_attempts: 3,
        }
    }
}

/// Stage of the reflash handshake a session has reached
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReflashState {
    /// Nothing has been sent yet
    Idle,
    /// Link is being configured for reflash
    ConfigInit,
    /// Programming voltage is on, waiting for the controller's presence broadcast
    AwaitBroadcast,
    /// Periodic heartbeat is running
    HeartbeatStarted,
    /// Reflash entry routine was requested
    EntryRequested,
    /// Level 1 seed was requested
    Level1Challenged,
    /// Level 1 key was accepted
    Level1Granted,
    /// Level 2 seed was requested
    Level2Challenged,
    /// Level 2 key was accepted
    Level2Granted,
    /// Baud rate change to 83.3kbps was requested
    HighSpeedRequested,
    /// Handshake completed. Firmware can be transferred
    Ready,
    /// An operation failed. The session cannot be used anymore
    Failed(ReflashErrorKind),
}

/// Reflash session with one controller
#[derive(Debug)]
pub struct ReflashSession<C: PwmChannel> {
    channel: C,
    salt: u8,
    options: ReflashOptions,
    state: ReflashState,
    variant: Option<RomVariant>,
    target_identity: Option<IdentityBlock>,
}

impl<C: PwmChannel> ReflashSession<C> {
    /// Creates a new session, drawing the salt for the reflash entry request from `salt`
    ///
    /// ## Parameters
    /// * channel - Channel to the controller. The session owns it until [ReflashSession::into_channel]
    /// * options - Session options
    /// * salt - Source of the session salt. Exactly one salt is drawn
    pub fn new(channel: C, options: ReflashOptions, salt: &mut impl SaltSource) -> Self {
        Self::with_salt(channel, options, salt.next_salt())
    }

    /// Creates a new session with a known salt
    pub fn with_salt(channel: C, options: ReflashOptions, salt: u8) -> Self {
        Self {
            channel,
            salt,
            options,
            state: ReflashState::Idle,
            variant: None,
            target_identity: None,
        }
    }

    /// Current handshake state
    pub fn state(&self) -> ReflashState {
        self.state
    }

    /// Salt sent with the reflash entry request
    pub fn salt(&self) -> u8 {
        self.salt
    }

    /// Session options
    pub fn options(&self) -> ReflashOptions {
        self.options
    }

    /// Memory layout found by the last probe
    pub fn variant(&self) -> Option<RomVariant> {
        self.variant
    }

    /// Identity block read from the controller by the last [ReflashSession::read_identity_block]
    /// or [ReflashSession::write_firmware]
    pub fn target_identity(&self) -> Option<&IdentityBlock> {
        self.target_identity.as_ref()
    }

    /// Mutable access to the channel
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Releases the channel
    pub fn into_channel(self) -> C {
        self.channel
    }

    fn set_state(&mut self, state: ReflashState) {
        log::debug!("Reflash state {:?} -> {state:?}", self.state);
        self.state = state;
    }

    fn sleep_ms(ms: u32) {
        if ms != 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }

    // Runs an operation, moving the session to `Failed` if it errors
    fn tracked<T>(&mut self, op: impl FnOnce(&mut Self) -> ReflashResult<T>) -> ReflashResult<T> {
        if let ReflashState::Failed(kind) = self.state {
            return Err(ReflashError::SessionFailed(kind));
        }
        let res = op(self);
        if let Err(e) = &res {
            error!("Reflash session failed: {e}");
            self.state = ReflashState::Failed(ReflashErrorKind::from(e));
        }
        res
    }

    fn ensure_ready(&self, step: &'static str) -> ReflashResult<()> {
        match self.state {
            ReflashState::Failed(kind) => Err(ReflashError::SessionFailed(kind)),
            ReflashState::Ready => Ok(()),
            s => Err(ReflashError::protocol(step, format!("handshake not complete, session is {s:?}"))),
        }
    }

    /// Runs the reflash handshake, leaving the controller unlocked and in reflash mode.
    /// Does nothing if the session is already [ReflashState::Ready]
    pub fn handshake(&mut self) -> ReflashResult<()> {
        self.tracked(|s| s.run_handshake())
    }

    /// Detects the controller's memory layout by trying a read at each layout's probe address,
    /// largest layout first
    pub fn probe_layout(&mut self) -> ReflashResult<RomVariant> {
        self.tracked(|s| s.run_probe())
    }

    /// Reads the 256 byte identity block from the controller, 4 bytes at a time.
    /// Probes the memory layout first if it isn't known yet
    pub fn read_identity_block(&mut self) -> ReflashResult<IdentityBlock> {
        self.ensure_ready("identity read")?;
        self.tracked(|s| s.run_identity_read())
    }

    /// Erases the controller's flash
    pub fn erase_flash(&mut self) -> ReflashResult<()> {
        self.ensure_ready("erase")?;
        self.tracked(|s| s.run_erase())
    }

    /// Asks the controller to verify its flash against the checksum of `image`.
    ///
    /// ## Returns
    /// `true` only if the controller confirmed the checksum
    pub fn verify_checksum(&mut self, image: &FirmwareImage) -> ReflashResult<bool> {
        self.ensure_ready("checksum")?;
        self.tracked(|s| s.run_checksum(image))
    }

    /// Uploads `len` bytes of flash starting at `address`, in 1024 byte blocks.
    /// A range outside the 24 bit address space is a [ReflashError::BoundsError], which
    /// doesn't fail the session
    pub fn read_range(&mut self, address: u32, len: usize) -> ReflashResult<Vec<u8>> {
        self.ensure_ready("block upload")?;
        transfer::check_range(address, len)?;
        self.tracked(|s| s.upload_range(address, len))
    }

    /// Programs `data` at `address`, highest block first.
    /// `data` must be a whole number of 1024 byte blocks within the 24 bit address space
    pub fn program_bank(&mut self, address: u32, data: &[u8]) -> ReflashResult<()> {
        self.ensure_ready("block download")?;
        transfer::check_blocks(address, data)?;
        self.tracked(|s| s.download_range(address, data))
    }

    /// Reads the complete firmware from the controller.
    ///
    /// Runs the handshake unless the session is already ready, probes the memory layout, uploads every bank, then has the controller
    /// confirm the checksum of what was read. No image is returned unless every step succeeded.
    pub fn read_firmware(&mut self) -> ReflashResult<FirmwareImage> {
        self.tracked(|s| {
            s.run_handshake()?;
            let variant = s.run_probe()?;
            let mut image = FirmwareImage::new(variant);
            for bank in variant.layout() {
                let len = variant.bank_len(*bank).unwrap_or(0);
                info!("Reading bank {} (0x{:06X}, 0x{len:X} bytes)", bank.id(), bank.base_address());
                let data = s.upload_range(bank.base_address(), len)?;
                image.write_bytes(bank.base_address(), &data)?;
            }
            if !s.run_checksum(&image)? {
                return Err(ReflashError::ChecksumMismatch);
            }
            info!("Firmware read complete, checksum 0x{:08X}", image.checksum());
            Ok(image)
        })
    }

    /// Writes a complete firmware image to the controller.
    ///
    /// Runs the handshake unless the session is already ready, and requires the probed layout to match `image`. The controller's current
    /// identity block is read first. With `transfer_vin`, its VIN and PATS key are copied into
    /// `image` before it is written, so the controller keeps working with the vehicle's keys.
    /// The flash is then erased, every bank programmed, and the checksum confirmed by the controller.
    pub fn write_firmware(&mut self, image: &mut FirmwareImage, transfer_vin: bool) -> ReflashResult<()> {
        self.tracked(|s| {
            s.run_handshake()?;
            let target = s.run_probe()?;
            if target != image.variant() {
                return Err(ReflashError::LayoutMismatch {
                    image: image.variant(),
                    target,
                });
            }
            let current = s.run_identity_read()?;
            if transfer_vin {
                info!("Keeping target VIN {}", current.vin().trim_end_matches('\0'));
                let mut block = image.identity_block().clone();
                block.transplant_from(&current);
                image.set_identity_block(block)?;
            }
            s.run_erase()?;
            for bank in image.variant().layout() {
                let Some(data) = image.bank(*bank) else {
                    continue;
                };
                info!("Programming bank {} (0x{:06X}, 0x{:X} bytes)", bank.id(), bank.base_address(), data.len());
                s.download_range(bank.base_address(), data)?;
            }
            if !s.run_checksum(image)? {
                return Err(ReflashError::ChecksumMismatch);
            }
            info!("Firmware write complete, checksum 0x{:08X}", image.checksum());
            Ok(())
        })
    }

    /// Stops the heartbeat and switches the programming voltage off. Call once the session is
    /// done with the controller, also after a failure
    pub fn finish(&mut self) -> ReflashResult<()> {
        self.channel.stop_periodic()?;
        self.channel.set_programming_voltage(PROGRAMMING_PIN, PinVoltage::Off)?;
        Ok(())
    }
}

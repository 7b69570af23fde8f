#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for reading and reprogramming ("reflashing") Ford SCP powertrain controllers
//! over the J1850 PWM data-link.
//!
//! ## What this crate does
//!
//! The reflash engine authenticates with an engine/transmission controller, detects its
//! memory layout, and performs full firmware upload (read) and download (erase + program)
//! cycles, with the controller's on-device checksum routine as the final gate.
//!
//! The pieces, leaf first:
//! * [security] - The seed/key challenge-response cipher used to unlock programming access
//! * [image::identity] - Codec for the 256 byte identity block (VIN, PATS key, strategy) embedded in firmware
//! * [image] - Fixed layout firmware image, split into memory banks sized by [image::RomVariant]
//! * [reflash] - The session controller: handshake, memory probe, block transfer, erase and checksum
//!
//! ## Hardware
//!
//! The engine talks to the bus through the [channel::PwmChannel] trait. A J1850 PWM channel
//! built on a raw frame device is provided in [hardware::pwm], and [hardware::simulation]
//! contains a simulated controller which is useful for testing without a vehicle.
//!
//! **WARNING** Reflashing a controller can leave it unable to start the vehicle if interrupted.
//! Ensure a stable supply voltage before running a write cycle.

use strum_macros::EnumDiscriminants;

pub mod channel;
pub mod hardware;
pub mod image;
pub mod j2190;
pub mod reflash;
pub mod security;

pub use channel::ChannelError;
pub use image::RomVariant;

/// Reflash engine result
pub type ReflashResult<T> = Result<T, ReflashError>;

#[derive(Debug, thiserror::Error, EnumDiscriminants)]
#[strum_discriminants(name(ReflashErrorKind), derive(Hash, strum_macros::Display))]
/// Reflash engine error
pub enum ReflashError {
    /// Address and/or length is not fully contained in any bank of the image
    #[error("Address 0x{address:06X} (length 0x{len:X}) is outside of every memory bank")]
    BoundsError {
        /// Requested start address
        address: u32,
        /// Requested length in bytes
        len: usize,
    },
    /// None of the memory layout probe addresses could be read
    #[error("Memory layout is unknown, no probe address responded")]
    UnknownLayout,
    /// Firmware image being written was built for a different controller layout
    #[error("Firmware image is for {image:?}, but target controller is {target:?}")]
    LayoutMismatch {
        /// Layout of the image
        image: RomVariant,
        /// Layout probed on the controller
        target: RomVariant,
    },
    /// Controller refused to enter reflash mode
    #[error("Controller rejected reflash entry")]
    EntryRejected,
    /// Level 1 security access was denied
    #[error("Security access level 1 denied")]
    Level1Denied,
    /// Level 2 security access was denied
    #[error("Security access level 2 denied")]
    Level2Denied,
    /// Block download kept failing with a recoverable response
    #[error("Block at 0x{address:06X} failed to transfer after {attempts} attempts")]
    TransferRetryExhausted {
        /// Target address of the failing block
        address: u32,
        /// Number of attempts made
        attempts: u32,
    },
    /// Controller responded with something unexpected for the current step
    #[error("Unexpected response during {step}: {detail}")]
    ProtocolError {
        /// Protocol step which failed
        step: &'static str,
        /// What was received instead
        detail: String,
    },
    /// On-device checksum routine did not confirm the image checksum
    #[error("On-device checksum verification failed")]
    ChecksumMismatch,
    /// Controller presence broadcast was not seen in time
    #[error("No presence broadcast from controller within {0}ms")]
    BroadcastTimeout(u32),
    /// Firmware file length does not match any known layout
    #[error("Firmware file size 0x{0:X} does not match any known layout")]
    ImageSizeUnknown(usize),
    /// The session previously failed and cannot be reused
    #[error("Reflash session already failed ({0}), a new session is required")]
    SessionFailed(ReflashErrorKind),
    /// Error with underlying communication channel
    #[error("Reflash channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
}

impl ReflashError {
    pub(crate) fn protocol(step: &'static str, detail: impl Into<String>) -> Self {
        Self::ProtocolError {
            step,
            detail: detail.into(),
        }
    }
}

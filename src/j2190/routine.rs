//! Diagnostic routine start/stop wrappers

use super::{SaeMessage, SaeMode, SaeResponse};
use crate::channel::{ChannelResult, PwmChannel};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Routine identifiers understood by the SCP reflash kernel
pub enum DiagRoutine {
    /// Enters reflash mode. Parameters are the block count, the session salt and a terminator
    ReflashEntry,
    /// Erases all flash banks. Runs asynchronously
    EraseFlash,
    /// Commits the last transferred block to flash
    WriteFlash,
    /// Compares a 16 bit checksum against the flash contents. Runs asynchronously
    Checksum,
    /// Changes the bus data rate
    BaudRate,
    /// Routine not covered by this crate
    Other(u8),
}

impl From<DiagRoutine> for u8 {
    fn from(r: DiagRoutine) -> Self {
        match r {
            DiagRoutine::ReflashEntry => 0xA0,
            DiagRoutine::EraseFlash => 0xA1,
            DiagRoutine::WriteFlash => 0xA2,
            DiagRoutine::Checksum => 0xA3,
            DiagRoutine::BaudRate => 0xA4,
            DiagRoutine::Other(x) => x,
        }
    }
}

impl From<u8> for DiagRoutine {
    fn from(x: u8) -> Self {
        match x {
            0xA0 => DiagRoutine::ReflashEntry,
            0xA1 => DiagRoutine::EraseFlash,
            0xA2 => DiagRoutine::WriteFlash,
            0xA3 => DiagRoutine::Checksum,
            0xA4 => DiagRoutine::BaudRate,
            x => DiagRoutine::Other(x),
        }
    }
}

/// Baud rate routine parameter selecting 83.3kbps
pub const BAUD_RATE_83K: u8 = 0x03;

/// Starts a routine on the PCM
///
/// ## Parameters
/// * channel - The channel to the PCM
/// * routine - Routine to start
/// * params - Routine entry parameters
pub fn start_routine<C: PwmChannel + ?Sized>(
    channel: &mut C,
    routine: DiagRoutine,
    params: &[u8],
) -> ChannelResult<SaeResponse> {
    let mut p = vec![u8::from(routine)];
    p.extend_from_slice(params);
    channel.transact(&SaeMessage::to_pcm(SaeMode::StartRoutine, &p))
}

/// Stops a routine on the PCM. Asynchronous routines report their outcome here
pub fn stop_routine<C: PwmChannel + ?Sized>(
    channel: &mut C,
    routine: DiagRoutine,
) -> ChannelResult<SaeResponse> {
    channel.transact(&SaeMessage::to_pcm(
        SaeMode::StopRoutine,
        &[u8::from(routine)],
    ))
}

//! Functions for unlocking programming access on the PCM

use super::{SaeMessage, SaeMode, SaeResponse};
use crate::channel::{ChannelResult, PwmChannel};

/// Sub-function requesting a seed
pub const REQUEST_SEED: u8 = 0x01;
/// Sub-function submitting a key
pub const SEND_KEY: u8 = 0x02;

/// Requests a seed from the PCM.
///
/// Both security levels use the same request. The PCM decides which level the seed
/// belongs to from how many levels are already unlocked.
///
/// ## Returns
/// The 3 byte seed, or `None` if the PCM answered with anything other than a 3 byte seed.
/// The raw response is returned alongside for logging
pub fn request_seed<C: PwmChannel + ?Sized>(
    channel: &mut C,
) -> ChannelResult<(Option<[u8; 3]>, SaeResponse)> {
    let resp = channel.transact_raw(
        &SaeMessage::to_pcm(SaeMode::SecurityAccess, &[REQUEST_SEED]),
        1,
    )?;
    let seed = if resp.is_positive_for(SaeMode::SecurityAccess) {
        <[u8; 3]>::try_from(resp.data.as_slice()).ok()
    } else {
        None
    };
    Ok((seed, resp))
}

/// Submits a computed key to the PCM. The response carries
/// [super::ResponseCode::SecurityAccessAllowed] if the key was accepted
pub fn send_key<C: PwmChannel + ?Sized>(channel: &mut C, key: [u8; 2]) -> ChannelResult<SaeResponse> {
    channel.transact_raw(
        &SaeMessage::to_pcm(SaeMode::SecurityAccess, &[SEND_KEY, key[0], key[1]]),
        1,
    )
}

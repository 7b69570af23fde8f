//! Reads contents of the PCM's address space

use super::{SaeMessage, SaeMode, SaeResponse};
use crate::channel::{ChannelResult, PwmChannel};

/// Number of bytes returned by a single addressed read
pub const READ_LOCATION_LEN: usize = 4;

/// Reads 4 bytes of memory on the PCM given a 24 bit address.
/// Any bits above 24 in `address` are ignored.
///
/// The raw response is returned since a refused read is a normal outcome
/// when probing the memory layout. Use [location_data] to extract the bytes
pub fn read_location<C: PwmChannel + ?Sized>(channel: &mut C, address: u32) -> ChannelResult<SaeResponse> {
    let mut msg = SaeMessage::to_pcm(SaeMode::DataByAddress, &[]);
    msg.push_u24(address);
    channel.transact_raw(&msg, 2)
}

/// Returns the memory contents carried by a positive addressed read response
pub fn location_data(resp: &SaeResponse) -> Option<[u8; READ_LOCATION_LEN]> {
    if !resp.is_positive_for(SaeMode::DataByAddress) {
        return None;
    }
    <[u8; READ_LOCATION_LEN]>::try_from(resp.data.as_slice()).ok()
}

//! Segmented block transfer (upload and download) requests

use super::{SaeMessage, SaeMode, SaeResponse};
use crate::channel::{ChannelResult, PwmChannel};

/// Block length of every upload and download
pub const BLOCK_LEN: usize = 0x400;
/// Data bytes carried by a single transfer packet
pub const PACKET_LEN: usize = 6;
/// Transfer packets making up one block. The final packet of a download carries the
/// last 4 data bytes plus the block checksum
pub const PACKETS_PER_BLOCK: usize = BLOCK_LEN / PACKET_LEN + 1;
/// Bank selector byte sent with every transfer request
pub const BANK_SELECT: u8 = 0x80;

fn transfer_request(mode: SaeMode, address: u32) -> SaeMessage {
    let mut msg = SaeMessage::to_pcm(mode, &[BANK_SELECT]);
    msg.push_u16(BLOCK_LEN as u16).push_u24(address);
    msg
}

/// Asks the PCM to upload one block starting at `address`
pub fn request_upload<C: PwmChannel + ?Sized>(channel: &mut C, address: u32) -> ChannelResult<SaeResponse> {
    channel.transact_raw(&transfer_request(SaeMode::RequestUpload, address), 2)
}

/// Asks the PCM to accept one block to be written at `address`
pub fn request_download<C: PwmChannel + ?Sized>(channel: &mut C, address: u32) -> ChannelResult<SaeResponse> {
    channel.transact_raw(&transfer_request(SaeMode::RequestDownload, address), 2)
}

/// Ends the current block transfer
pub fn transfer_exit<C: PwmChannel + ?Sized>(channel: &mut C) -> ChannelResult<SaeResponse> {
    channel.transact(&SaeMessage::to_pcm(SaeMode::TransferExit, &[BANK_SELECT]))
}

/// Sum of every byte in the block, truncated to 16 bits
pub fn block_checksum(block: &[u8]) -> u16 {
    block.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

/// Splits a block into download packets: 170 packets of 6 bytes, then a final packet of the
/// remaining 4 bytes followed by the block checksum, high byte first
pub fn download_packets(block: &[u8; BLOCK_LEN]) -> Vec<SaeMessage> {
    let tail = BLOCK_LEN - 4;
    let mut packets: Vec<SaeMessage> = block[..tail]
        .chunks(PACKET_LEN)
        .map(|c| SaeMessage::to_pcm(SaeMode::DataTransfer, c))
        .collect();
    let mut last = SaeMessage::to_pcm(SaeMode::DataTransfer, &block[tail..]);
    last.push_u16(block_checksum(block));
    packets.push(last);
    packets
}

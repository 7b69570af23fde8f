//! Block upload and download, flash erase and on-device checksum

use log::{debug, error, info, warn};

use super::ReflashSession;
use crate::{
    ReflashError, ReflashResult,
    channel::{PwmChannel, RxFilterId},
    image::FirmwareImage,
    j2190::{
        PCM_ADDRESS, ResponseCode, SaeMode, expect_code,
        routine::{self, DiagRoutine},
        transfer::{self, BLOCK_LEN, PACKETS_PER_BLOCK},
    },
};

/// Transfer requests carry a 24 bit address
const ADDRESS_LIMIT: u64 = 0x100_0000;

/// Rejects a transfer range which doesn't fit the 24 bit address space
pub(super) fn check_range(address: u32, len: usize) -> ReflashResult<()> {
    if address as u64 + len as u64 > ADDRESS_LIMIT {
        return Err(ReflashError::BoundsError { address, len });
    }
    Ok(())
}

/// Download data must also be a whole number of blocks
pub(super) fn check_blocks(address: u32, data: &[u8]) -> ReflashResult<()> {
    check_range(address, data.len())?;
    if data.len() % BLOCK_LEN != 0 {
        return Err(ReflashError::BoundsError {
            address,
            len: data.len(),
        });
    }
    Ok(())
}

impl<C: PwmChannel> ReflashSession<C> {
    pub(super) fn upload_range(&mut self, address: u32, len: usize) -> ReflashResult<Vec<u8>> {
        check_range(address, len)?;
        let filter = self
            .channel
            .create_rx_filter(PCM_ADDRESS, u8::from(SaeMode::DataTransfer))?;
        let res = self.upload_blocks(filter, address, len);
        // The filter goes away even if the upload failed
        let destroyed = self.channel.destroy_rx_filter(filter);
        let data = res?;
        destroyed?;
        Ok(data)
    }

    fn upload_blocks(&mut self, filter: RxFilterId, address: u32, len: usize) -> ReflashResult<Vec<u8>> {
        let mut data = Vec::with_capacity(len.next_multiple_of(BLOCK_LEN));
        for offset in (0..len).step_by(BLOCK_LEN) {
            let block = self.upload_block(filter, address + offset as u32)?;
            data.extend_from_slice(&block);
        }
        data.truncate(len);
        Ok(data)
    }

    fn upload_block(&mut self, filter: RxFilterId, address: u32) -> ReflashResult<Vec<u8>> {
        debug!("Uploading block 0x{address:06X}");
        let resp = transfer::request_upload(&mut self.channel, address)?;
        expect_code("upload request", &resp, &[ResponseCode::Affirmative])?;

        let packets = self
            .channel
            .receive(filter, PACKETS_PER_BLOCK, self.options.transfer_rx_window_ms)?;
        if packets.len() != PACKETS_PER_BLOCK {
            error!(
                "Block 0x{address:06X}: received {} of {PACKETS_PER_BLOCK} packets",
                packets.len()
            );
            return Err(ReflashError::protocol(
                "block upload",
                format!("received {} of {PACKETS_PER_BLOCK} packets at 0x{address:06X}", packets.len()),
            ));
        }
        let mut block = packets.concat();
        if block.len() < BLOCK_LEN {
            return Err(ReflashError::protocol(
                "block upload",
                format!("block 0x{address:06X} is only {} bytes", block.len()),
            ));
        }
        block.truncate(BLOCK_LEN);

        let resp = transfer::transfer_exit(&mut self.channel)?;
        expect_code("upload exit", &resp, &[ResponseCode::Affirmative])?;
        Ok(block)
    }

    pub(super) fn download_range(&mut self, address: u32, data: &[u8]) -> ReflashResult<()> {
        check_blocks(address, data)?;
        // Highest block first
        for (i, chunk) in data.chunks_exact(BLOCK_LEN).enumerate().rev() {
            let block: &[u8; BLOCK_LEN] = chunk.try_into().map_err(|_| ReflashError::BoundsError {
                address,
                len: data.len(),
            })?;
            self.download_block(address + (i * BLOCK_LEN) as u32, block)?;
            self.commit_block()?;
        }
        Ok(())
    }

    fn download_block(&mut self, address: u32, block: &[u8; BLOCK_LEN]) -> ReflashResult<()> {
        let attempts = self.options.write_attempts.max(1);
        let packets = transfer::download_packets(block);
        for attempt in 1..=attempts {
            debug!("Downloading block 0x{address:06X}, attempt {attempt}");
            let resp = transfer::request_download(&mut self.channel, address)?;
            expect_code("download request", &resp, &[ResponseCode::Affirmative])?;

            self.channel.send_batch(&packets)?;

            let resp = transfer::transfer_exit(&mut self.channel)?;
            match resp.response_code() {
                Some(ResponseCode::Affirmative) => return Ok(()),
                Some(ResponseCode::FailWithoutResults) => {
                    warn!("Block 0x{address:06X} failed without results (attempt {attempt} of {attempts})")
                }
                _ => {
                    error!("Block 0x{address:06X} download failed: {}", resp.describe());
                    return Err(ReflashError::protocol("download exit", resp.describe()));
                }
            }
        }
        Err(ReflashError::TransferRetryExhausted { address, attempts })
    }

    // Commits the last downloaded block to flash
    fn commit_block(&mut self) -> ReflashResult<()> {
        let resp = routine::start_routine(&mut self.channel, DiagRoutine::WriteFlash, &[])?;
        expect_code(
            "write flash start",
            &resp,
            &[ResponseCode::RoutineNotComplete, ResponseCode::Affirmative],
        )?;
        let resp = routine::stop_routine(&mut self.channel, DiagRoutine::WriteFlash)?;
        expect_code("write flash stop", &resp, &[ResponseCode::Affirmative])?;
        Ok(())
    }

    pub(super) fn run_erase(&mut self) -> ReflashResult<()> {
        info!("Erasing flash");
        let resp = routine::start_routine(&mut self.channel, DiagRoutine::EraseFlash, &[])?;
        expect_code("erase start", &resp, &[ResponseCode::RoutineNotComplete])?;
        Self::sleep_ms(self.options.erase_settle_ms);
        let resp = routine::stop_routine(&mut self.channel, DiagRoutine::EraseFlash)?;
        expect_code("erase stop", &resp, &[ResponseCode::Affirmative])?;
        Ok(())
    }

    pub(super) fn run_checksum(&mut self, image: &FirmwareImage) -> ReflashResult<bool> {
        // Only the low 16 bits of the image checksum are sent
        let checksum = image.checksum() as u16;
        info!("Verifying checksum 0x{checksum:04X} on controller");
        let resp = routine::start_routine(&mut self.channel, DiagRoutine::Checksum, &checksum.to_be_bytes())?;
        expect_code("checksum start", &resp, &[ResponseCode::RoutineNotComplete])?;
        Self::sleep_ms(self.options.checksum_settle_ms);
        let resp = routine::stop_routine(&mut self.channel, DiagRoutine::Checksum)?;
        if resp.is_affirmative() {
            Ok(true)
        } else {
            warn!("Controller rejected checksum 0x{checksum:04X}: {}", resp.describe());
            Ok(false)
        }
    }
}

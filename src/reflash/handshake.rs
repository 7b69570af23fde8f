//! Reflash entry handshake and memory layout probe

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::{PROGRAMMING_MILLIVOLTS, PROGRAMMING_PIN, ReflashSession, ReflashState};
use crate::{
    ReflashError, ReflashResult,
    channel::{ChannelError, LinkSpeed, PinVoltage, PwmChannel},
    image::{IdentityBlock, RomVariant, identity::IDENTITY_BLOCK_LEN},
    j2190::{
        ResponseCode, SaeMessage, SaeMode,
        memory::{self, READ_LOCATION_LEN},
        routine::{self, BAUD_RATE_83K, DiagRoutine},
        security_access,
    },
    security::{SecurityLevel, derive_key},
};

/// Block count parameter of the reflash entry routine
const ENTRY_BLOCK_COUNT: u16 = 0x00D8;

impl<C: PwmChannel> ReflashSession<C> {
    fn await_broadcast(&mut self) -> ReflashResult<()> {
        let start = Instant::now();
        let poll = self.options.broadcast_poll_ms;
        loop {
            if self.channel.wait_for_broadcast(poll)? {
                debug!("Presence broadcast seen after {}ms", start.elapsed().as_millis());
                return Ok(());
            }
            if let Some(timeout) = self.options.broadcast_timeout_ms {
                if start.elapsed() >= Duration::from_millis(timeout as u64) {
                    return Err(ReflashError::BroadcastTimeout(timeout));
                }
            }
        }
    }

    // Requests a seed and submits the derived key. `Ok(false)` if no seed was issued
    fn unlock(&mut self, level: SecurityLevel) -> ReflashResult<bool> {
        let (seed, resp) = security_access::request_seed(&mut self.channel)?;
        let Some(seed) = seed else {
            debug!("No {level:?} seed issued: {}", resp.describe());
            return Ok(false);
        };
        let key = derive_key(level, seed, self.salt);
        debug!("{level:?} seed {seed:02X?}, key {key:02X?}");
        let resp = security_access::send_key(&mut self.channel, key)?;
        if resp.response_code() == Some(ResponseCode::SecurityAccessAllowed) {
            Ok(true)
        } else {
            error!("{level:?} key rejected: {}", resp.describe());
            Err(match level {
                SecurityLevel::Level1 => ReflashError::Level1Denied,
                SecurityLevel::Level2 => ReflashError::Level2Denied,
            })
        }
    }

    pub(super) fn run_handshake(&mut self) -> ReflashResult<()> {
        // The controller is already unlocked and the heartbeat running
        if self.state == ReflashState::Ready {
            debug!("Handshake already complete");
            return Ok(());
        }
        self.set_state(ReflashState::ConfigInit);
        self.channel.configure_for_reflash()?;
        self.channel
            .set_programming_voltage(PROGRAMMING_PIN, PinVoltage::Millivolts(PROGRAMMING_MILLIVOLTS))?;

        self.set_state(ReflashState::AwaitBroadcast);
        info!("Waiting for controller presence broadcast");
        self.await_broadcast()?;

        self.channel.start_periodic(
            &SaeMessage::to_pcm(SaeMode::DiagHeartbeat, &[]),
            self.options.heartbeat_interval_ms,
        )?;
        self.set_state(ReflashState::HeartbeatStarted);

        self.set_state(ReflashState::EntryRequested);
        let [count_hi, count_lo] = ENTRY_BLOCK_COUNT.to_be_bytes();
        let resp = routine::start_routine(
            &mut self.channel,
            DiagRoutine::ReflashEntry,
            &[count_hi, count_lo, self.salt, 0x00],
        )?;
        if !resp.is_affirmative() {
            error!("Reflash entry rejected: {}", resp.describe());
            return Err(ReflashError::EntryRejected);
        }
        info!("Controller entered reflash mode (salt 0x{:02X})", self.salt);

        self.set_state(ReflashState::Level1Challenged);
        if !self.unlock(SecurityLevel::Level1)? {
            error!("Controller did not issue a level 1 seed");
            return Err(ReflashError::Level1Denied);
        }
        self.set_state(ReflashState::Level1Granted);
        info!("Security access level 1 granted");

        // Level 2 seeds are requested the same way as level 1
        self.set_state(ReflashState::Level2Challenged);
        if !self.unlock(SecurityLevel::Level2)? {
            info!("No level 2 access offered, staying at {}bps", LinkSpeed::Normal.baud());
            self.set_state(ReflashState::Ready);
            return Ok(());
        }
        self.set_state(ReflashState::Level2Granted);
        info!("Security access level 2 granted");

        if self.options.high_speed {
            self.set_state(ReflashState::HighSpeedRequested);
            let resp = routine::start_routine(&mut self.channel, DiagRoutine::BaudRate, &[BAUD_RATE_83K])?;
            if resp.is_affirmative() {
                self.channel.set_link_speed(LinkSpeed::High)?;
                info!("Link switched to {}bps", LinkSpeed::High.baud());
            } else {
                warn!("Baud rate change refused ({}), staying at {}bps", resp.describe(), LinkSpeed::Normal.baud());
            }
        }
        self.set_state(ReflashState::Ready);
        Ok(())
    }

    pub(super) fn run_probe(&mut self) -> ReflashResult<RomVariant> {
        for variant in RomVariant::probe_order() {
            let address = variant.probe_address();
            let resp = match memory::read_location(&mut self.channel, address) {
                Ok(resp) => resp,
                Err(ChannelError::ReadTimeout) => {
                    debug!("Probe 0x{address:06X}: no response");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if memory::location_data(&resp).is_some() {
                info!("Detected {variant} memory layout (0x{:02X})", variant.size_code());
                self.variant = Some(variant);
                return Ok(variant);
            }
            debug!("Probe 0x{address:06X}: {}", resp.describe());
        }
        Err(ReflashError::UnknownLayout)
    }

    pub(super) fn run_identity_read(&mut self) -> ReflashResult<IdentityBlock> {
        let variant = match self.variant {
            Some(v) => v,
            None => self.run_probe()?,
        };
        let base = variant.identity_address();
        let mut raw = [0u8; IDENTITY_BLOCK_LEN];
        for (i, chunk) in raw.chunks_exact_mut(READ_LOCATION_LEN).enumerate() {
            let address = base + (i * READ_LOCATION_LEN) as u32;
            let resp = memory::read_location(&mut self.channel, address)?;
            let data = memory::location_data(&resp).ok_or_else(|| {
                error!("Identity read at 0x{address:06X} failed: {}", resp.describe());
                ReflashError::protocol("identity read", resp.describe())
            })?;
            chunk.copy_from_slice(&data);
        }
        let block = IdentityBlock::from_raw(raw);
        if !block.is_checksum_valid() {
            warn!("Identity block on controller has an invalid checksum");
        }
        debug!("Target identity {block:?}");
        self.target_identity = Some(block.clone());
        Ok(block)
    }
}

//! J1850 PWM channel built on a [FrameRouter]
//!
//! Frames on the wire are `[0xC4, target, source, mode, data...]`. Replies to the tool are
//! correlated by source, mode and the echoed leading request bytes.

use log::debug;

use super::router::{FramePattern, FrameRouter, RawFrameIo, RouterOptions, ScreenId};
use crate::{
    channel::{ChannelResult, LinkSpeed, PinVoltage, PwmChannel, RxFilterId},
    j2190::{
        BROADCAST_ADDRESS, BROADCAST_MODE, PCM_ADDRESS, SaeMessage, SaeMode, SaeResponse, TOOL_ADDRESS,
    },
};

/// J1850 PWM header byte used for every transmitted frame
pub const PWM_HEADER: u8 = 0xC4;

// Offsets into a raw frame
const TARGET: usize = 1;
const MODE: usize = 3;

/// [PwmChannel] over a raw J1850 PWM frame device
#[derive(Debug)]
pub struct PwmRouterChannel<IO: RawFrameIo> {
    router: FrameRouter<IO>,
    broadcast_screen: Option<ScreenId>,
}

impl<IO: RawFrameIo> PwmRouterChannel<IO> {
    /// Creates a channel, starting a [FrameRouter] on `io`
    pub fn new(io: IO, options: RouterOptions) -> Self {
        Self {
            router: FrameRouter::new(io, options),
            broadcast_screen: None,
        }
    }

    /// Builds the raw frame of a request
    pub fn frame(msg: &SaeMessage) -> Vec<u8> {
        let mut f = vec![PWM_HEADER, msg.target, TOOL_ADDRESS, u8::from(msg.mode)];
        f.extend_from_slice(&msg.data);
        f
    }

    // Positive reply with echoed request bytes, or a general response to the request mode
    fn reply_pattern(msg: &SaeMessage, echo: &[u8]) -> FramePattern {
        let mut positive = vec![TOOL_ADDRESS, msg.target, msg.mode.positive_response()];
        positive.extend_from_slice(echo);
        let mut general = vec![TOOL_ADDRESS, msg.target, u8::from(SaeMode::GeneralResponse), u8::from(msg.mode)];
        general.extend_from_slice(echo);
        FramePattern::Any(vec![
            FramePattern::at(TARGET, &positive),
            FramePattern::at(TARGET, &general),
        ])
    }
}

impl<IO: RawFrameIo> PwmChannel for PwmRouterChannel<IO> {
    fn configure_for_reflash(&mut self) -> ChannelResult<()> {
        self.router.with_io(|dev| dev.set_data_rate(LinkSpeed::Normal.baud()))?;
        if let Some(old) = self.broadcast_screen.take() {
            self.router.remove_screen(old)?;
        }
        self.broadcast_screen = Some(
            self.router
                .add_screen(FramePattern::at(TARGET, &[BROADCAST_ADDRESS, PCM_ADDRESS, BROADCAST_MODE]))?,
        );
        Ok(())
    }

    fn set_programming_voltage(&mut self, pin: u8, level: PinVoltage) -> ChannelResult<()> {
        debug!("Pin {pin} -> {level:?}");
        self.router.with_io(|dev| dev.set_pin_voltage(pin, level))
    }

    fn wait_for_broadcast(&mut self, timeout_ms: u32) -> ChannelResult<bool> {
        let screen = match self.broadcast_screen {
            Some(s) => s,
            None => {
                let s = self
                    .router
                    .add_screen(FramePattern::at(TARGET, &[BROADCAST_ADDRESS, PCM_ADDRESS, BROADCAST_MODE]))?;
                self.broadcast_screen = Some(s);
                s
            }
        };
        if self.router.wait(screen, 1, timeout_ms)?.is_empty() {
            return Ok(false);
        }
        self.broadcast_screen = None;
        self.router.remove_screen(screen)?;
        Ok(true)
    }

    fn start_periodic(&mut self, msg: &SaeMessage, interval_ms: u32) -> ChannelResult<()> {
        self.router.add_periodic(&Self::frame(msg), interval_ms)
    }

    fn stop_periodic(&mut self) -> ChannelResult<()> {
        self.router.clear_periodic()
    }

    fn set_link_speed(&mut self, speed: LinkSpeed) -> ChannelResult<()> {
        self.router.with_io(|dev| dev.set_data_rate(speed.baud()))
    }

    fn transact_raw(&mut self, msg: &SaeMessage, rx_data_index: usize) -> ChannelResult<SaeResponse> {
        let depth = rx_data_index.min(msg.data.len());
        let echo = &msg.data[..depth];
        let frame = self
            .router
            .transaction(&Self::frame(msg), Self::reply_pattern(msg, echo))?;
        let mode = frame.data[MODE];
        let payload = &frame.data[MODE + 1..];
        if mode == msg.mode.positive_response() {
            Ok(SaeResponse::new(mode, &payload[depth..]))
        } else {
            Ok(SaeResponse::new(mode, payload))
        }
    }

    fn send_batch(&mut self, msgs: &[SaeMessage]) -> ChannelResult<()> {
        let frames: Vec<Vec<u8>> = msgs.iter().map(Self::frame).collect();
        self.router.transmit(&frames)
    }

    fn create_rx_filter(&mut self, source: u8, mode: u8) -> ChannelResult<RxFilterId> {
        self.router
            .add_screen(FramePattern::at(TARGET, &[TOOL_ADDRESS, source, mode]))
            .map(RxFilterId::from)
    }

    fn destroy_rx_filter(&mut self, filter: RxFilterId) -> ChannelResult<()> {
        self.router.remove_screen(filter.into())
    }

    fn receive(&mut self, filter: RxFilterId, count: usize, timeout_ms: u32) -> ChannelResult<Vec<Vec<u8>>> {
        Ok(self
            .router
            .wait(filter.into(), count, timeout_ms)?
            .into_iter()
            .map(|f| f.data[MODE + 1..].to_vec())
            .collect())
    }
}

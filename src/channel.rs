//! Module for the logical communication channel with a powertrain controller
//!
//! The reflash engine never touches the bus directly. Everything it needs from the
//! link layer is described by [PwmChannel]:
//! * Request/response transactions, correlated by the link ([PwmChannel::transact_raw])
//! * Batched transmission of transfer packets ([PwmChannel::send_batch])
//! * Scoped receive filters for bulk transfer packets ([PwmChannel::create_rx_filter])
//! * Session configuration (link speed, programming voltage, periodic heartbeat)

use crate::j2190::{SaeMessage, SaeResponse};

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    IOError(std::io::Error),
    /// Timeout when writing data to the channel
    WriteTimeout,
    /// Timeout when reading from the channel
    ReadTimeout,
    /// The channel's Rx buffer is empty. Only applies when read timeout is 0
    BufferEmpty,
    /// The channels Tx buffer is full
    BufferFull,
    /// Unsupported channel request
    UnsupportedRequest,
    /// The interface is not open
    InterfaceNotOpen,
    /// Receive filter handle is not registered on the channel
    UnknownFilter(RxFilterId),
    /// Underlying API error with hardware
    APIError {
        /// Name of the API EG: 'J2534', 'Simulation'
        api_name: String,
        /// Internal API error code
        code: u32,
        /// API error description
        desc: String,
    },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::UnsupportedRequest => write!(f, "unsupported channel request"),
            ChannelError::ReadTimeout => write!(f, "timeout reading from channel"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to channel"),
            ChannelError::BufferFull => write!(f, "channel's Transmit buffer is full"),
            ChannelError::BufferEmpty => write!(f, "channel's Receive buffer is empty"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::UnknownFilter(id) => write!(f, "receive filter {} is not registered", id.0),
            ChannelError::APIError {
                api_name,
                code,
                desc,
            } => write!(f, "underlying {api_name} API error ({code}): {desc}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::IOError(io_err) = self {
            Some(io_err)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::IOError(e)
    }
}

/// Handle to a receive filter created with [PwmChannel::create_rx_filter]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RxFilterId(pub u32);

/// J1850 PWM data rates
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkSpeed {
    /// 41.6kbps, the normal SCP bus speed
    Normal,
    /// 83.3kbps, only available once the controller has granted level 2 access
    High,
}

impl LinkSpeed {
    /// Bit rate in bits per second
    pub fn baud(&self) -> u32 {
        match self {
            LinkSpeed::Normal => 41_600,
            LinkSpeed::High => 83_300,
        }
    }
}

/// Programming voltage applied to an OBD connector pin
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PinVoltage {
    /// Pin is switched off
    Off,
    /// Voltage in millivolts
    Millivolts(u32),
}

/// Link-layer session contract used by the reflash engine.
///
/// All calls block the calling thread. The channel is owned exclusively by one
/// reflash session for its lifetime, so implementations are free to assume there is
/// no competing request/response traffic.
pub trait PwmChannel: Send {
    /// Configures the link for reflash: bus speed, message filters and tool address.
    /// Called once at the start of each handshake
    fn configure_for_reflash(&mut self) -> ChannelResult<()>;

    /// Sets the programming voltage of an OBD connector pin
    ///
    /// ## Parameters
    /// * pin - OBD connector pin number
    /// * level - Voltage to apply
    fn set_programming_voltage(&mut self, pin: u8, level: PinVoltage) -> ChannelResult<()>;

    /// Waits for the controller's presence broadcast.
    ///
    /// ## Returns
    /// `true` if the broadcast was observed within `timeout_ms`, `false` otherwise
    fn wait_for_broadcast(&mut self, timeout_ms: u32) -> ChannelResult<bool>;

    /// Starts transmitting `msg` every `interval_ms` in the background. The message keeps being
    /// sent until [PwmChannel::stop_periodic] or for as long as the channel lives
    fn start_periodic(&mut self, msg: &SaeMessage, interval_ms: u32) -> ChannelResult<()>;

    /// Stops every periodic transmission started with [PwmChannel::start_periodic]
    fn stop_periodic(&mut self) -> ChannelResult<()>;

    /// Changes the data rate of the link
    fn set_link_speed(&mut self, speed: LinkSpeed) -> ChannelResult<()>;

    /// Sends a request and waits for exactly one correlated response.
    ///
    /// ## Parameters
    /// * msg - The request
    /// * rx_data_index - Number of leading request data bytes the controller echoes in its reply.
    ///   These are used to correlate the reply and are stripped from positive responses
    ///
    /// ## Returns
    /// [ChannelError::ReadTimeout] if no correlated response arrived
    fn transact_raw(&mut self, msg: &SaeMessage, rx_data_index: usize) -> ChannelResult<SaeResponse>;

    /// Sends a request and waits for its response, without any echoed request bytes
    fn transact(&mut self, msg: &SaeMessage) -> ChannelResult<SaeResponse> {
        self.transact_raw(msg, 0)
    }

    /// Transmits a sequence of messages without waiting for any response
    fn send_batch(&mut self, msgs: &[SaeMessage]) -> ChannelResult<()>;

    /// Creates a receive filter matching messages sent by `source` with `mode`
    fn create_rx_filter(&mut self, source: u8, mode: u8) -> ChannelResult<RxFilterId>;

    /// Destroys a receive filter, discarding anything it buffered
    fn destroy_rx_filter(&mut self, filter: RxFilterId) -> ChannelResult<()>;

    /// Receives up to `count` message payloads (the bytes after the mode byte) matched by `filter`.
    /// Fewer than `count` are returned if `timeout_ms` expires first
    fn receive(&mut self, filter: RxFilterId, count: usize, timeout_ms: u32) -> ChannelResult<Vec<Vec<u8>>>;
}

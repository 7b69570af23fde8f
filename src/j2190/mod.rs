//! Module for the SAE J2190 diagnostic services used by Ford SCP controllers during reflash
//!
//! Only the small set of services needed to read and reprogram a controller is covered:
//! * Addressed memory reads (probe and identity block reads). See [memory]
//! * Security access seed/key exchange. See [security_access]
//! * Diagnostic routines (reflash entry, erase, write, checksum, baud rate). See [routine]
//! * Segmented block upload/download. See [transfer]

pub mod memory;
pub mod routine;
pub mod security_access;
pub mod transfer;

/// Physical address of the diagnostic tool
pub const TOOL_ADDRESS: u8 = 0xF1;
/// Physical address of the powertrain control module
pub const PCM_ADDRESS: u8 = 0x10;
/// Functional address the PCM uses for its presence broadcast
pub const BROADCAST_ADDRESS: u8 = 0x05;
/// Mode byte of the PCM presence broadcast
pub const BROADCAST_MODE: u8 = 0x04;

/// J2190 request modes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SaeMode {
    /// Read data by parameter ID
    DataByPid,
    /// Read 4 bytes of memory given a 24 bit address. See [memory]
    DataByAddress,
    /// Security access seed request and key submission. See [security_access]
    SecurityAccess,
    /// Starts a diagnostic routine. See [routine]
    StartRoutine,
    /// Stops a diagnostic routine. See [routine]
    StopRoutine,
    /// Requests a block download (tool to controller). See [transfer]
    RequestDownload,
    /// Requests a block upload (controller to tool). See [transfer]
    RequestUpload,
    /// A single block transfer packet
    DataTransfer,
    /// Ends a block transfer. See [transfer]
    TransferExit,
    /// Keeps the controller in its diagnostic state. Sent periodically by the channel
    DiagHeartbeat,
    /// General response. Only ever sent by the controller
    GeneralResponse,
    /// Mode not covered by this crate
    Custom(u8),
}

impl From<u8> for SaeMode {
    fn from(mode: u8) -> Self {
        match mode {
            0x22 => SaeMode::DataByPid,
            0x23 => SaeMode::DataByAddress,
            0x27 => SaeMode::SecurityAccess,
            0x31 => SaeMode::StartRoutine,
            0x32 => SaeMode::StopRoutine,
            0x34 => SaeMode::RequestDownload,
            0x35 => SaeMode::RequestUpload,
            0x36 => SaeMode::DataTransfer,
            0x37 => SaeMode::TransferExit,
            0x3F => SaeMode::DiagHeartbeat,
            0x7F => SaeMode::GeneralResponse,
            m => SaeMode::Custom(m),
        }
    }
}

impl From<SaeMode> for u8 {
    fn from(mode: SaeMode) -> Self {
        match mode {
            SaeMode::DataByPid => 0x22,
            SaeMode::DataByAddress => 0x23,
            SaeMode::SecurityAccess => 0x27,
            SaeMode::StartRoutine => 0x31,
            SaeMode::StopRoutine => 0x32,
            SaeMode::RequestDownload => 0x34,
            SaeMode::RequestUpload => 0x35,
            SaeMode::DataTransfer => 0x36,
            SaeMode::TransferExit => 0x37,
            SaeMode::DiagHeartbeat => 0x3F,
            SaeMode::GeneralResponse => 0x7F,
            SaeMode::Custom(m) => m,
        }
    }
}

impl SaeMode {
    /// Mode byte of a positive response to this request mode
    pub fn positive_response(self) -> u8 {
        u8::from(self).wrapping_add(0x40)
    }
}

/// J2190 response codes, carried as the last byte of a [SaeMode::GeneralResponse]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResponseCode {
    /// Request was accepted and carried out
    Affirmative,
    /// Controller rejected the request for unknown reason
    GeneralReject,
    /// Controller does not support the requested mode
    ModeNotSupported,
    /// Arguments not supported, or message format is incorrect
    SubFunctionNotSupported,
    /// Controller is too busy to perform the request
    BusyRepeatRequest,
    /// Prerequisite conditions are not met
    ConditionsNotCorrect,
    /// Routine was started but has not finished yet
    RoutineNotComplete,
    /// Request contains data which is out of range
    RequestOutOfRange,
    /// Security access is denied
    SecurityAccessDenied,
    /// Security access is granted
    SecurityAccessAllowed,
    /// Invalid key provided
    InvalidKey,
    /// Exceeded the number of incorrect security access attempts
    ExceedNumberOfAttempts,
    /// Time period for requesting a new seed not expired
    RequiredTimeDelayNotExpired,
    /// Controller fault prevents data download
    DownloadNotAccepted,
    /// Controller fault prevents data upload
    UploadNotAccepted,
    /// Block transfer failed without results. The only failure worth retrying a block download on
    FailWithoutResults,
    /// Controller fault has stopped the transfer of data
    TransferSuspended,
    /// Block checksum sent with the transfer did not match
    BlockChecksumError,
    /// Any other code
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(p: u8) -> Self {
        match p {
            0x00 => Self::Affirmative,
            0x10 => Self::GeneralReject,
            0x11 => Self::ModeNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x23 => Self::RoutineNotComplete,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x34 => Self::SecurityAccessAllowed,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x40 => Self::DownloadNotAccepted,
            0x50 => Self::UploadNotAccepted,
            0x64 => Self::FailWithoutResults,
            0x71 => Self::TransferSuspended,
            0x77 => Self::BlockChecksumError,
            x => Self::Other(x),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Affirmative => 0x00,
            ResponseCode::GeneralReject => 0x10,
            ResponseCode::ModeNotSupported => 0x11,
            ResponseCode::SubFunctionNotSupported => 0x12,
            ResponseCode::BusyRepeatRequest => 0x21,
            ResponseCode::ConditionsNotCorrect => 0x22,
            ResponseCode::RoutineNotComplete => 0x23,
            ResponseCode::RequestOutOfRange => 0x31,
            ResponseCode::SecurityAccessDenied => 0x33,
            ResponseCode::SecurityAccessAllowed => 0x34,
            ResponseCode::InvalidKey => 0x35,
            ResponseCode::ExceedNumberOfAttempts => 0x36,
            ResponseCode::RequiredTimeDelayNotExpired => 0x37,
            ResponseCode::DownloadNotAccepted => 0x40,
            ResponseCode::UploadNotAccepted => 0x50,
            ResponseCode::FailWithoutResults => 0x64,
            ResponseCode::TransferSuspended => 0x71,
            ResponseCode::BlockChecksumError => 0x77,
            ResponseCode::Other(x) => x,
        }
    }
}

/// A request addressed to a node on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeMessage {
    /// Physical address of the target node
    pub target: u8,
    /// Request mode
    pub mode: SaeMode,
    /// Request parameters
    pub data: Vec<u8>,
}

impl SaeMessage {
    /// Creates a new request
    pub fn new(target: u8, mode: SaeMode, data: &[u8]) -> Self {
        Self {
            target,
            mode,
            data: data.to_vec(),
        }
    }

    /// Creates a new request for the powertrain control module
    pub fn to_pcm(mode: SaeMode, data: &[u8]) -> Self {
        Self::new(PCM_ADDRESS, mode, data)
    }

    /// Appends a big endian 16 bit value
    pub fn push_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a big endian 24 bit value. The top byte of `value` is discarded
    pub fn push_u24(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes()[1..]);
        self
    }
}

/// A response received from the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeResponse {
    /// Raw response mode byte
    pub mode: u8,
    /// Response data. For positive responses the echoed request bytes are already stripped.
    /// For general responses this is the full `[request mode, echo..., response code]`
    pub data: Vec<u8>,
}

impl SaeResponse {
    /// Creates a response
    pub fn new(mode: u8, data: &[u8]) -> Self {
        Self {
            mode,
            data: data.to_vec(),
        }
    }

    /// Returns true if this is the positive response to `request`
    pub fn is_positive_for(&self, request: SaeMode) -> bool {
        self.mode == request.positive_response()
    }

    /// Returns the response code if this is a general response
    pub fn response_code(&self) -> Option<ResponseCode> {
        if self.mode != u8::from(SaeMode::GeneralResponse) {
            return None;
        }
        self.data.last().map(|c| ResponseCode::from(*c))
    }

    /// Returns true for a general response carrying [ResponseCode::Affirmative]
    pub fn is_affirmative(&self) -> bool {
        self.response_code() == Some(ResponseCode::Affirmative)
    }

    /// Short human readable description, used in error reports
    pub fn describe(&self) -> String {
        match self.response_code() {
            Some(code) => format!("general response {code:?} {:02X?}", self.data),
            None => format!("mode 0x{:02X} {:02X?}", self.mode, self.data),
        }
    }
}

/// Checks a response is a general response carrying one of the `expected` codes
pub(crate) fn expect_code(
    step: &'static str,
    resp: &SaeResponse,
    expected: &[ResponseCode],
) -> crate::ReflashResult<ResponseCode> {
    match resp.response_code() {
        Some(code) if expected.contains(&code) => Ok(code),
        _ => {
            log::error!("{step}: expected {expected:?}, got {}", resp.describe());
            Err(crate::ReflashError::protocol(step, resp.describe()))
        }
    }
}

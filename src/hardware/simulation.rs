//! Simulated powertrain controller for testing the reflash engine without a vehicle
//!
//! [SimulatedPcm] implements [PwmChannel] directly: requests are answered in memory as an SCP
//! controller running its reflash kernel would. Faults can be switched on with [SimFaults],
//! and what the tool did is recorded in [SimCounters].

use std::collections::HashMap;

use log::{debug, warn};

use crate::{
    ReflashResult,
    channel::{ChannelError, ChannelResult, LinkSpeed, PinVoltage, PwmChannel, RxFilterId},
    image::{Bank, FirmwareImage},
    j2190::{
        PCM_ADDRESS, ResponseCode, SaeMessage, SaeMode, SaeResponse,
        routine::{BAUD_RATE_83K, DiagRoutine},
        security_access::{REQUEST_SEED, SEND_KEY},
        transfer::{self, BLOCK_LEN},
    },
    security::{SecurityLevel, derive_key},
};

/// Faults the simulated controller can be told to produce
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Never send the presence broadcast
    pub silent: bool,
    /// Reject the reflash entry routine
    pub reject_entry: bool,
    /// Answer the level 2 seed request without a seed
    pub withhold_level2_seed: bool,
    /// Reject every level 1 key
    pub reject_level1_key: bool,
    /// Reject every level 2 key
    pub reject_level2_key: bool,
    /// Number of block download exits answered with "fail without results" before behaving normally
    pub recoverable_failures: u32,
    /// Answer every block download exit with "fail without results"
    pub always_recoverable: bool,
    /// Answer block download exits with this code instead
    pub download_exit_code: Option<ResponseCode>,
    /// Upload packets left out of every block
    pub drop_upload_packets: usize,
    /// Refuse the baud rate change routine
    pub refuse_baud_change: bool,
    /// Report checksum verification failure
    pub fail_checksum: bool,
}

/// What the tool asked the simulated controller to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCounters {
    /// Block download requests, retries included
    pub download_requests: u32,
    /// Block upload requests
    pub upload_requests: u32,
    /// Level 1 keys submitted
    pub level1_keys: u32,
    /// Level 2 keys submitted
    pub level2_keys: u32,
    /// Erase routine runs
    pub erases: u32,
    /// Addresses of committed blocks, in commit order
    pub commits: Vec<u32>,
    /// Checksums sent to the checksum routine
    pub checksums: Vec<u16>,
    /// Heartbeat mode and interval while one is running
    pub heartbeat: Option<(u8, u32)>,
    /// Periodic transmissions started
    pub periodic_starts: u32,
    /// Reflash entry routine requests
    pub entry_requests: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    None,
    Upload,
    Download(u32),
}

/// In-memory SCP powertrain controller
#[derive(Debug, Clone)]
pub struct SimulatedPcm {
    flash: FirmwareImage,
    faults: SimFaults,
    counters: SimCounters,
    seeds: [[u8; 3]; 2],
    voltage: PinVoltage,
    configured: bool,
    link_speed: LinkSpeed,
    salt: Option<u8>,
    unlocked: u8,
    pending_seed: Option<(SecurityLevel, [u8; 3])>,
    transfer: Transfer,
    staged: Vec<u8>,
    commit: Option<(u32, Vec<u8>)>,
    erasing: bool,
    checksum_ok: Option<bool>,
    filters: HashMap<RxFilterId, (u8, u8)>,
    next_filter: u32,
    rx_queue: HashMap<RxFilterId, Vec<Vec<u8>>>,
}

impl SimulatedPcm {
    /// Creates a controller whose flash holds `flash`
    pub fn new(flash: FirmwareImage) -> Self {
        Self {
            flash,
            faults: SimFaults::default(),
            counters: SimCounters::default(),
            seeds: [[0x12, 0x34, 0x0E], [0xAB, 0xCD, 0x5A]],
            voltage: PinVoltage::Off,
            configured: false,
            link_speed: LinkSpeed::Normal,
            salt: None,
            unlocked: 0,
            pending_seed: None,
            transfer: Transfer::None,
            staged: Vec::new(),
            commit: None,
            erasing: false,
            checksum_ok: None,
            filters: HashMap::new(),
            next_filter: 0,
            rx_queue: HashMap::new(),
        }
    }

    /// Creates a controller with faults enabled
    pub fn with_faults(flash: FirmwareImage, faults: SimFaults) -> Self {
        let mut pcm = Self::new(flash);
        pcm.faults = faults;
        pcm
    }

    /// Sets the seeds issued for level 1 and level 2
    pub fn set_seeds(&mut self, level1: [u8; 3], level2: [u8; 3]) {
        self.seeds = [level1, level2];
    }

    /// Current flash contents
    pub fn flash(&self) -> &FirmwareImage {
        &self.flash
    }

    /// Enabled faults
    pub fn faults_mut(&mut self) -> &mut SimFaults {
        &mut self.faults
    }

    /// Recorded tool activity
    pub fn counters(&self) -> &SimCounters {
        &self.counters
    }

    /// Current link speed
    pub fn link_speed(&self) -> LinkSpeed {
        self.link_speed
    }

    /// Current programming voltage
    pub fn voltage(&self) -> PinVoltage {
        self.voltage
    }

    /// Salt received with the last reflash entry
    pub fn salt(&self) -> Option<u8> {
        self.salt
    }

    fn general(msg: &SaeMessage, code: ResponseCode) -> SaeResponse {
        let mut data = vec![u8::from(msg.mode)];
        data.extend_from_slice(&msg.data);
        data.push(u8::from(code));
        SaeResponse::new(u8::from(SaeMode::GeneralResponse), &data)
    }

    fn positive(msg: &SaeMessage, data: &[u8]) -> SaeResponse {
        SaeResponse::new(msg.mode.positive_response(), data)
    }

    fn address(bytes: &[u8]) -> Option<u32> {
        match bytes {
            [a2, a1, a0] => Some(u32::from_be_bytes([0, *a2, *a1, *a0])),
            _ => None,
        }
    }

    fn read_by_address(&mut self, msg: &SaeMessage) -> SaeResponse {
        let data = Self::address(&msg.data).and_then(|a| self.flash.read_bytes(a, 4).ok());
        match data {
            Some(d) => Self::positive(msg, d),
            None => Self::general(msg, ResponseCode::RequestOutOfRange),
        }
    }

    fn security_access(&mut self, msg: &SaeMessage) -> SaeResponse {
        if self.salt.is_none() {
            return Self::general(msg, ResponseCode::ConditionsNotCorrect);
        }
        match msg.data.as_slice() {
            [REQUEST_SEED] => {
                let level = match self.unlocked {
                    0 => SecurityLevel::Level1,
                    1 if self.faults.withhold_level2_seed => return Self::positive(msg, &[]),
                    1 => SecurityLevel::Level2,
                    _ => return Self::general(msg, ResponseCode::ConditionsNotCorrect),
                };
                let seed = self.seeds[level as usize];
                self.pending_seed = Some((level, seed));
                Self::positive(msg, &seed)
            }
            [SEND_KEY, k0, k1] => {
                let (Some((level, seed)), Some(salt)) = (self.pending_seed.take(), self.salt) else {
                    return Self::general(msg, ResponseCode::ConditionsNotCorrect);
                };
                let rejected = match level {
                    SecurityLevel::Level1 => {
                        self.counters.level1_keys += 1;
                        self.faults.reject_level1_key
                    }
                    SecurityLevel::Level2 => {
                        self.counters.level2_keys += 1;
                        self.faults.reject_level2_key
                    }
                };
                if !rejected && derive_key(level, seed, salt) == [*k0, *k1] {
                    self.unlocked += 1;
                    Self::general(msg, ResponseCode::SecurityAccessAllowed)
                } else {
                    Self::general(msg, ResponseCode::InvalidKey)
                }
            }
            _ => Self::general(msg, ResponseCode::SubFunctionNotSupported),
        }
    }

    fn erase(&mut self) -> ReflashResult<()> {
        for bank in [Bank::Bank0, Bank::Bank1, Bank::Bank8, Bank::Bank9] {
            if let Some(len) = self.flash.variant().bank_len(bank) {
                self.flash.write_bytes(bank.base_address(), &vec![0xFF; len])?;
            }
        }
        self.counters.erases += 1;
        Ok(())
    }

    fn start_routine(&mut self, msg: &SaeMessage) -> SaeResponse {
        let Some((routine, params)) = msg.data.split_first() else {
            return Self::general(msg, ResponseCode::SubFunctionNotSupported);
        };
        let routine = DiagRoutine::from(*routine);
        if routine != DiagRoutine::ReflashEntry && self.unlocked == 0 {
            return Self::general(msg, ResponseCode::SecurityAccessDenied);
        }
        let code = match (routine, params) {
            (DiagRoutine::ReflashEntry, [0x00, 0xD8, salt, 0x00]) => {
                self.counters.entry_requests += 1;
                if self.faults.reject_entry || self.voltage == PinVoltage::Off {
                    ResponseCode::ConditionsNotCorrect
                } else {
                    self.salt = Some(*salt);
                    self.unlocked = 0;
                    self.pending_seed = None;
                    ResponseCode::Affirmative
                }
            }
            (DiagRoutine::BaudRate, [BAUD_RATE_83K]) => {
                if self.faults.refuse_baud_change || self.unlocked < 2 {
                    ResponseCode::ConditionsNotCorrect
                } else {
                    ResponseCode::Affirmative
                }
            }
            (DiagRoutine::EraseFlash, []) => {
                self.erasing = true;
                ResponseCode::RoutineNotComplete
            }
            (DiagRoutine::WriteFlash, []) if self.commit.is_some() => ResponseCode::RoutineNotComplete,
            (DiagRoutine::Checksum, [hi, lo]) => {
                let sent = u16::from_be_bytes([*hi, *lo]);
                self.counters.checksums.push(sent);
                self.checksum_ok = Some(!self.faults.fail_checksum && sent == self.flash.checksum() as u16);
                ResponseCode::RoutineNotComplete
            }
            _ => ResponseCode::ConditionsNotCorrect,
        };
        Self::general(msg, code)
    }

    fn stop_routine(&mut self, msg: &SaeMessage) -> SaeResponse {
        let code = match msg.data.first().map(|r| DiagRoutine::from(*r)) {
            Some(DiagRoutine::EraseFlash) if self.erasing => {
                self.erasing = false;
                match self.erase() {
                    Ok(()) => ResponseCode::Affirmative,
                    Err(e) => {
                        warn!("SIM erase failed: {e}");
                        ResponseCode::GeneralReject
                    }
                }
            }
            Some(DiagRoutine::WriteFlash) => match self.commit.take() {
                Some((address, block)) => match self.flash.write_bytes(address, &block) {
                    Ok(()) => {
                        self.counters.commits.push(address);
                        ResponseCode::Affirmative
                    }
                    Err(_) => ResponseCode::GeneralReject,
                },
                None => ResponseCode::ConditionsNotCorrect,
            },
            Some(DiagRoutine::Checksum) => match self.checksum_ok.take() {
                Some(true) => ResponseCode::Affirmative,
                Some(false) => ResponseCode::GeneralReject,
                None => ResponseCode::ConditionsNotCorrect,
            },
            _ => ResponseCode::ConditionsNotCorrect,
        };
        Self::general(msg, code)
    }

    fn transfer_request(&mut self, msg: &SaeMessage) -> SaeResponse {
        let address = match msg.data.as_slice() {
            [0x80, 0x04, 0x00, a @ ..] => Self::address(a),
            _ => None,
        };
        let Some(address) = address.filter(|_| self.unlocked > 0) else {
            return Self::general(msg, ResponseCode::ConditionsNotCorrect);
        };

        if msg.mode == SaeMode::RequestUpload {
            self.counters.upload_requests += 1;
            let Some(block) = self
                .flash
                .read_bytes(address, BLOCK_LEN)
                .ok()
                .and_then(|b| <&[u8; BLOCK_LEN]>::try_from(b).ok())
            else {
                return Self::general(msg, ResponseCode::UploadNotAccepted);
            };
            let mut packets: Vec<Vec<u8>> = transfer::download_packets(block)
                .into_iter()
                .map(|p| p.data)
                .collect();
            packets.truncate(packets.len().saturating_sub(self.faults.drop_upload_packets));
            self.queue_rx(u8::from(SaeMode::DataTransfer), packets);
            self.transfer = Transfer::Upload;
        } else {
            self.counters.download_requests += 1;
            if self.flash.read_bytes(address, BLOCK_LEN).is_err() {
                return Self::general(msg, ResponseCode::DownloadNotAccepted);
            }
            self.staged.clear();
            self.transfer = Transfer::Download(address);
        }
        Self::general(msg, ResponseCode::Affirmative)
    }

    fn transfer_exit(&mut self, msg: &SaeMessage) -> SaeResponse {
        let code = match std::mem::replace(&mut self.transfer, Transfer::None) {
            Transfer::None => ResponseCode::ConditionsNotCorrect,
            Transfer::Upload => ResponseCode::Affirmative,
            Transfer::Download(address) => {
                let staged = std::mem::take(&mut self.staged);
                if let Some(code) = self.faults.download_exit_code {
                    code
                } else if self.faults.always_recoverable {
                    ResponseCode::FailWithoutResults
                } else if self.faults.recoverable_failures > 0 {
                    self.faults.recoverable_failures -= 1;
                    ResponseCode::FailWithoutResults
                } else if staged.len() != BLOCK_LEN + 2 {
                    ResponseCode::TransferSuspended
                } else {
                    let (block, cs) = staged.split_at(BLOCK_LEN);
                    if transfer::block_checksum(block).to_be_bytes() == cs {
                        self.commit = Some((address, block.to_vec()));
                        ResponseCode::Affirmative
                    } else {
                        ResponseCode::BlockChecksumError
                    }
                }
            }
        };
        Self::general(msg, code)
    }

    fn queue_rx(&mut self, mode: u8, payloads: Vec<Vec<u8>>) {
        for (id, (source, filter_mode)) in &self.filters {
            if *source == PCM_ADDRESS && *filter_mode == mode {
                self.rx_queue.entry(*id).or_default().extend(payloads.iter().cloned());
            }
        }
    }
}

impl PwmChannel for SimulatedPcm {
    fn configure_for_reflash(&mut self) -> ChannelResult<()> {
        self.configured = true;
        self.link_speed = LinkSpeed::Normal;
        Ok(())
    }

    fn set_programming_voltage(&mut self, _pin: u8, level: PinVoltage) -> ChannelResult<()> {
        self.voltage = level;
        Ok(())
    }

    fn wait_for_broadcast(&mut self, timeout_ms: u32) -> ChannelResult<bool> {
        if self.faults.silent || !self.configured || self.voltage == PinVoltage::Off {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            return Ok(false);
        }
        Ok(true)
    }

    fn start_periodic(&mut self, msg: &SaeMessage, interval_ms: u32) -> ChannelResult<()> {
        self.counters.heartbeat = Some((u8::from(msg.mode), interval_ms));
        self.counters.periodic_starts += 1;
        Ok(())
    }

    fn stop_periodic(&mut self) -> ChannelResult<()> {
        self.counters.heartbeat = None;
        Ok(())
    }

    fn set_link_speed(&mut self, speed: LinkSpeed) -> ChannelResult<()> {
        self.link_speed = speed;
        Ok(())
    }

    fn transact_raw(&mut self, msg: &SaeMessage, _rx_data_index: usize) -> ChannelResult<SaeResponse> {
        if msg.target != PCM_ADDRESS {
            return Err(ChannelError::ReadTimeout);
        }
        let resp = match msg.mode {
            SaeMode::DataByAddress => self.read_by_address(msg),
            SaeMode::SecurityAccess => self.security_access(msg),
            SaeMode::StartRoutine => self.start_routine(msg),
            SaeMode::StopRoutine => self.stop_routine(msg),
            SaeMode::RequestUpload | SaeMode::RequestDownload => self.transfer_request(msg),
            SaeMode::TransferExit => self.transfer_exit(msg),
            _ => Self::general(msg, ResponseCode::ModeNotSupported),
        };
        debug!("SIM {msg:02X?} -> {resp:02X?}");
        Ok(resp)
    }

    fn send_batch(&mut self, msgs: &[SaeMessage]) -> ChannelResult<()> {
        for m in msgs {
            if m.target == PCM_ADDRESS
                && m.mode == SaeMode::DataTransfer
                && matches!(self.transfer, Transfer::Download(_))
            {
                self.staged.extend_from_slice(&m.data);
            }
        }
        Ok(())
    }

    fn create_rx_filter(&mut self, source: u8, mode: u8) -> ChannelResult<RxFilterId> {
        let id = RxFilterId(self.next_filter);
        self.next_filter += 1;
        self.filters.insert(id, (source, mode));
        Ok(id)
    }

    fn destroy_rx_filter(&mut self, filter: RxFilterId) -> ChannelResult<()> {
        self.rx_queue.remove(&filter);
        match self.filters.remove(&filter) {
            Some(_) => Ok(()),
            None => Err(ChannelError::UnknownFilter(filter)),
        }
    }

    fn receive(&mut self, filter: RxFilterId, count: usize, _timeout_ms: u32) -> ChannelResult<Vec<Vec<u8>>> {
        if !self.filters.contains_key(&filter) {
            return Err(ChannelError::UnknownFilter(filter));
        }
        let queue = self.rx_queue.entry(filter).or_default();
        let n = count.min(queue.len());
        Ok(queue.drain(..n).collect())
    }
}

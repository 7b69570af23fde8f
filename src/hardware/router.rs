//! Raw frame router
//!
//! A [FrameRouter] owns a raw J1850 frame device and runs one receiver thread which hands every
//! received frame to each registered screen whose [FramePattern] it matches. Callers block on
//! [FrameRouter::wait] until enough frames are buffered by their screen. The same thread
//! transmits the periodic frames registered with [FrameRouter::add_periodic].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bitflags::bitflags;
use log::{debug, warn};

use crate::channel::{ChannelError, ChannelResult, PinVoltage, RxFilterId};

bitflags! {
    /// Receive status flags a device reports alongside a frame
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RxStatus: u32 {
        /// Frame is the echo of one we transmitted
        const TX_ECHO = 0x0000_0001;
        /// First part of a frame still being received
        const START_OF_MESSAGE = 0x0000_0002;
        /// A break was detected on the bus
        const RX_BREAK = 0x0000_0004;
        /// Transmission complete indication
        const TX_INDICATION = 0x0000_0008;
    }
}

/// A raw bus frame as seen by the device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    /// Frame bytes, header included
    pub data: Vec<u8>,
    /// Receive status
    pub rx_status: RxStatus,
}

impl RawFrame {
    /// A received frame without any status flags
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            rx_status: RxStatus::empty(),
        }
    }
}

/// Raw frame device driven by a [FrameRouter].
///
/// The router serializes every call, so implementations don't need their own locking
pub trait RawFrameIo: Send + 'static {
    /// Transmits frames in order
    fn write_frames(&mut self, frames: &[Vec<u8>]) -> ChannelResult<()>;

    /// Reads the frames which arrived since the last call, waiting at most `timeout_ms` for the first.
    /// An empty list, [ChannelError::BufferEmpty] and [ChannelError::ReadTimeout] all mean nothing arrived
    fn read_frames(&mut self, timeout_ms: u32) -> ChannelResult<Vec<RawFrame>>;

    /// Changes the bus data rate
    fn set_data_rate(&mut self, baud: u32) -> ChannelResult<()>;

    /// Sets the voltage of an OBD connector pin
    fn set_pin_voltage(&mut self, pin: u8, level: PinVoltage) -> ChannelResult<()>;
}

/// Handle to a screen registered on a [FrameRouter]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScreenId(pub u32);

impl From<ScreenId> for RxFilterId {
    fn from(id: ScreenId) -> Self {
        RxFilterId(id.0)
    }
}

impl From<RxFilterId> for ScreenId {
    fn from(id: RxFilterId) -> Self {
        ScreenId(id.0)
    }
}

/// Frame matching rule of a screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePattern {
    /// Matches frames at least as long as `pattern` where, for every byte,
    /// `frame[i] & mask[i] == pattern[i] & mask[i]`
    Masked {
        /// Bits to compare
        mask: Vec<u8>,
        /// Expected bits
        pattern: Vec<u8>,
    },
    /// Matches if any of the patterns match
    Any(Vec<FramePattern>),
}

impl FramePattern {
    /// Masked pattern. `mask` and `pattern` must have the same length
    pub fn masked(mask: &[u8], pattern: &[u8]) -> Self {
        debug_assert_eq!(mask.len(), pattern.len());
        Self::Masked {
            mask: mask.to_vec(),
            pattern: pattern.to_vec(),
        }
    }

    /// Matches `bytes` exactly, starting at frame offset `offset`. Bytes before it are ignored
    pub fn at(offset: usize, bytes: &[u8]) -> Self {
        let mut mask = vec![0u8; offset];
        mask.resize(offset + bytes.len(), 0xFF);
        let mut pattern = vec![0u8; offset];
        pattern.extend_from_slice(bytes);
        Self::Masked { mask, pattern }
    }

    /// Returns true if `frame` matches. Frames with any status flag set never match
    pub fn matches(&self, frame: &RawFrame) -> bool {
        if !frame.rx_status.is_empty() {
            return false;
        }
        self.matches_bytes(&frame.data)
    }

    fn matches_bytes(&self, data: &[u8]) -> bool {
        match self {
            FramePattern::Masked { mask, pattern } => {
                data.len() >= pattern.len()
                    && mask
                        .iter()
                        .zip(pattern)
                        .zip(data)
                        .all(|((m, p), d)| d & m == p & m)
            }
            FramePattern::Any(patterns) => patterns.iter().any(|p| p.matches_bytes(data)),
        }
    }
}

#[derive(Debug, Copy, Clone)]
/// Frame router options
pub struct RouterOptions {
    /// Longest time the receiver thread waits on the device per read
    pub poll_timeout_ms: u32,
    /// Frames a screen buffers before it starts dropping the oldest
    pub screen_capacity: usize,
    /// Response timeout of [FrameRouter::transaction]
    pub transaction_timeout_ms: u32,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            screen_capacity: 512,
            transaction_timeout_ms: 1000,
        }
    }
}

#[derive(Debug)]
struct Screen {
    pattern: FramePattern,
    frames: VecDeque<RawFrame>,
}

#[derive(Debug)]
struct Periodic {
    frame: Vec<u8>,
    interval: Duration,
    last_sent: Instant,
}

#[derive(Debug, Default)]
struct RouterState {
    screens: HashMap<ScreenId, Screen>,
    periodic: Vec<Periodic>,
    next_id: u32,
}

type Shared = Arc<(Mutex<RouterState>, Condvar)>;

fn poisoned<T>(_: T) -> ChannelError {
    ChannelError::APIError {
        api_name: "FrameRouter".into(),
        code: 0,
        desc: "router lock poisoned".into(),
    }
}

/// Routes frames from a raw device to synchronous waiters
#[derive(Debug)]
pub struct FrameRouter<IO: RawFrameIo> {
    io: Arc<Mutex<IO>>,
    shared: Shared,
    running: Arc<AtomicBool>,
    options: RouterOptions,
    handle: Option<JoinHandle<()>>,
}

impl<IO: RawFrameIo> Drop for FrameRouter<IO> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<IO: RawFrameIo> FrameRouter<IO> {
    /// Takes ownership of a device and starts the receiver thread
    pub fn new(io: IO, options: RouterOptions) -> Self {
        let io = Arc::new(Mutex::new(io));
        let shared: Shared = Arc::new((Mutex::new(RouterState::default()), Condvar::new()));
        let running = Arc::new(AtomicBool::new(true));

        let io_t = io.clone();
        let shared_t = shared.clone();
        let running_t = running.clone();
        let handle = std::thread::spawn(move || {
            Self::receiver_loop(io_t, shared_t, running_t, options);
        });

        Self {
            io,
            shared,
            running,
            options,
            handle: Some(handle),
        }
    }

    fn receiver_loop(io: Arc<Mutex<IO>>, shared: Shared, running: Arc<AtomicBool>, options: RouterOptions) {
        let (state, signal) = &*shared;
        while running.load(Ordering::Relaxed) {
            let read = match io.lock() {
                Ok(mut dev) => dev.read_frames(options.poll_timeout_ms),
                Err(_) => break,
            };
            let frames = match read {
                Ok(f) => f,
                Err(ChannelError::BufferEmpty | ChannelError::ReadTimeout) => Vec::new(),
                Err(e) => {
                    warn!("Frame device read failed: {e}");
                    Vec::new()
                }
            };

            let due = {
                let Ok(mut st) = state.lock() else { break };
                if !frames.is_empty() {
                    let capacity = options.screen_capacity;
                    for frame in &frames {
                        debug!("In  <- {:02X?}", frame.data);
                        for (id, screen) in st.screens.iter_mut() {
                            if screen.pattern.matches(frame) {
                                if screen.frames.len() >= capacity {
                                    warn!("Screen {} full, dropping oldest frame", id.0);
                                    screen.frames.pop_front();
                                }
                                screen.frames.push_back(frame.clone());
                            }
                        }
                    }
                    signal.notify_all();
                }
                let now = Instant::now();
                let mut due = Vec::new();
                for p in st.periodic.iter_mut() {
                    if now.duration_since(p.last_sent) >= p.interval {
                        p.last_sent = now;
                        due.push(p.frame.clone());
                    }
                }
                due
            };

            if !due.is_empty() {
                let res = match io.lock() {
                    Ok(mut dev) => dev.write_frames(&due),
                    Err(_) => break,
                };
                if let Err(e) = res {
                    warn!("Periodic frame transmit failed: {e}");
                }
            }

            if frames.is_empty() && options.poll_timeout_ms == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        debug!("Frame router receiver thread exiting");
    }

    fn state(&self) -> ChannelResult<MutexGuard<'_, RouterState>> {
        self.shared.0.lock().map_err(poisoned)
    }

    /// Runs `f` with exclusive access to the device
    pub fn with_io<T>(&self, f: impl FnOnce(&mut IO) -> ChannelResult<T>) -> ChannelResult<T> {
        let mut dev = self.io.lock().map_err(poisoned)?;
        f(&mut dev)
    }

    /// Registers a screen. Only frames received from now on are buffered by it
    pub fn add_screen(&self, pattern: FramePattern) -> ChannelResult<ScreenId> {
        let mut st = self.state()?;
        let id = ScreenId(st.next_id);
        st.next_id = st.next_id.wrapping_add(1);
        st.screens.insert(
            id,
            Screen {
                pattern,
                frames: VecDeque::new(),
            },
        );
        Ok(id)
    }

    /// Removes a screen, discarding anything it buffered
    pub fn remove_screen(&self, id: ScreenId) -> ChannelResult<()> {
        match self.state()?.screens.remove(&id) {
            Some(_) => Ok(()),
            None => Err(ChannelError::UnknownFilter(id.into())),
        }
    }

    /// Waits until a screen has buffered `count` frames, or until `timeout_ms` passes.
    ///
    /// ## Returns
    /// Up to `count` frames, oldest first. Fewer are returned on timeout
    pub fn wait(&self, id: ScreenId, count: usize, timeout_ms: u32) -> ChannelResult<Vec<RawFrame>> {
        let (_, signal) = &*self.shared;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut st = self.state()?;
        loop {
            let buffered = match st.screens.get(&id) {
                Some(s) => s.frames.len(),
                None => return Err(ChannelError::UnknownFilter(id.into())),
            };
            let now = Instant::now();
            if buffered >= count || now >= deadline {
                break;
            }
            st = signal.wait_timeout(st, deadline - now).map_err(poisoned)?.0;
        }
        let screen = st
            .screens
            .get_mut(&id)
            .ok_or(ChannelError::UnknownFilter(id.into()))?;
        let n = count.min(screen.frames.len());
        Ok(screen.frames.drain(..n).collect())
    }

    /// Transmits frames in order
    pub fn transmit(&self, frames: &[Vec<u8>]) -> ChannelResult<()> {
        for f in frames {
            debug!("Out -> {f:02X?}");
        }
        self.with_io(|dev| dev.write_frames(frames))
    }

    /// Transmits `frame` and waits for the first frame matching `response`.
    ///
    /// The screen is registered before transmitting, so a fast reply can't be missed
    pub fn transaction(&self, frame: &[u8], response: FramePattern) -> ChannelResult<RawFrame> {
        let id = self.add_screen(response)?;
        let res = self
            .transmit(&[frame.to_vec()])
            .and_then(|_| self.wait(id, 1, self.options.transaction_timeout_ms));
        self.remove_screen(id)?;
        res?.into_iter().next().ok_or(ChannelError::ReadTimeout)
    }

    /// Transmits `frame` every `interval_ms` from the receiver thread, for as long as the router lives
    pub fn add_periodic(&self, frame: &[u8], interval_ms: u32) -> ChannelResult<()> {
        let interval = Duration::from_millis(interval_ms as u64);
        let mut st = self.state()?;
        st.periodic.push(Periodic {
            frame: frame.to_vec(),
            interval,
            // First transmission on the next receiver pass
            last_sent: Instant::now().checked_sub(interval).unwrap_or_else(Instant::now),
        });
        Ok(())
    }

    /// Stops every periodic transmission
    pub fn clear_periodic(&self) -> ChannelResult<()> {
        self.state()?.periodic.clear();
        Ok(())
    }
}

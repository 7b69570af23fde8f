use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use scp_reflash::{
    channel::{ChannelError, ChannelResult, LinkSpeed, PinVoltage, PwmChannel},
    hardware::{
        pwm::PwmRouterChannel,
        router::{RawFrame, RawFrameIo, RouterOptions, RxStatus},
    },
    j2190::{ResponseCode, SaeMessage, SaeMode, memory, routine, transfer},
};

#[derive(Debug, Default)]
struct BusLog {
    sent: Vec<Vec<u8>>,
    baud: u32,
    pins: Vec<(u8, PinVoltage)>,
}

/// Emulated raw J1850 device. Every transmitted frame is passed to the callback, whose
/// returned frames are then received
struct EmuPwmDevice<F: FnMut(&[u8]) -> Vec<RawFrame> + Send + 'static> {
    on_frame: F,
    rx: Arc<Mutex<VecDeque<RawFrame>>>,
    log: Arc<Mutex<BusLog>>,
}

impl<F: FnMut(&[u8]) -> Vec<RawFrame> + Send + 'static> RawFrameIo for EmuPwmDevice<F> {
    fn write_frames(&mut self, frames: &[Vec<u8>]) -> ChannelResult<()> {
        for f in frames {
            log::debug!("Bus <- {f:02X?}");
            self.log.lock().unwrap().sent.push(f.clone());
            let replies = (self.on_frame)(f);
            self.rx.lock().unwrap().extend(replies);
        }
        Ok(())
    }

    fn read_frames(&mut self, timeout_ms: u32) -> ChannelResult<Vec<RawFrame>> {
        let frames: Vec<RawFrame> = self.rx.lock().unwrap().drain(..).collect();
        if frames.is_empty() {
            std::thread::sleep(Duration::from_millis(timeout_ms.min(2) as u64));
            return Err(ChannelError::BufferEmpty);
        }
        Ok(frames)
    }

    fn set_data_rate(&mut self, baud: u32) -> ChannelResult<()> {
        self.log.lock().unwrap().baud = baud;
        Ok(())
    }

    fn set_pin_voltage(&mut self, pin: u8, level: PinVoltage) -> ChannelResult<()> {
        self.log.lock().unwrap().pins.push((pin, level));
        Ok(())
    }
}

type Rx = Arc<Mutex<VecDeque<RawFrame>>>;
type Log = Arc<Mutex<BusLog>>;

fn setup<F: FnMut(&[u8]) -> Vec<RawFrame> + Send + 'static>(
    on_frame: F,
) -> (PwmRouterChannel<EmuPwmDevice<F>>, Rx, Log) {
    let _ = env_logger::builder().is_test(true).try_init();
    let rx: Rx = Arc::default();
    let log: Log = Arc::default();
    let dev = EmuPwmDevice {
        on_frame,
        rx: rx.clone(),
        log: log.clone(),
    };
    let options = RouterOptions {
        poll_timeout_ms: 2,
        transaction_timeout_ms: 200,
        ..Default::default()
    };
    (PwmRouterChannel::new(dev, options), rx, log)
}

fn from_pcm(bytes: &[u8]) -> RawFrame {
    let mut f = vec![0xC4, 0xF1, 0x10];
    f.extend_from_slice(bytes);
    RawFrame::new(&f)
}

#[test]
fn frames_carry_pwm_header() {
    let (mut ch, _, log) = setup(|_| vec![]);
    ch.send_batch(&[SaeMessage::to_pcm(SaeMode::DataTransfer, &[1, 2, 3, 4, 5, 6])])
        .unwrap();
    assert_eq!(
        log.lock().unwrap().sent,
        vec![vec![0xC4, 0x10, 0xF1, 0x36, 1, 2, 3, 4, 5, 6]]
    );
}

#[test]
fn positive_reply_is_correlated_by_echo() {
    let (mut ch, _, _) = setup(|f| match f {
        [0xC4, 0x10, 0xF1, 0x23, a2, a1, _] => vec![
            // Heartbeat reply and a reply for another address, neither is ours
            from_pcm(&[0x7F, 0x3F, 0x00]),
            from_pcm(&[0x63, 0x55, 0x55, 0xEE, 0xEE, 0xEE, 0xEE]),
            from_pcm(&[0x63, *a2, *a1, 0xDE, 0xAD, 0xBE, 0xEF]),
        ],
        _ => vec![],
    });
    let resp = memory::read_location(&mut ch, 0x09_FF00).unwrap();
    assert_eq!(memory::location_data(&resp), Some([0xDE, 0xAD, 0xBE, 0xEF]));
}

#[test]
fn general_reply_is_correlated_by_mode() {
    let (mut ch, _, _) = setup(|f| match f {
        [0xC4, 0x10, 0xF1, 0x31, 0xA1] => vec![from_pcm(&[0x7F, 0x31, 0xA1, 0x23])],
        [0xC4, 0x10, 0xF1, 0x32, 0xA1] => vec![from_pcm(&[0x7F, 0x32, 0xA1, 0x00])],
        _ => vec![],
    });
    let resp = routine::start_routine(&mut ch, routine::DiagRoutine::EraseFlash, &[]).unwrap();
    assert_eq!(resp.response_code(), Some(ResponseCode::RoutineNotComplete));
    let resp = routine::stop_routine(&mut ch, routine::DiagRoutine::EraseFlash).unwrap();
    assert!(resp.is_affirmative());
}

#[test]
fn unanswered_request_times_out() {
    let (mut ch, _, _) = setup(|_| vec![]);
    let err = memory::read_location(&mut ch, 0x01_FFFC).unwrap_err();
    assert!(matches!(err, ChannelError::ReadTimeout), "{err:?}");
}

#[test]
fn upload_packets_reach_filter() {
    let (mut ch, _, _) = setup(|f| match f {
        [0xC4, 0x10, 0xF1, 0x35, ..] => {
            let block: [u8; transfer::BLOCK_LEN] = std::array::from_fn(|i| i as u8);
            let mut replies = vec![from_pcm(&[0x7F, 0x35, 0x80, 0x04, 0x00])];
            for p in transfer::download_packets(&block) {
                let mut f = vec![0x36];
                f.extend_from_slice(&p.data);
                replies.push(from_pcm(&f));
            }
            replies
        }
        _ => vec![],
    });
    let filter = ch.create_rx_filter(0x10, 0x36).unwrap();
    let resp = transfer::request_upload(&mut ch, 0x08_2000).unwrap();
    assert!(resp.is_affirmative());
    let packets = ch.receive(filter, transfer::PACKETS_PER_BLOCK, 500).unwrap();
    assert_eq!(packets.len(), transfer::PACKETS_PER_BLOCK);
    assert_eq!(packets[1], vec![6, 7, 8, 9, 10, 11]);
    ch.destroy_rx_filter(filter).unwrap();
    assert!(matches!(
        ch.destroy_rx_filter(filter),
        Err(ChannelError::UnknownFilter(_))
    ));
}

#[test]
fn broadcast_detection() {
    let (mut ch, rx, log) = setup(|_| vec![]);
    ch.configure_for_reflash().unwrap();
    assert_eq!(log.lock().unwrap().baud, 41_600);
    assert!(!ch.wait_for_broadcast(20).unwrap());

    // Our own echo doesn't count
    let mut echo = RawFrame::new(&[0xC4, 0x05, 0x10, 0x04, 0x00]);
    echo.rx_status = RxStatus::TX_ECHO;
    rx.lock().unwrap().push_back(echo);
    assert!(!ch.wait_for_broadcast(20).unwrap());

    rx.lock().unwrap().push_back(RawFrame::new(&[0xC4, 0x05, 0x10, 0x04, 0x00]));
    assert!(ch.wait_for_broadcast(200).unwrap());
}

#[test]
fn heartbeat_is_periodic() {
    let (mut ch, _, log) = setup(|_| vec![]);
    ch.start_periodic(&SaeMessage::to_pcm(SaeMode::DiagHeartbeat, &[]), 10)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let sent = log
        .lock()
        .unwrap()
        .sent
        .iter()
        .filter(|f| f.as_slice() == [0xC4, 0x10, 0xF1, 0x3F])
        .count();
    assert!(sent >= 2, "{sent} heartbeats");
}

#[test]
fn heartbeat_can_be_stopped() {
    let (mut ch, _, log) = setup(|_| vec![]);
    let heartbeats = |log: &Log| {
        log.lock()
            .unwrap()
            .sent
            .iter()
            .filter(|f| f.as_slice() == [0xC4, 0x10, 0xF1, 0x3F])
            .count()
    };
    ch.start_periodic(&SaeMessage::to_pcm(SaeMode::DiagHeartbeat, &[]), 10)
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    ch.stop_periodic().unwrap();
    // A frame already due when stopping may still go out
    std::thread::sleep(Duration::from_millis(30));
    let stopped = heartbeats(&log);
    assert!(stopped >= 1);
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(heartbeats(&log), stopped);
}

#[test]
fn session_configuration() {
    let (mut ch, _, log) = setup(|_| vec![]);
    ch.set_programming_voltage(13, PinVoltage::Millivolts(18_000)).unwrap();
    ch.set_link_speed(LinkSpeed::High).unwrap();
    ch.set_programming_voltage(13, PinVoltage::Off).unwrap();
    let log = log.lock().unwrap();
    assert_eq!(log.baud, 83_300);
    assert_eq!(
        log.pins,
        vec![(13, PinVoltage::Millivolts(18_000)), (13, PinVoltage::Off)]
    );
}

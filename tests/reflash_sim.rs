use scp_reflash::{
    ReflashError, ReflashErrorKind, RomVariant,
    channel::{LinkSpeed, PinVoltage},
    hardware::simulation::{SimFaults, SimulatedPcm},
    image::FirmwareImage,
    j2190::ResponseCode,
    reflash::{ReflashOptions, ReflashSession, ReflashState},
    security::FixedSalt,
};
use strum::IntoEnumIterator;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_options() -> ReflashOptions {
    ReflashOptions {
        broadcast_timeout_ms: Some(20),
        broadcast_poll_ms: 1,
        erase_settle_ms: 0,
        checksum_settle_ms: 0,
        transfer_rx_window_ms: 0,
        ..Default::default()
    }
}

fn image(variant: RomVariant, seed: u32, vin: &[u8]) -> FirmwareImage {
    let mut x = seed | 1;
    let data: Vec<u8> = (0..variant.image_len())
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect();
    let mut img = FirmwareImage::from_bin(&data).unwrap();
    let mut id = img.identity_block().clone();
    id.set_vin(vin);
    id.set_pats_key(&[seed as u8; 16]);
    img.set_identity_block(id).unwrap();
    img
}

fn session(pcm: SimulatedPcm) -> ReflashSession<SimulatedPcm> {
    ReflashSession::new(pcm, fast_options(), &mut FixedSalt(0x42))
}

#[test]
fn read_firmware_every_variant() {
    init_logging();
    for variant in RomVariant::iter() {
        let flashed = image(variant, 7, b"1FAFP40461F100001");
        let mut s = session(SimulatedPcm::new(flashed.clone()));
        let read = s.read_firmware().unwrap();
        assert_eq!(read.variant(), variant);
        assert_eq!(read.to_bin(), flashed.to_bin());
        assert_eq!(read.identity_block(), flashed.identity_block());
        assert_eq!(s.state(), ReflashState::Ready);
        assert_eq!(s.variant(), Some(variant));

        let pcm = s.into_channel();
        assert_eq!(pcm.salt(), Some(0x42));
        assert_eq!(pcm.link_speed(), LinkSpeed::High);
        assert_eq!(pcm.counters().heartbeat, Some((0x3F, 3000)));
        assert_eq!(pcm.counters().level1_keys, 1);
        assert_eq!(pcm.counters().level2_keys, 1);
        assert_eq!(pcm.counters().upload_requests as usize, variant.image_len() / 0x400);
        assert_eq!(pcm.counters().checksums, vec![flashed.checksum() as u16]);
        assert_eq!(pcm.voltage(), PinVoltage::Millivolts(18_000));
    }
}

#[test]
fn write_firmware_keeps_target_identity() {
    init_logging();
    let target = image(RomVariant::Medium, 3, b"1FTRX18W1XKB00002");
    let mut new = image(RomVariant::Medium, 11, b"2FAFP71W03X100003");
    let mut s = session(SimulatedPcm::new(target.clone()));
    s.write_firmware(&mut new, true).unwrap();

    // The image handed in now carries the target's identity
    assert_eq!(new.identity_block().vin_bytes(), target.identity_block().vin_bytes());
    assert_eq!(new.identity_block().pats_key(), target.identity_block().pats_key());
    assert!(new.identity_block().is_checksum_valid());
    assert_eq!(s.target_identity(), Some(target.identity_block()));

    let pcm = s.into_channel();
    assert_eq!(pcm.flash().to_bin(), new.to_bin());
    assert_eq!(pcm.counters().erases, 1);
    assert_eq!(pcm.counters().commits.len(), RomVariant::Medium.image_len() / 0x400);
    assert_eq!(pcm.counters().checksums, vec![new.checksum() as u16]);
}

#[test]
fn write_firmware_without_transplant() {
    init_logging();
    let target = image(RomVariant::Large, 3, b"1FTRX18W1XKB00002");
    let mut new = image(RomVariant::Large, 11, b"2FAFP71W03X100003");
    let original = new.clone();
    let mut s = session(SimulatedPcm::new(target));
    s.write_firmware(&mut new, false).unwrap();
    assert_eq!(new, original);
    assert_eq!(s.into_channel().flash(), &original);
}

#[test]
fn blocks_are_programmed_highest_first() {
    init_logging();
    let mut new = image(RomVariant::Small, 5, b"VIN");
    let mut s = session(SimulatedPcm::new(image(RomVariant::Small, 9, b"VIN")));
    s.write_firmware(&mut new, false).unwrap();

    let commits = &s.channel_mut().counters().commits;
    // Bank 1 (0x8000 bytes) first, then bank 8 (0xE000 bytes)
    assert_eq!(commits.len(), 32 + 56);
    assert_eq!(commits[0], 0x1_9C00);
    assert_eq!(commits[31], 0x1_2000);
    assert_eq!(commits[32], 0x8_FC00);
    assert_eq!(commits[87], 0x8_2000);
    assert!(commits[..32].windows(2).all(|w| w[0] == w[1] + 0x400));
}

#[test]
fn large_banks_are_programmed_in_layout_order() {
    init_logging();
    let mut new = image(RomVariant::Large, 5, b"VIN");
    let mut s = session(SimulatedPcm::new(image(RomVariant::Large, 9, b"VIN")));
    s.write_firmware(&mut new, false).unwrap();

    let commits = s.channel_mut().counters().commits.clone();
    assert_eq!(commits.len(), 56 + 48 + 56 + 56);
    // Bank 0, bank 1, bank 9, then bank 8, each from its highest block down
    let banks = [
        (0x0_2000, 0x0_FC00, 56),
        (0x1_2000, 0x1_DC00, 48),
        (0x9_2000, 0x9_FC00, 56),
        (0x8_2000, 0x8_FC00, 56),
    ];
    let mut rest = commits.as_slice();
    for (lowest, highest, blocks) in banks {
        let (bank, tail) = rest.split_at(blocks);
        assert_eq!(bank[0], highest);
        assert_eq!(bank[blocks - 1], lowest);
        assert!(bank.windows(2).all(|w| w[0] == w[1] + 0x400));
        rest = tail;
    }
    assert!(rest.is_empty());
}

#[test]
fn handshake_is_not_repeated_once_ready() {
    init_logging();
    let flashed = image(RomVariant::Medium, 6, b"VIN");
    let mut s = session(SimulatedPcm::new(flashed.clone()));
    s.handshake().unwrap();
    s.handshake().unwrap();
    assert_eq!(s.read_firmware().unwrap(), flashed);
    let mut new = image(RomVariant::Medium, 12, b"VIN");
    s.write_firmware(&mut new, true).unwrap();
    assert_eq!(s.state(), ReflashState::Ready);

    let pcm = s.into_channel();
    assert_eq!(pcm.counters().periodic_starts, 1);
    assert_eq!(pcm.counters().entry_requests, 1);
    assert_eq!(pcm.counters().level1_keys, 1);
    assert_eq!(pcm.counters().level2_keys, 1);
    assert_eq!(pcm.link_speed(), LinkSpeed::High);
    assert_eq!(pcm.flash(), &new);
}

#[test]
fn transfers_outside_address_space_are_rejected() {
    init_logging();
    let mut s = session(SimulatedPcm::new(image(RomVariant::Small, 1, b"VIN")));
    s.handshake().unwrap();
    assert!(matches!(
        s.read_range(0xFF_FC00, 0x800),
        Err(ReflashError::BoundsError {
            address: 0xFF_FC00,
            len: 0x800
        })
    ));
    assert!(matches!(
        s.read_range(u32::MAX - 0x3FF, 0x400),
        Err(ReflashError::BoundsError { .. })
    ));
    assert!(matches!(
        s.program_bank(u32::MAX - 0x3FF, &[0; 0x400]),
        Err(ReflashError::BoundsError { .. })
    ));
    assert!(matches!(
        s.program_bank(0x100_0000, &[0; 0x400]),
        Err(ReflashError::BoundsError { .. })
    ));
    // Rejected before anything is sent, the session is still usable
    assert_eq!(s.state(), ReflashState::Ready);
    assert_eq!(s.channel_mut().counters().upload_requests, 0);
    assert_eq!(s.channel_mut().counters().download_requests, 0);
    assert_eq!(s.read_range(0x8_2000, 0x400).unwrap().len(), 0x400);
}

#[test]
fn recoverable_failure_is_retried() {
    init_logging();
    let faults = SimFaults {
        recoverable_failures: 2,
        ..Default::default()
    };
    let pcm = SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults);
    let mut s = session(pcm);
    let mut new = image(RomVariant::Small, 2, b"VIN");
    s.write_firmware(&mut new, false).unwrap();

    let pcm = s.into_channel();
    let blocks = RomVariant::Small.image_len() as u32 / 0x400;
    // First block needed 3 attempts, every other block 1
    assert_eq!(pcm.counters().download_requests, blocks + 2);
    assert_eq!(pcm.counters().commits.len() as u32, blocks);
    assert_eq!(pcm.flash(), &new);
}

#[test]
fn retries_are_bounded() {
    init_logging();
    let faults = SimFaults {
        always_recoverable: true,
        ..Default::default()
    };
    let pcm = SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults);
    let mut s = session(pcm);
    let mut new = image(RomVariant::Small, 2, b"VIN");
    let err = s.write_firmware(&mut new, false).unwrap_err();
    assert!(
        matches!(
            err,
            ReflashError::TransferRetryExhausted {
                address: 0x1_9C00,
                attempts: 3
            }
        ),
        "{err:?}"
    );
    assert_eq!(
        s.state(),
        ReflashState::Failed(ReflashErrorKind::TransferRetryExhausted)
    );
    let pcm = s.into_channel();
    assert_eq!(pcm.counters().download_requests, 3);
    assert!(pcm.counters().commits.is_empty());
}

#[test]
fn other_exit_codes_are_fatal() {
    init_logging();
    let faults = SimFaults {
        download_exit_code: Some(ResponseCode::BlockChecksumError),
        ..Default::default()
    };
    let pcm = SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults);
    let mut s = session(pcm);
    let mut new = image(RomVariant::Small, 2, b"VIN");
    let err = s.write_firmware(&mut new, false).unwrap_err();
    assert!(matches!(err, ReflashError::ProtocolError { .. }), "{err:?}");
    assert_eq!(s.into_channel().counters().download_requests, 1);
}

#[test]
fn missing_level2_seed_stays_at_normal_speed() {
    init_logging();
    let faults = SimFaults {
        withhold_level2_seed: true,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Medium, 1, b"VIN"), faults));
    s.handshake().unwrap();
    assert_eq!(s.state(), ReflashState::Ready);

    let pcm = s.into_channel();
    assert_eq!(pcm.counters().level1_keys, 1);
    assert_eq!(pcm.counters().level2_keys, 0);
    assert_eq!(pcm.link_speed(), LinkSpeed::Normal);
}

#[test]
fn refused_baud_change_is_not_fatal() {
    init_logging();
    let faults = SimFaults {
        refuse_baud_change: true,
        ..Default::default()
    };
    let flashed = image(RomVariant::Small, 4, b"VIN");
    let mut s = session(SimulatedPcm::with_faults(flashed.clone(), faults));
    assert_eq!(s.read_firmware().unwrap(), flashed);
    assert_eq!(s.into_channel().link_speed(), LinkSpeed::Normal);
}

#[test]
fn high_speed_can_be_disabled() {
    init_logging();
    let options = ReflashOptions {
        high_speed: false,
        ..fast_options()
    };
    let mut s = ReflashSession::with_salt(SimulatedPcm::new(image(RomVariant::Small, 4, b"VIN")), options, 0x11);
    s.handshake().unwrap();
    let pcm = s.into_channel();
    assert_eq!(pcm.counters().level2_keys, 1);
    assert_eq!(pcm.link_speed(), LinkSpeed::Normal);
    assert_eq!(pcm.salt(), Some(0x11));
}

#[test]
fn layout_mismatch_is_rejected_before_erase() {
    init_logging();
    let mut s = session(SimulatedPcm::new(image(RomVariant::Small, 1, b"VIN")));
    let mut new = image(RomVariant::Medium, 2, b"VIN");
    let err = s.write_firmware(&mut new, true).unwrap_err();
    assert!(
        matches!(
            err,
            ReflashError::LayoutMismatch {
                image: RomVariant::Medium,
                target: RomVariant::Small
            }
        ),
        "{err:?}"
    );
    assert_eq!(s.into_channel().counters().erases, 0);
}

#[test]
fn silent_controller_times_out() {
    init_logging();
    let faults = SimFaults {
        silent: true,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults));
    let err = s.handshake().unwrap_err();
    assert!(matches!(err, ReflashError::BroadcastTimeout(20)), "{err:?}");
    assert_eq!(s.state(), ReflashState::Failed(ReflashErrorKind::BroadcastTimeout));
    assert_eq!(s.channel_mut().counters().heartbeat, None);
}

#[test]
fn failed_session_cannot_be_reused() {
    init_logging();
    let faults = SimFaults {
        reject_entry: true,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults));
    assert!(matches!(s.handshake(), Err(ReflashError::EntryRejected)));
    assert_eq!(s.channel_mut().counters().level1_keys, 0);

    // Clearing the fault doesn't help, the session is done
    s.channel_mut().faults_mut().reject_entry = false;
    assert!(matches!(
        s.probe_layout(),
        Err(ReflashError::SessionFailed(ReflashErrorKind::EntryRejected))
    ));
    assert!(matches!(
        s.read_firmware(),
        Err(ReflashError::SessionFailed(ReflashErrorKind::EntryRejected))
    ));

    // The heartbeat and programming voltage can still be switched off
    assert_eq!(s.channel_mut().counters().heartbeat, Some((0x3F, 3000)));
    s.finish().unwrap();
    let pcm = s.into_channel();
    assert_eq!(pcm.voltage(), PinVoltage::Off);
    assert_eq!(pcm.counters().heartbeat, None);
}

#[test]
fn rejected_keys() {
    init_logging();
    let faults = SimFaults {
        reject_level1_key: true,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults));
    assert!(matches!(s.handshake(), Err(ReflashError::Level1Denied)));

    let faults = SimFaults {
        reject_level2_key: true,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults));
    assert!(matches!(s.handshake(), Err(ReflashError::Level2Denied)));
    assert_eq!(s.state(), ReflashState::Failed(ReflashErrorKind::Level2Denied));
}

#[test]
fn keys_follow_issued_seeds() {
    init_logging();
    let mut pcm = SimulatedPcm::new(image(RomVariant::Small, 1, b"VIN"));
    pcm.set_seeds([10, 20, 0b1100_0000], [0x37, 0x52, 0x00]);
    for salt in [0x00, 0x01, 0x7F, 0xFE] {
        let mut s = ReflashSession::with_salt(pcm.clone(), fast_options(), salt);
        s.handshake().unwrap();
    }
}

#[test]
fn dropped_upload_packets_fail_the_read() {
    init_logging();
    let faults = SimFaults {
        drop_upload_packets: 1,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Small, 1, b"VIN"), faults));
    let err = s.read_firmware().unwrap_err();
    assert!(matches!(err, ReflashError::ProtocolError { step: "block upload", .. }), "{err:?}");
    // No retry on read
    assert_eq!(s.into_channel().counters().upload_requests, 1);
}

#[test]
fn checksum_rejection_fails_the_read() {
    init_logging();
    let faults = SimFaults {
        fail_checksum: true,
        ..Default::default()
    };
    let mut s = session(SimulatedPcm::with_faults(image(RomVariant::Medium, 1, b"VIN"), faults));
    assert!(matches!(s.read_firmware(), Err(ReflashError::ChecksumMismatch)));
    assert_eq!(s.state(), ReflashState::Failed(ReflashErrorKind::ChecksumMismatch));
}

#[test]
fn probe_and_identity_read() {
    init_logging();
    for variant in RomVariant::iter() {
        let flashed = image(variant, 21, b"1FMYU60E5YUA00004");
        let mut s = session(SimulatedPcm::new(flashed.clone()));
        assert_eq!(s.probe_layout().unwrap(), variant);
        s.handshake().unwrap();
        let id = s.read_identity_block().unwrap();
        assert_eq!(&id, flashed.identity_block());
        assert!(id.is_checksum_valid());
        assert_eq!(&id.vin()[..17], "1FMYU60E5YUA00004");
    }
}

#[test]
fn flash_steps_need_a_handshake() {
    init_logging();
    let mut s = session(SimulatedPcm::new(image(RomVariant::Small, 1, b"VIN")));
    assert!(matches!(s.erase_flash(), Err(ReflashError::ProtocolError { step: "erase", .. })));
    assert!(s.program_bank(0x1_2000, &[0; 0x400]).is_err());
    // Misuse doesn't fail the session
    assert_eq!(s.state(), ReflashState::Idle);

    s.handshake().unwrap();
    assert!(matches!(
        s.program_bank(0x1_2000, &[0; 0x3FF]),
        Err(ReflashError::BoundsError { .. })
    ));
}

#[test]
fn bank_level_operations() {
    init_logging();
    let flashed = image(RomVariant::Small, 8, b"VIN");
    let mut s = session(SimulatedPcm::new(flashed.clone()));
    s.handshake().unwrap();
    let block = s.read_range(0x8_2000, 0x800).unwrap();
    assert_eq!(block, flashed.read_bytes(0x8_2000, 0x800).unwrap());

    s.erase_flash().unwrap();
    assert_eq!(s.read_range(0x8_2000, 0x400).unwrap(), vec![0xFF; 0x400]);
    s.program_bank(0x8_2000, &block).unwrap();
    assert_eq!(s.read_range(0x8_2000, 0x800).unwrap(), block);
    assert!(!s.verify_checksum(&flashed).unwrap());
    assert_eq!(s.state(), ReflashState::Ready);
}

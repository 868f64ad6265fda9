//! Determinism of local sessions: stable checksums, frame data round
//! trips, tamper detection and recorded replays.

mod common;

use common::{checksum_of, context_params, record, session_params, Counter};
use lockstep::session::{DeterministicSession, GameMode};
use lockstep::sim::checksum::ChecksumVerdict;
use lockstep::sim::serializer::{gunzip, gzip};
use lockstep::sim::{FrameError, FrameSerializer, ReplayFile};

fn run_local(ticks: i32) -> DeterministicSession {
    let params = session_params(GameMode::Local, context_params(1, 8, 10, 0), 0, |tick| (tick % 3) as u8);
    let mut session = DeterministicSession::new(params).unwrap();
    session.update_to(ticks).unwrap();
    session
}

#[test]
fn first_tick_with_one_player() {
    let session = run_local(0);
    let frame = session.verified_frame();
    assert_eq!(frame.number(), 0);
    assert!(frame.is_verified());
    assert_eq!(frame.players().len(), 1);
    let counters = frame.filter::<Counter>().unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].1, Counter { owner: 0, total: 0 });

    let checksum = checksum_of(frame);
    assert_ne!(checksum, 0);
    assert_eq!(checksum, checksum_of(run_local(0).verified_frame()));
}

#[test]
fn identical_input_gives_identical_checksums() {
    let a = run_local(200);
    let b = run_local(200);
    assert_eq!(checksum_of(a.verified_frame()), checksum_of(b.verified_frame()));

    let other = {
        let params = session_params(GameMode::Local, context_params(1, 8, 10, 0), 0, |tick| (tick % 5) as u8);
        let mut session = DeterministicSession::new(params).unwrap();
        session.update_to(200).unwrap();
        session
    };
    assert_ne!(checksum_of(a.verified_frame()), checksum_of(other.verified_frame()));
}

#[test]
fn frame_data_round_trip_and_tamper() {
    let session = run_local(50);
    let context = session.context().clone();
    let mut serializer = FrameSerializer::new();

    let mut source = context.create_frame().unwrap();
    source.copy_from(session.verified_frame()).unwrap();
    let data = serializer.serialize(&mut source).unwrap();

    let mut restored = context.create_frame().unwrap();
    assert_eq!(serializer.deserialize(&mut restored, &data).unwrap(), 50);
    assert_eq!(checksum_of(&restored), checksum_of(session.verified_frame()));

    // Header is mode (4 bytes), tick (4 bytes), checksum (8 bytes).
    let mut raw = gunzip(&data).unwrap();
    raw[8] ^= 0x01;
    let tampered = gzip(&raw).unwrap();
    let mut target = context.create_frame().unwrap();
    assert!(matches!(
        serializer.deserialize(&mut target, &tampered),
        Err(FrameError::ChecksumMismatch { .. })
    ));

    // Truncated envelope.
    let mut target = context.create_frame().unwrap();
    assert!(matches!(
        serializer.deserialize(&mut target, &data[..data.len() / 2]),
        Err(FrameError::Compression(_))
    ));
}

#[test]
fn local_events_are_delivered_then_confirmed() {
    let mut params = session_params(GameMode::Local, context_params(1, 8, 10, 0), 0, |tick| u8::from(tick % 2 == 1));
    let recorder = record(&mut params);
    let mut session = DeterministicSession::new(params).unwrap();
    session.update_to(9).unwrap();

    let r = recorder.lock().unwrap();
    assert_eq!(r.delivered, vec![1, 3, 5, 7, 9]);
    assert_eq!(r.confirmed, r.delivered);
    assert!(r.canceled.is_empty());
    assert_eq!(r.checksums.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(session.pending_event_count(), 0);
}

#[test]
fn replay_reproduces_and_detects_tampering() {
    let mut session = run_local(3);
    session.start_recording_replay().unwrap();
    session.update_to(120).unwrap();
    let live = checksum_of(session.verified_frame());

    let file = session.replay_file().unwrap();
    assert_eq!(file.initial_tick, 4);
    assert_eq!(file.inputs.len(), 117);
    let json = file.to_json().unwrap();
    let file = ReplayFile::from_json(&json).unwrap();

    // Clean playback
    let mut params = session_params(GameMode::Replay, context_params(1, 8, 10, 0), 0, |_| 0);
    params.replay = Some(file.clone());
    let mut replay = DeterministicSession::new(params).unwrap();
    replay.update_to(1_000).unwrap();
    assert_eq!(replay.verified_frame().number(), 120);
    assert_eq!(checksum_of(replay.verified_frame()), live);
    let verifier = replay.checksum_verifier().unwrap();
    assert_eq!(verifier.verified(), 12);
    assert!(verifier.mismatches().is_empty());

    // Tampered checksum file
    let mut tampered = file;
    if let Some(checksums) = tampered.checksums.as_mut() {
        checksums.entries[5].checksum ^= 1;
    }
    let bad_tick = tampered.checksums.as_ref().unwrap().entries[5].tick;
    let mut params = session_params(GameMode::Replay, context_params(1, 8, 10, 0), 0, |_| 0);
    let recorder = record(&mut params);
    params.replay = Some(tampered);
    let mut replay = DeterministicSession::new(params).unwrap();
    replay.update_to(1_000).unwrap();

    let verifier = replay.checksum_verifier().unwrap();
    assert_eq!(verifier.mismatches().len(), 1);
    assert_eq!(verifier.mismatches()[0].0, bad_tick);
    assert!(matches!(verifier.mismatches()[0].1, ChecksumVerdict::Mismatch { .. }));
    assert_eq!(replay.take_checksum_error(), Some(bad_tick));
    assert_eq!(recorder.lock().unwrap().checksum_errors, vec![(bad_tick, false)]);
}

#[test]
fn replay_file_survives_binary_encoding() {
    let mut session = run_local(-1);
    session.start_recording_replay().unwrap();
    session.update_to(30).unwrap();
    let file = session.replay_file().unwrap();
    assert_eq!(file.initial_tick, 0);
    assert_eq!(file.inputs[0].joins.len(), 1);
    assert!(file.inputs.iter().enumerate().all(|(i, inputs)| inputs.tick == i as i32));

    let decoded = ReplayFile::from_bytes(&file.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, file);
}

//! Runner lifecycle against a relay running as a tokio task.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{context_params, record, session_params};
use lockstep::session::{
    CancelSource, CancelToken, GameMode, LocalRelay, RunnerArguments, RunnerError, RunnerState, SessionRunner,
    ShutdownCause,
};
use lockstep::sim::config::InstantReplaySettings;

const STEP: Duration = Duration::from_millis(5);

async fn drive(runners: &mut [SessionRunner], until_tick: i32) {
    for _ in 0..5_000 {
        let done = runners.iter().all(|r| {
            r.session()
                .is_some_and(|s| s.verified_frame().number() >= until_tick)
        });
        if done {
            return;
        }
        for runner in runners.iter_mut() {
            if runner.state() == RunnerState::Running {
                let _ = runner.service(STEP);
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn two_runners_converge_through_relay() {
    let mut relay = LocalRelay::new(2);
    let mut logs = Vec::new();
    let mut args = Vec::new();
    for player in 0..2 {
        let mut params = session_params(
            GameMode::Multiplayer,
            context_params(2, 8, 10, 0),
            player,
            move |tick| ((tick + player) % 2) as u8,
        )
        .with_communicator(relay.connect());
        logs.push(record(&mut params));
        let mut a = RunnerArguments::new(params);
        a.shutdown_on_checksum_error = true;
        args.push(a);
    }
    let stop = CancelSource::new();
    let relay_task = tokio::spawn(relay.run(Duration::from_millis(1), stop.token()));

    let mut runners = vec![SessionRunner::new(), SessionRunner::new()];
    let (first, second) = runners.split_at_mut(1);
    let (args_b, args_a) = (args.pop().unwrap(), args.pop().unwrap());
    let (a, b) = tokio::join!(
        first[0].start_async(args_a, Duration::from_secs(5), CancelToken::never()),
        second[0].start_async(args_b, Duration::from_secs(5), CancelToken::never()),
    );
    a.unwrap();
    b.unwrap();

    drive(&mut runners, 60).await;
    for runner in &runners {
        assert_eq!(runner.state(), RunnerState::Running);
    }

    let a = logs[0].lock().unwrap();
    let b = logs[1].lock().unwrap();
    let common: Vec<_> = a.checksums.keys().filter(|t| b.checksums.contains_key(t)).copied().collect();
    assert!(common.len() >= 6);
    for tick in common {
        assert_eq!(a.checksums[&tick], b.checksums[&tick], "checksum diverged at {tick}");
    }
    assert!(a.checksum_errors.is_empty());
    drop((a, b));

    for runner in &mut runners {
        runner.shutdown_async(ShutdownCause::Ok).await;
        assert_eq!(runner.state(), RunnerState::Shutdown);
    }
    stop.cancel();
    relay_task.await.unwrap();
}

#[tokio::test]
async fn checksum_error_shuts_down_when_configured() {
    let mut relay = LocalRelay::new(2);
    let mut args = Vec::new();
    for (player, salt) in [(0, 0), (1, 5)] {
        let params = session_params(GameMode::Multiplayer, context_params(2, 8, 5, salt), player, |_| 1)
            .with_communicator(relay.connect());
        let mut a = RunnerArguments::new(params);
        a.shutdown_on_checksum_error = player == 0;
        args.push(a);
    }
    let stop = CancelSource::new();
    let relay_task = tokio::spawn(relay.run(Duration::from_millis(1), stop.token()));

    let causes = Arc::new(Mutex::new(Vec::new()));
    let mut runners = vec![SessionRunner::new(), SessionRunner::new()];
    let c = causes.clone();
    runners[0].set_on_shutdown(move |cause| c.lock().unwrap().push(cause));
    let (first, second) = runners.split_at_mut(1);
    let (args_b, args_a) = (args.pop().unwrap(), args.pop().unwrap());
    let (a, b) = tokio::join!(
        first[0].start_async(args_a, Duration::from_secs(5), CancelToken::never()),
        second[0].start_async(args_b, Duration::from_secs(5), CancelToken::never()),
    );
    a.unwrap();
    b.unwrap();

    for _ in 0..5_000 {
        if runners[0].state() == RunnerState::Shutdown {
            break;
        }
        for runner in runners.iter_mut() {
            let _ = runner.service(STEP);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(runners[0].state(), RunnerState::Shutdown);
    assert_eq!(runners[0].shutdown_cause(), Some(ShutdownCause::ChecksumError));
    assert_eq!(*causes.lock().unwrap(), vec![ShutdownCause::ChecksumError]);
    assert_eq!(
        runners[0].service(STEP),
        Err(RunnerError::Shutdown(ShutdownCause::ChecksumError))
    );

    runners[1].shutdown_async(ShutdownCause::Ok).await;

    stop.cancel();
    relay_task.await.unwrap();
}

#[tokio::test]
async fn relay_shutdown_ends_runner_with_network_error() {
    let mut relay = LocalRelay::new(1);
    let params = session_params(GameMode::Multiplayer, context_params(1, 8, 0, 0), 0, |_| 0)
        .with_communicator(relay.connect());
    let stop = CancelSource::new();
    let relay_task = tokio::spawn(relay.run(Duration::from_millis(1), stop.token()));

    let mut runner = SessionRunner::new();
    runner
        .start_async(RunnerArguments::new(params), Duration::from_secs(5), CancelToken::never())
        .await
        .unwrap();
    drive(std::slice::from_mut(&mut runner), 10).await;

    stop.cancel();
    relay_task.await.unwrap();
    for _ in 0..100 {
        if runner.state() == RunnerState::Shutdown {
            break;
        }
        let _ = runner.service(STEP);
    }
    assert_eq!(runner.shutdown_cause(), Some(ShutdownCause::NetworkError));
}

#[tokio::test]
async fn finished_replay_stops_runner() {
    let mut recorder = SessionRunner::new();
    let params = session_params(GameMode::Local, context_params(1, 8, 10, 0), 0, |t| (t % 2) as u8);
    let mut args = RunnerArguments::new(params);
    args.record_replay = true;
    args.instant_replay = Some(InstantReplaySettings {
        snapshot_interval: 10,
        length_seconds: 1,
    });
    recorder.start(args).unwrap();
    drive(std::slice::from_mut(&mut recorder), 50).await;

    let session = recorder.session().unwrap();
    let file = session.replay_file().unwrap();
    let mut instant = session.start_instant_replay(true).unwrap();
    assert!(instant.update(Duration::from_secs(2)).unwrap());
    recorder.shutdown(ShutdownCause::Ok);

    let mut params = session_params(GameMode::Replay, context_params(1, 8, 10, 0), 0, |_| 0);
    params.replay = Some(file);
    let mut runner = SessionRunner::new();
    runner.start(RunnerArguments::new(params)).unwrap();
    assert_eq!(runner.state(), RunnerState::Running);
    for _ in 0..1_000 {
        if runner.state() == RunnerState::Shutdown {
            break;
        }
        runner.service(Duration::from_millis(100)).unwrap();
    }
    assert_eq!(runner.shutdown_cause(), Some(ShutdownCause::SimulationStopped));
}

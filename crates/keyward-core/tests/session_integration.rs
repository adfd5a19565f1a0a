#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Integration tests for command dispatch and the connection lifecycle.
//!
//! Every test drives a `SessionManager` over a `SimulatedToken` and
//! checks the exchanges the token actually saw.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keyward_core::simulator::{Exchange, Fault, FixedClock, SimulatedToken, SIMULATED_EPOCH};
use keyward_core::{
    AuthState, Confirmation, DeviceError, DispatchOutcome, KeywardError, LinkState, Options, SessionManager,
    StateError,
};
use keyward_proto::{Command, CommandKind, CommandStatus, DeviceModel, PinRole};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn manager(token: &SimulatedToken) -> SessionManager {
    SessionManager::with_clock(
        token.clone(),
        Options::default(),
        Arc::new(FixedClock::default()),
    )
    .unwrap()
}

fn open(token: &SimulatedToken) -> Arc<SessionManager> {
    let session = manager(token);
    session.connect().unwrap();
    Arc::new(session)
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

#[test]
fn connect_reads_status_counters_and_slots() {
    let token = SimulatedToken::storage();
    token.with_state(|s| s.retries[PinRole::Admin.index()] = 2);
    let session = manager(&token);

    let status = session.connect().unwrap();

    assert_eq!(status.model, DeviceModel::Storage);
    assert_eq!(status.retries(PinRole::User), 3);
    assert_eq!(status.retries(PinRole::Admin), 2);
    assert_eq!(status.otp_slots.len(), 18);
    assert!(!status.time.out_of_sync);
    assert_eq!(session.link_state(), LinkState::Connected);
}

#[test]
fn connecting_twice_is_refused() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    assert!(matches!(
        session.connect(),
        Err(KeywardError::State(StateError::PreconditionNotMet(_)))
    ));
}

#[test]
fn reconnect_starts_a_new_session() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    let first = session.snapshot().device.unwrap().session_id;
    session.detach();
    let second = session.connect().unwrap().session_id;
    assert_ne!(first, second);
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

#[test]
fn submissions_run_in_order() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    token.clear_journal();

    let first = session.submit(Command::GetTime).unwrap();
    let second = session.submit(Command::GetStatus).unwrap();
    let third = session.submit(Command::GetRetryCount(PinRole::User)).unwrap();
    for pending in [first, second, third] {
        assert!(matches!(pending.wait(), DispatchOutcome::Success(_)));
    }

    assert_eq!(
        token.received(),
        vec![
            CommandKind::GetTime,
            CommandKind::GetStatus,
            CommandKind::GetRetryCount
        ]
    );
}

#[test]
fn concurrent_callers_never_interleave() {
    let token = SimulatedToken::storage();
    let session = open(&token);
    token.clear_journal();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for _ in 0..10 {
                    session.dispatch(Command::GetTime).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let journal = token.journal();
    assert_eq!(journal.len(), 80);
    for pair in journal.chunks(2) {
        assert!(
            matches!(pair, [Exchange::Begin(a), Exchange::End(b)] if a == b),
            "interleaved exchange: {pair:?}"
        );
    }
}

// ---------------------------------------------------------------------------
// Detach and failures
// ---------------------------------------------------------------------------

#[test]
fn detach_cancels_in_flight_and_queued_commands() {
    let token = SimulatedToken::storage();
    let session = open(&token);
    token.clear_journal();

    let (release, hold) = mpsc::channel();
    token.push_fault(Fault::Hold(hold));
    let in_flight = session.submit(Command::GetTime).unwrap();
    let queued = session.submit(Command::GetStatus).unwrap();
    wait_for(|| token.received().contains(&CommandKind::GetTime));
    assert_eq!(session.link_state(), LinkState::CommandInFlight);

    session.detach();

    assert!(matches!(in_flight.wait(), DispatchOutcome::Cancelled));
    assert!(matches!(queued.wait(), DispatchOutcome::Cancelled));
    release.send(()).unwrap();
    wait_for(|| token.journal().len() == 2);
    assert!(!token.received().contains(&CommandKind::GetStatus));
    assert_eq!(session.link_state(), LinkState::Disconnected);
    assert!(session.snapshot().device.is_none());
}

#[test]
fn disconnected_session_sends_nothing() {
    let token = SimulatedToken::pro();
    let session = manager(&token);
    assert!(matches!(
        session.dispatch(Command::GetStatus),
        Err(KeywardError::Device(DeviceError::Disconnected))
    ));
    assert!(token.journal().is_empty());
}

#[test]
fn timeout_keeps_the_session() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    token.push_fault(Fault::Timeout);

    assert!(matches!(
        session.dispatch(Command::GetTime),
        Err(KeywardError::Device(DeviceError::CommunicationTimeout))
    ));
    assert_eq!(session.link_state(), LinkState::Connected);
    assert!(session.dispatch(Command::GetTime).is_ok());
}

#[test]
fn io_failure_tears_the_session_down() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    token.push_fault(Fault::Io("pipe closed".into()));

    assert!(matches!(
        session.dispatch(Command::GetTime),
        Err(KeywardError::Device(DeviceError::Io(_)))
    ));
    assert_eq!(session.link_state(), LinkState::Disconnected);
    assert!(session.snapshot().device.is_none());
}

#[test]
fn unexpected_status_tears_the_session_down() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    token.push_fault(Fault::Status(CommandStatus::Unexpected(0xEE)));

    assert!(matches!(
        session.dispatch(Command::GetTime),
        Err(KeywardError::Device(DeviceError::UnexpectedStatus(0xEE)))
    ));
    assert_eq!(session.link_state(), LinkState::Disconnected);
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

#[test]
fn skewed_clock_is_flagged_and_resynced() {
    let token = SimulatedToken::storage();
    token.with_state(|s| s.clock = SIMULATED_EPOCH + 120);
    let session = open(&token);
    let time = session.snapshot().device.unwrap().time;
    assert!(time.out_of_sync);
    assert_eq!(time.skew_secs, 120);

    assert!(matches!(
        session.resync_time(Confirmation::Withheld),
        Err(KeywardError::State(StateError::ConfirmationRequired))
    ));
    session.resync_time(Confirmation::Acknowledged).unwrap();

    assert_eq!(token.with_state(|s| s.clock), SIMULATED_EPOCH);
    assert!(!session.check_time().unwrap().out_of_sync);
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[test]
fn lock_device_forgets_authentication() {
    let token = SimulatedToken::storage();
    let session = open(&token);
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    let before = session.snapshot().device.unwrap();
    assert_eq!(before.auth_state(PinRole::Admin), AuthState::Authenticated);

    session.lock_device().unwrap();

    let status = session.snapshot().device.unwrap();
    assert_eq!(status.auth_state(PinRole::Admin), AuthState::Locked);
    assert_eq!(status.retries(PinRole::Admin), 3);
}

#[test]
fn refresh_status_picks_up_device_flags() {
    let token = SimulatedToken::storage();
    let session = open(&token);
    token.with_state(|s| {
        s.report.otp_user_pin_protected = true;
        s.retries[PinRole::User.index()] = 1;
    });

    let status = session.refresh_status().unwrap();

    assert!(status.otp_user_pin_protected);
    assert_eq!(status.retries(PinRole::User), 1);
    assert_eq!(session.status().unwrap(), status);
}

#[test]
fn status_is_unavailable_after_detach() {
    let token = SimulatedToken::pro();
    let session = open(&token);
    assert!(session.status().is_ok());

    session.detach();

    assert!(matches!(
        session.status(),
        Err(KeywardError::Device(DeviceError::Disconnected))
    ));
}

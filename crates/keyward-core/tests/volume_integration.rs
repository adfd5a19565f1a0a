#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Integration tests for encrypted, hidden and unencrypted volumes and
//! the storage maintenance operations.

use std::sync::{Arc, Mutex};

use keyward_core::simulator::{Fault, FixedClock, SimulatedToken};
use keyward_core::{
    AuthenticationError, CancelFlag, Confirmation, DeviceError, HiddenVolumeState, KeywardError,
    NoProgress, Options, PasswordSafeController, SafeStatus, SessionManager, StateError,
    ValidationError, VolumeController, VolumeState,
};
use keyward_proto::{CommandKind, CommandStatus, PinRole, UnencryptedMode};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn open_with(token: &SimulatedToken, options: Options) -> Arc<SessionManager> {
    let session =
        SessionManager::with_clock(token.clone(), options, Arc::new(FixedClock::default()))
            .unwrap();
    session.connect().unwrap();
    Arc::new(session)
}

fn open(token: &SimulatedToken) -> (Arc<SessionManager>, VolumeController) {
    let session = open_with(token, Options::default());
    let volumes = VolumeController::new(Arc::clone(&session));
    (session, volumes)
}

fn unlocked(token: &SimulatedToken) -> (Arc<SessionManager>, VolumeController) {
    let (session, volumes) = open(token);
    volumes.enable_encrypted_volume("123456").unwrap();
    (session, volumes)
}

/// Storage token whose flash was already filled with random data.
fn filled_storage() -> SimulatedToken {
    let token = SimulatedToken::storage();
    token.with_state(|s| s.report.filled_with_random = true);
    token
}

fn create(
    volumes: &VolumeController,
    slot: u8,
    start_pct: u8,
    end_pct: u8,
    password: &str,
) -> Result<(), KeywardError> {
    volumes.create_hidden_volume(
        slot,
        start_pct,
        end_pct,
        password,
        password,
        &NoProgress,
        &CancelFlag::new(),
    )
}

fn fast_poll() -> Options {
    Options {
        progress_poll_ms: 0,
        ..Options::default()
    }
}

// ---------------------------------------------------------------------------
// Encrypted volume
// ---------------------------------------------------------------------------

#[test]
fn enable_encrypted_volume_with_user_pin() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);

    volumes.enable_encrypted_volume("123456").unwrap();

    let status = session.snapshot().device.unwrap();
    assert_eq!(status.encrypted_volume, VolumeState::Enabled);
    assert!(token.with_state(|s| s.report.encrypted_volume_active));
}

#[test]
fn wrong_pin_reports_wrong_password_and_moves_counter() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);

    let err = volumes.enable_encrypted_volume("000000").unwrap_err();

    assert!(matches!(err, KeywardError::WrongPassword { status_code: 4 }));
    let status = session.snapshot().device.unwrap();
    assert_eq!(status.retries(PinRole::User), 2);
    assert_eq!(status.encrypted_volume, VolumeState::Disabled);
}

#[test]
fn third_wrong_pin_locks_out_the_volume() {
    let token = SimulatedToken::storage();
    let (_session, volumes) = open(&token);
    volumes.enable_encrypted_volume("000000").unwrap_err();
    volumes.enable_encrypted_volume("000000").unwrap_err();

    let err = volumes.enable_encrypted_volume("000000").unwrap_err();

    assert!(matches!(
        err,
        KeywardError::Authentication(AuthenticationError::PermanentLockout(PinRole::User))
    ));
    token.clear_journal();
    assert!(volumes.enable_encrypted_volume("123456").is_err());
    assert!(token.received().is_empty());
}

#[test]
fn volumes_need_a_storage_model() {
    let token = SimulatedToken::pro();
    let (_session, volumes) = open(&token);
    token.clear_journal();

    assert!(matches!(
        volumes.enable_encrypted_volume("123456"),
        Err(KeywardError::State(StateError::PreconditionNotMet(_)))
    ));
    assert!(token.received().is_empty());
}

#[test]
fn disabling_encrypted_volume_locks_hidden_volumes() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);
    create(&volumes, 0, 20, 40, "hidden-pass").unwrap();

    assert!(matches!(
        volumes.disable_encrypted_volume(Confirmation::Withheld),
        Err(KeywardError::State(StateError::ConfirmationRequired))
    ));
    volumes
        .disable_encrypted_volume(Confirmation::Acknowledged)
        .unwrap();

    let status = session.snapshot().device.unwrap();
    assert_eq!(status.encrypted_volume, VolumeState::Disabled);
    assert_eq!(status.hidden_volumes[0].state, HiddenVolumeState::Disabled);
}

// ---------------------------------------------------------------------------
// Unencrypted volume
// ---------------------------------------------------------------------------

#[test]
fn unencrypted_mode_follows_the_token() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);

    volumes
        .set_unencrypted_volume_mode(UnencryptedMode::ReadOnly)
        .unwrap();

    assert_eq!(
        session.snapshot().device.unwrap().unencrypted_mode,
        UnencryptedMode::ReadOnly
    );
    assert_eq!(
        token.with_state(|s| s.report.unencrypted_mode),
        UnencryptedMode::ReadOnly
    );
}

#[test]
fn refused_mode_change_keeps_the_old_mode() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);
    token.push_fault(Fault::Status(CommandStatus::Failed(6)));

    assert!(matches!(
        volumes.set_unencrypted_volume_mode(UnencryptedMode::ReadOnly),
        Err(KeywardError::Device(DeviceError::StatusCode(6)))
    ));
    assert_eq!(
        session.snapshot().device.unwrap().unencrypted_mode,
        UnencryptedMode::ReadWrite
    );
}

// ---------------------------------------------------------------------------
// Hidden volumes
// ---------------------------------------------------------------------------

#[test]
fn hidden_volume_needs_unlocked_encrypted_volume() {
    let token = SimulatedToken::storage();
    let (_session, volumes) = open(&token);
    token.clear_journal();

    assert!(matches!(
        create(&volumes, 0, 20, 40, "hidden-pass"),
        Err(KeywardError::State(StateError::PreconditionNotMet(_)))
    ));
    assert!(token.received().is_empty());
}

#[test]
fn hidden_volume_input_is_validated_locally() {
    let token = filled_storage();
    let (_session, volumes) = unlocked(&token);
    token.clear_journal();

    assert!(matches!(
        create(&volumes, 4, 20, 40, "hidden-pass"),
        Err(KeywardError::Validation(ValidationError::OutOfRange(_)))
    ));
    assert!(matches!(
        create(&volumes, 0, 20, 40, "short"),
        Err(KeywardError::Validation(ValidationError::BadLength(_)))
    ));
    assert!(matches!(
        volumes.create_hidden_volume(
            0,
            20,
            40,
            "hidden-pass",
            "hidden-pasS",
            &NoProgress,
            &CancelFlag::new()
        ),
        Err(KeywardError::Validation(ValidationError::Mismatch))
    ));
    assert!(matches!(
        create(&volumes, 0, 40, 40, "hidden-pass"),
        Err(KeywardError::Validation(ValidationError::OutOfRange(_)))
    ));
    assert!(matches!(
        create(&volumes, 0, 50, 101, "hidden-pass"),
        Err(KeywardError::Validation(ValidationError::OutOfRange(_)))
    ));
    assert!(token.received().is_empty());
}

#[test]
fn hidden_volume_must_start_in_unwritten_region() {
    let token = filled_storage();
    let (_session, volumes) = unlocked(&token);

    let err = create(&volumes, 0, 5, 30, "hidden-pass").unwrap_err();

    assert!(matches!(
        err,
        KeywardError::Validation(ValidationError::OutOfRange(_))
    ));
    assert!(!token.received().contains(&CommandKind::CreateHiddenVolume));
}

#[test]
fn created_volumes_raise_the_high_water_mark() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);

    create(&volumes, 0, 20, 40, "first-pass").unwrap();
    assert_eq!(volumes.free_region().unwrap().start_pct, 40);
    assert!(matches!(
        create(&volumes, 1, 30, 50, "second-pass"),
        Err(KeywardError::Validation(ValidationError::OutOfRange(_)))
    ));
    assert!(matches!(
        create(&volumes, 0, 20, 40, "first-pass"),
        Err(KeywardError::Validation(ValidationError::OutOfRange(_)))
    ));
    create(&volumes, 1, 40, 60, "second-pass").unwrap();

    let status = session.snapshot().device.unwrap();
    assert_eq!(status.hidden_volumes[0].range, Some((20, 40)));
    assert_eq!(status.hidden_volumes[1].range, Some((40, 60)));
    assert_eq!(status.hidden_volumes[1].state, HiddenVolumeState::Enabled);
    assert_eq!(status.hidden_volumes[2].state, HiddenVolumeState::NotConfigured);
}

#[test]
fn enable_and_disable_hidden_volume() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);
    create(&volumes, 2, 20, 40, "hidden-pass").unwrap();

    assert!(matches!(
        volumes.enable_hidden_volume(2, "not-the-pass"),
        Err(KeywardError::WrongPassword { .. })
    ));
    assert_eq!(
        session.snapshot().device.unwrap().retries(PinRole::User),
        3
    );

    volumes.enable_hidden_volume(2, "hidden-pass").unwrap();
    assert!(token.with_state(|s| s.report.hidden_volume_active));

    assert!(matches!(
        volumes.disable_hidden_volume(2, Confirmation::Withheld),
        Err(KeywardError::State(StateError::ConfirmationRequired))
    ));
    volumes
        .disable_hidden_volume(2, Confirmation::Acknowledged)
        .unwrap();
    assert_eq!(
        session.snapshot().device.unwrap().hidden_volumes[2].state,
        HiddenVolumeState::Disabled
    );
    assert!(matches!(
        volumes.disable_hidden_volume(2, Confirmation::Acknowledged),
        Err(KeywardError::State(StateError::PreconditionNotMet(_)))
    ));
}

#[test]
fn hidden_volume_needs_random_fill() {
    let token = SimulatedToken::storage();
    let (session, volumes) = unlocked(&token);
    assert!(!session.snapshot().device.unwrap().filled_with_random);
    token.clear_journal();

    assert!(matches!(
        create(&volumes, 0, 20, 40, "hidden-pass"),
        Err(KeywardError::State(StateError::PreconditionNotMet(_)))
    ));
    assert!(token.received().is_empty());
    assert!(token.with_state(|s| s.hidden.iter().all(Option::is_none)));
}

#[test]
fn random_fill_allows_hidden_volumes() {
    let token = SimulatedToken::storage();
    let session = open_with(&token, fast_poll());
    let volumes = VolumeController::new(Arc::clone(&session));
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    volumes
        .fill_with_random(Confirmation::Acknowledged, &NoProgress, &CancelFlag::new())
        .unwrap();
    volumes.enable_encrypted_volume("123456").unwrap();

    create(&volumes, 0, 20, 40, "hidden-pass").unwrap();

    assert_eq!(
        session.snapshot().device.unwrap().hidden_volumes[0].state,
        HiddenVolumeState::Enabled
    );
}

#[test]
fn hidden_volume_creation_reports_progress() {
    let token = filled_storage();
    let (_session, volumes) = unlocked(&token);
    let seen = Mutex::new(Vec::new());
    let sink = |percent: u8| seen.lock().unwrap().push(percent);

    volumes
        .create_hidden_volume(0, 20, 40, "hidden-pass", "hidden-pass", &sink, &CancelFlag::new())
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 100]);
}

#[test]
fn hidden_volume_cancelled_before_start_sends_nothing() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);
    let cancel = CancelFlag::new();
    cancel.cancel();
    token.clear_journal();

    assert!(matches!(
        volumes.create_hidden_volume(0, 20, 40, "hidden-pass", "hidden-pass", &NoProgress, &cancel),
        Err(KeywardError::Cancelled)
    ));
    assert!(token.received().is_empty());
    assert_eq!(
        session.snapshot().device.unwrap().hidden_volumes[0].state,
        HiddenVolumeState::NotConfigured
    );
}

#[test]
fn refresh_picks_up_volumes_locked_elsewhere() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);
    create(&volumes, 0, 20, 40, "hidden-pass").unwrap();

    token.with_state(|s| {
        s.report.encrypted_volume_active = false;
        s.report.hidden_volume_active = false;
    });
    let status = session.refresh_status().unwrap();

    assert_eq!(status.encrypted_volume, VolumeState::Disabled);
    assert_eq!(status.hidden_volumes[0].state, HiddenVolumeState::Disabled);
    assert_eq!(status.hidden_volumes[0].range, Some((20, 40)));
}

#[test]
fn refresh_locks_only_the_hidden_volume() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);
    create(&volumes, 1, 20, 40, "hidden-pass").unwrap();
    volumes.enable_hidden_volume(1, "hidden-pass").unwrap();

    token.with_state(|s| s.report.hidden_volume_active = false);
    let status = session.refresh_status().unwrap();

    assert_eq!(status.encrypted_volume, VolumeState::Enabled);
    assert_eq!(status.hidden_volumes[1].state, HiddenVolumeState::Disabled);
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[test]
fn regenerating_keys_requires_admin() {
    let token = SimulatedToken::storage();
    let (_session, volumes) = open(&token);
    token.clear_journal();

    assert!(matches!(
        volumes.regenerate_aes_keys(Confirmation::Acknowledged, &NoProgress, &CancelFlag::new()),
        Err(KeywardError::Authentication(AuthenticationError::NotAuthenticated(PinRole::Admin)))
    ));
    assert!(token.received().is_empty());
}

#[test]
fn regenerating_keys_invalidates_protected_data() {
    let token = filled_storage();
    let (session, volumes) = unlocked(&token);
    let safe = PasswordSafeController::new(Arc::clone(&session));
    safe.unlock("123456").unwrap();
    create(&volumes, 0, 20, 40, "hidden-pass").unwrap();
    session.authenticate(PinRole::Admin, "12345678").unwrap();

    volumes
        .regenerate_aes_keys(Confirmation::Acknowledged, &NoProgress, &CancelFlag::new())
        .unwrap();

    let status = session.snapshot().device.unwrap();
    assert_eq!(status.encrypted_volume, VolumeState::Disabled);
    assert_eq!(status.hidden_volumes[0].state, HiddenVolumeState::NotConfigured);
    assert_eq!(status.safe, SafeStatus::Invalidated);
    assert!(matches!(
        safe.read_slot(0),
        Err(KeywardError::Authentication(AuthenticationError::NotInitialized))
    ));
}

#[test]
fn regenerating_keys_reports_progress() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    let seen = Mutex::new(Vec::new());
    let sink = |percent: u8| seen.lock().unwrap().push(percent);

    volumes
        .regenerate_aes_keys(Confirmation::Acknowledged, &sink, &CancelFlag::new())
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 100]);
    assert_eq!(token.received().last(), Some(&CommandKind::RegenerateAesKeys));
}

#[test]
fn regenerating_keys_cancelled_before_start_sends_nothing() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    token.clear_journal();

    assert!(matches!(
        volumes.regenerate_aes_keys(Confirmation::Acknowledged, &NoProgress, &cancel),
        Err(KeywardError::Cancelled)
    ));
    assert!(token.received().is_empty());
    assert!(session.snapshot().device.unwrap().aes_initialized);
}

#[test]
fn fill_with_random_reports_progress_to_completion() {
    let token = SimulatedToken::storage();
    let session = open_with(&token, fast_poll());
    let volumes = VolumeController::new(Arc::clone(&session));
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    let seen = Mutex::new(Vec::new());
    let sink = |percent: u8| seen.lock().unwrap().push(percent);

    volumes
        .fill_with_random(Confirmation::Acknowledged, &sink, &CancelFlag::new())
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 25, 50, 75, 100]);
    let status = session.snapshot().device.unwrap();
    assert!(status.filled_with_random);
    assert!(!status.new_sd_card);
}

#[test]
fn fill_runs_to_completion_once_started() {
    let token = SimulatedToken::storage();
    let session = open_with(&token, fast_poll());
    let volumes = VolumeController::new(Arc::clone(&session));
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    let cancel = CancelFlag::new();
    let sink = |_percent: u8| cancel.cancel();

    volumes
        .fill_with_random(Confirmation::Acknowledged, &sink, &cancel)
        .unwrap();

    assert!(cancel.is_cancelled());
    assert!(session.snapshot().device.unwrap().filled_with_random);
}

#[test]
fn fill_cancelled_before_start_sends_nothing() {
    let token = SimulatedToken::storage();
    let session = open_with(&token, fast_poll());
    let volumes = VolumeController::new(Arc::clone(&session));
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    token.clear_journal();

    assert!(matches!(
        volumes.fill_with_random(Confirmation::Acknowledged, &NoProgress, &cancel),
        Err(KeywardError::Cancelled)
    ));
    assert!(token.received().is_empty());
}

#[test]
fn new_sd_card_warning_is_cleared_by_admin() {
    let token = SimulatedToken::storage();
    let (session, volumes) = open(&token);
    assert!(session.snapshot().device.unwrap().new_sd_card);

    assert!(volumes.clear_new_sd_card_warning().is_err());
    session.authenticate(PinRole::Admin, "12345678").unwrap();
    volumes.clear_new_sd_card_warning().unwrap();

    assert!(!session.snapshot().device.unwrap().new_sd_card);
    assert!(!token.with_state(|s| s.report.new_sd_card));
}

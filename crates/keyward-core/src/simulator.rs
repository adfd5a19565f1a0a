//! In-memory token that answers every [`Command`] like real hardware.
//!
//! Used by the test suites and by front ends running without a token.
//! [`SimulatedToken`] is a cheap handle: clone it before handing it to
//! the session manager to keep inspecting and steering the device.
//! Codes are deterministic stand-ins, not RFC 4226/6238 values.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keyward_proto::device::{HIDDEN_VOLUME_SLOT_COUNT, SAFE_SLOT_COUNT};
use keyward_proto::{
    Command, CommandKind, CommandStatus, DeviceModel, FirmwareVersion, OtpDigits, OtpKind,
    OtpSlotId, OtpSlotInfo, Payload, PinRole, Response, SafeSlotData, SecretText, StatusReport,
    UnencryptedMode, UnwrittenRegion, MAX_RETRIES,
};

use crate::state::all_otp_slots;
use crate::transport::{Clock, Transport, TransportError};

/// Unix time the simulated clock starts at.
pub const SIMULATED_EPOCH: u64 = 1_700_000_000;

const FILL_STEP: u8 = 25;

/// Failure injected into the next exchange.
#[derive(Debug)]
pub enum Fault {
    /// Report a transport timeout without executing.
    Timeout,
    /// Report a link failure without executing.
    Io(String),
    /// Answer with this status without executing.
    Status(CommandStatus),
    /// Block until the sender signals or is dropped, then execute.
    Hold(Receiver<()>),
}

/// Journal entry written around every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// Command received.
    Begin(CommandKind),
    /// Answer returned.
    End(CommandKind),
}

/// Hidden volume as stored on the simulated card.
#[derive(Debug, Clone)]
pub struct SimHiddenVolume {
    /// Password.
    pub password: SecretText,
    /// Start percent.
    pub start_pct: u8,
    /// End percent.
    pub end_pct: u8,
}

/// OTP slot as stored on the simulated token.
#[derive(Debug, Clone)]
pub struct SimOtpSlot {
    /// Public metadata.
    pub info: OtpSlotInfo,
    /// HOTP moving factor.
    pub counter: u64,
    /// Seed derived from the secret.
    seed: u64,
}

/// Complete device state. Fields are public so tests can arrange any
/// starting point.
#[derive(Debug)]
pub struct TokenState {
    /// Status flags as reported by `GetStatus`.
    pub report: StatusReport,
    /// Credentials, indexed by [`PinRole::index`].
    pub pins: [SecretText; 3],
    /// Retry counters, indexed by [`PinRole::index`].
    pub retries: [u8; 3],
    /// Roles authenticated since the last lock.
    pub authenticated: [bool; 3],
    /// Device clock in Unix seconds.
    pub clock: u64,
    /// Region the token reports as never written.
    pub unwritten: UnwrittenRegion,
    /// Hidden volume configuration.
    pub hidden: [Option<SimHiddenVolume>; HIDDEN_VOLUME_SLOT_COUNT as usize],
    /// OTP slots, HOTP bank first.
    pub otp: Vec<SimOtpSlot>,
    /// Force the next generated code.
    pub next_code: Option<u32>,
    /// Whether the password safe is unlocked.
    pub safe_unlocked: bool,
    /// Password safe contents.
    pub safe: Vec<Option<SafeSlotData>>,
    /// Firmware image served by `ReadFirmware`.
    pub firmware_image: Vec<u8>,
    /// Progress of a running random fill.
    pub fill_progress: Option<u8>,
    /// Token re-enumerated as bootloader; every exchange fails.
    pub update_mode: bool,
    faults: VecDeque<Fault>,
    journal: Vec<Exchange>,
}

impl TokenState {
    fn new(model: DeviceModel, firmware: FirmwareVersion) -> Self {
        let storage = model.has_storage();
        Self {
            report: StatusReport {
                model,
                firmware,
                serial: "00005A1E".into(),
                secret320: true,
                aes_initialized: true,
                otp_user_pin_protected: false,
                firmware_locked: false,
                storage_capacity_gb: if storage { 16 } else { 0 },
                encrypted_volume_active: false,
                hidden_volume_active: false,
                unencrypted_mode: UnencryptedMode::ReadWrite,
                new_sd_card: storage,
                filled_with_random: false,
            },
            pins: PinRole::ALL.map(|role| SecretText::new(role.factory_default())),
            retries: [MAX_RETRIES; 3],
            authenticated: [false; 3],
            clock: SIMULATED_EPOCH,
            unwritten: UnwrittenRegion {
                start_pct: 10,
                end_pct: 100,
            },
            hidden: Default::default(),
            otp: all_otp_slots().map(empty_otp_slot).collect(),
            next_code: None,
            safe_unlocked: false,
            safe: vec![None; usize::from(SAFE_SLOT_COUNT)],
            firmware_image: (0..1300u32).map(|i| i.to_le_bytes()[0]).collect(),
            fill_progress: None,
            update_mode: false,
            faults: VecDeque::new(),
            journal: Vec::new(),
        }
    }

    fn is_authenticated(&self, role: PinRole) -> bool {
        self.authenticated[role.index()]
    }

    fn check_pin(&mut self, role: PinRole, candidate: &SecretText) -> CommandStatus {
        let i = role.index();
        if self.retries[i] == 0 {
            return CommandStatus::NotAuthorized;
        }
        if self.pins[i].matches(candidate) {
            self.retries[i] = MAX_RETRIES;
            self.authenticated[i] = true;
            CommandStatus::Ok
        } else {
            self.retries[i] = self.retries[i].saturating_sub(1);
            self.authenticated[i] = false;
            CommandStatus::WrongPassword
        }
    }

    fn otp_slot(&mut self, id: OtpSlotId) -> Option<&mut SimOtpSlot> {
        self.otp.iter_mut().find(|s| s.info.slot == id)
    }

    fn lock_volumes(&mut self) {
        self.report.encrypted_volume_active = false;
        self.report.hidden_volume_active = false;
    }

    fn factory_reset(&mut self) {
        let model = self.report.model;
        let firmware = self.report.firmware;
        let faults = std::mem::take(&mut self.faults);
        let journal = std::mem::take(&mut self.journal);
        let image = std::mem::take(&mut self.firmware_image);
        *self = Self::new(model, firmware);
        self.report.aes_initialized = false;
        self.faults = faults;
        self.journal = journal;
        self.firmware_image = image;
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, command: &Command) -> Response {
        use CommandStatus as S;
        let storage = self.report.model.has_storage();
        let status = match command {
            Command::GetStatus => {
                return Response::ok(Payload::Status(Box::new(self.report.clone())))
            }
            Command::GetRetryCount(role) => {
                return Response::ok(Payload::RetryCount(self.retries[role.index()]))
            }
            Command::Authenticate { role, pin } => self.check_pin(*role, pin),
            Command::ChangePin { role, old, new } => {
                let status = self.check_pin(*role, old);
                if status.is_ok() {
                    self.pins[role.index()] = new.clone();
                }
                status
            }
            Command::GetTime => return Response::ok(Payload::Time(self.clock)),
            Command::SetTime(t) => {
                self.clock = *t;
                S::Ok
            }
            Command::EnableEncryptedVolume { .. } | Command::EnableHiddenVolume { .. }
                if !self.report.aes_initialized =>
            {
                S::AesNotInitialized
            }
            Command::EnableEncryptedVolume { pin } if storage => {
                let status = self.check_pin(PinRole::User, pin);
                if status.is_ok() {
                    self.report.encrypted_volume_active = true;
                }
                status
            }
            Command::DisableEncryptedVolume if storage => {
                self.lock_volumes();
                S::Ok
            }
            Command::SetUnencryptedMode(mode) if storage => {
                self.report.unencrypted_mode = *mode;
                S::Ok
            }
            Command::GetUnwrittenRegion if storage => {
                return Response::ok(Payload::Region(self.unwritten))
            }
            Command::CreateHiddenVolume {
                slot,
                start_pct,
                end_pct,
                password,
            } if storage => match self.hidden.get_mut(usize::from(*slot)) {
                Some(entry) if self.report.encrypted_volume_active => {
                    *entry = Some(SimHiddenVolume {
                        password: password.clone(),
                        start_pct: *start_pct,
                        end_pct: *end_pct,
                    });
                    S::Ok
                }
                Some(_) => S::NotAuthorized,
                None => S::Failed(2),
            },
            Command::EnableHiddenVolume { slot, password } if storage => {
                let matches = self
                    .hidden
                    .get(usize::from(*slot))
                    .and_then(Option::as_ref)
                    .is_some_and(|h| h.password.matches(password));
                if !self.report.encrypted_volume_active {
                    S::NotAuthorized
                } else if matches {
                    self.report.hidden_volume_active = true;
                    S::Ok
                } else {
                    S::WrongPassword
                }
            }
            Command::DisableHiddenVolume if storage => {
                self.report.hidden_volume_active = false;
                S::Ok
            }
            Command::RegenerateAesKeys => {
                if self.is_authenticated(PinRole::Admin) {
                    self.report.aes_initialized = true;
                    self.lock_volumes();
                    self.hidden = Default::default();
                    self.safe = vec![None; usize::from(SAFE_SLOT_COUNT)];
                    self.safe_unlocked = false;
                    S::Ok
                } else {
                    S::NotAuthorized
                }
            }
            Command::FillWithRandom if storage => {
                if self.is_authenticated(PinRole::Admin) {
                    self.fill_progress = Some(0);
                    S::Ok
                } else {
                    S::NotAuthorized
                }
            }
            Command::GetProgress => {
                let percent = match self.fill_progress {
                    Some(p) => {
                        let next = p.saturating_add(FILL_STEP).min(100);
                        if next >= 100 {
                            self.fill_progress = None;
                            self.lock_volumes();
                            self.hidden = Default::default();
                            self.report.filled_with_random = true;
                            self.report.new_sd_card = false;
                        } else {
                            self.fill_progress = Some(next);
                        }
                        next
                    }
                    None => 100,
                };
                return Response::ok(Payload::Progress(percent));
            }
            Command::ClearNewSdCardFlag if storage => {
                if self.is_authenticated(PinRole::Admin) {
                    self.report.new_sd_card = false;
                    S::Ok
                } else {
                    S::NotAuthorized
                }
            }
            Command::GetOtpSlot(id) => {
                return match self.otp_slot(*id) {
                    Some(slot) => Response::ok(Payload::OtpSlot(slot.info.clone())),
                    None => Response::status(S::Failed(2)),
                }
            }
            Command::WriteOtpSlot(write) => {
                if self.is_authenticated(PinRole::Admin) {
                    let seed = write
                        .secret
                        .expose()
                        .iter()
                        .fold(0u64, |acc, b| acc.rotate_left(5) ^ u64::from(*b));
                    match self.otp_slot(write.slot) {
                        Some(slot) => {
                            *slot = SimOtpSlot {
                                info: OtpSlotInfo {
                                    slot: write.slot,
                                    programmed: true,
                                    name: write.name.clone(),
                                    digits: write.digits,
                                    interval_secs: write.interval_secs,
                                },
                                counter: write.counter,
                                seed,
                            };
                            S::Ok
                        }
                        None => S::Failed(2),
                    }
                } else {
                    S::NotAuthorized
                }
            }
            Command::EraseOtpSlot(id) => {
                if self.is_authenticated(PinRole::Admin) {
                    match self.otp_slot(*id) {
                        Some(slot) if slot.info.programmed => {
                            *slot = empty_otp_slot(*id);
                            S::Ok
                        }
                        _ => S::SlotNotProgrammed,
                    }
                } else {
                    S::NotAuthorized
                }
            }
            Command::GetOtpCode { slot, unix_time } => {
                if self.report.otp_user_pin_protected && !self.is_authenticated(PinRole::User) {
                    S::NotAuthorized
                } else {
                    let forced = self.next_code.take();
                    return match self.otp_slot(*slot) {
                        Some(s) if s.info.programmed => {
                            let factor = match unix_time {
                                Some(t) => t
                                    .checked_div(u64::from(s.info.interval_secs))
                                    .unwrap_or(0),
                                None => {
                                    let current = s.counter;
                                    s.counter = s.counter.saturating_add(1);
                                    current
                                }
                            };
                            let code = forced.unwrap_or_else(|| pseudo_code(s.seed, factor));
                            Response::ok(Payload::OtpCode(code))
                        }
                        _ => Response::status(S::SlotNotProgrammed),
                    };
                }
            }
            Command::UnlockSafe { pin } => {
                if self.report.aes_initialized {
                    let status = self.check_pin(PinRole::User, pin);
                    self.safe_unlocked = status.is_ok();
                    status
                } else {
                    S::AesNotInitialized
                }
            }
            Command::GetSafeSlotStatus if self.safe_unlocked => {
                return Response::ok(Payload::SafeSlots(
                    self.safe.iter().map(Option::is_some).collect(),
                ))
            }
            Command::ReadSafeSlot(index) if self.safe_unlocked => {
                return match self.safe.get(usize::from(*index)).cloned().flatten() {
                    Some(data) => Response::ok(Payload::SafeSlot(data)),
                    None => Response::status(S::SlotNotProgrammed),
                }
            }
            Command::WriteSafeSlot {
                slot,
                name,
                login,
                password,
            } if self.safe_unlocked => match self.safe.get_mut(usize::from(*slot)) {
                Some(entry) => {
                    *entry = Some(SafeSlotData {
                        name: name.clone(),
                        login: login.clone(),
                        password: password.clone(),
                    });
                    S::Ok
                }
                None => S::Failed(2),
            },
            Command::EraseSafeSlot(index) if self.safe_unlocked => {
                match self.safe.get_mut(usize::from(*index)) {
                    Some(entry) => {
                        *entry = None;
                        S::Ok
                    }
                    None => S::Failed(2),
                }
            }
            Command::GetSafeSlotStatus
            | Command::ReadSafeSlot(_)
            | Command::WriteSafeSlot { .. }
            | Command::EraseSafeSlot(_) => S::NotAuthorized,
            Command::LockDevice => {
                self.authenticated = [false; 3];
                self.safe_unlocked = false;
                self.lock_volumes();
                S::Ok
            }
            Command::EnterUpdateMode { password } if storage => {
                if self.report.firmware_locked {
                    S::Failed(7)
                } else {
                    let status = self.check_pin(PinRole::Firmware, password);
                    self.update_mode = status.is_ok();
                    status
                }
            }
            Command::LockFirmware if storage => {
                if self.is_authenticated(PinRole::Admin) {
                    self.report.firmware_locked = true;
                    S::Ok
                } else {
                    S::NotAuthorized
                }
            }
            Command::ReadFirmware { offset, len } if storage => {
                if !self.is_authenticated(PinRole::Admin) {
                    return Response::status(S::NotAuthorized);
                }
                let start = usize::try_from(*offset)
                    .unwrap_or(usize::MAX)
                    .min(self.firmware_image.len());
                let end = start
                    .saturating_add(usize::from(*len))
                    .min(self.firmware_image.len());
                let chunk = self.firmware_image.get(start..end).unwrap_or_default();
                return Response::ok(Payload::FirmwareChunk(chunk.to_vec()));
            }
            Command::FactoryReset { admin_pin } => {
                let status = self.check_pin(PinRole::Admin, admin_pin);
                if status.is_ok() {
                    self.factory_reset();
                }
                status
            }
            // Volume and firmware commands on a model without storage.
            _ => S::Failed(1),
        };
        Response::status(status)
    }
}

fn empty_otp_slot(id: OtpSlotId) -> SimOtpSlot {
    SimOtpSlot {
        info: OtpSlotInfo {
            slot: id,
            programmed: false,
            name: String::new(),
            digits: OtpDigits::Six,
            interval_secs: match id.kind {
                OtpKind::Hotp => 0,
                OtpKind::Totp => 30,
            },
        },
        counter: 0,
        seed: 0,
    }
}

fn pseudo_code(seed: u64, factor: u64) -> u32 {
    let mixed = seed ^ factor.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let reduced = mixed.checked_rem(100_000_000).unwrap_or(0);
    u32::try_from(reduced).unwrap_or(0)
}

fn lock(state: &Mutex<TokenState>) -> MutexGuard<'_, TokenState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a simulated token.
#[derive(Debug, Clone)]
pub struct SimulatedToken {
    state: Arc<Mutex<TokenState>>,
}

impl SimulatedToken {
    /// Storage model, firmware v0.53, factory PINs, keys generated.
    #[must_use]
    pub fn storage() -> Self {
        Self::with_model(DeviceModel::Storage, FirmwareVersion::new(0, 53))
    }

    /// Pro model, firmware v0.11.
    #[must_use]
    pub fn pro() -> Self {
        Self::with_model(DeviceModel::Pro, FirmwareVersion::new(0, 11))
    }

    /// Any model and firmware.
    #[must_use]
    pub fn with_model(model: DeviceModel, firmware: FirmwareVersion) -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState::new(model, firmware))),
        }
    }

    /// Inspect or rearrange the device state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut TokenState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Inject a failure into the next exchange. Faults queue up in order.
    pub fn push_fault(&self, fault: Fault) {
        lock(&self.state).faults.push_back(fault);
    }

    /// Every exchange so far.
    #[must_use]
    pub fn journal(&self) -> Vec<Exchange> {
        lock(&self.state).journal.clone()
    }

    /// Kinds of every command received, in order.
    #[must_use]
    pub fn received(&self) -> Vec<CommandKind> {
        lock(&self.state)
            .journal
            .iter()
            .filter_map(|e| match e {
                Exchange::Begin(kind) => Some(*kind),
                Exchange::End(_) => None,
            })
            .collect()
    }

    /// Forget the journal.
    pub fn clear_journal(&self) {
        lock(&self.state).journal.clear();
    }

    /// Bootloader finished; the token answers again.
    pub fn finish_update(&self) {
        let mut state = lock(&self.state);
        state.update_mode = false;
        state.authenticated = [false; 3];
        state.lock_volumes();
    }
}

impl Transport for SimulatedToken {
    fn send(&mut self, command: &Command) -> Result<Response, TransportError> {
        let kind = command.kind();
        let fault = {
            let mut state = lock(&self.state);
            state.journal.push(Exchange::Begin(kind));
            state.faults.pop_front()
        };
        let result = match fault {
            Some(Fault::Timeout) => Err(TransportError::Timeout),
            Some(Fault::Io(msg)) => Err(TransportError::Io(msg)),
            Some(Fault::Status(status)) => Ok(Response::status(status)),
            Some(Fault::Hold(release)) => {
                let _ = release.recv();
                self.answer(command)
            }
            None => self.answer(command),
        };
        lock(&self.state).journal.push(Exchange::End(kind));
        result
    }
}

impl SimulatedToken {
    fn answer(&self, command: &Command) -> Result<Response, TransportError> {
        let mut state = lock(&self.state);
        if state.update_mode {
            return Err(TransportError::Io("token is in bootloader mode".into()));
        }
        Ok(state.execute(command))
    }
}

/// Host clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: AtomicU64,
}

impl FixedClock {
    /// Clock reading `now`.
    #[must_use]
    pub const fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(SIMULATED_EPOCH)
    }
}

impl Clock for FixedClock {
    fn now_unix(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

//! Serialized command dispatch and the connection lifecycle.
//!
//! A single dispatcher thread owns the [`Transport`]. Callers enqueue
//! commands from any thread; the dispatcher sends them strictly one at a
//! time in submission order and hands each outcome back over a channel.
//!
//! Detaching the token cancels the in-flight command and everything
//! queued behind it. A response that arrives for a cancelled command is
//! discarded. Fatal transport failures tear the session down the same
//! way.
//!
//! Lock discipline: `line` and `device` are never held at the same time,
//! and neither is held while waiting for the token.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use keyward_proto::{
    Command, CommandKind, CommandStatus, OtpSlotInfo, Payload, PinRole, Response, StatusReport,
    MAX_RETRIES,
};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::{DeviceError, FailureClass, KeywardError, StateError, TerminalMode};
use crate::options::Options;
use crate::state::{all_otp_slots, DeviceSession, DeviceStatus, TimeSync, VolumeState};
use crate::transport::{Clock, SystemClock, Transport, TransportError};

// ── Public types ───────────────────────────────────────────────────

/// Caller acknowledgement for destructive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The user confirmed.
    Acknowledged,
    /// The user declined, or was never asked.
    Withheld,
}

impl Confirmation {
    /// # Errors
    ///
    /// [`StateError::ConfirmationRequired`] unless acknowledged.
    pub const fn require(self) -> Result<(), StateError> {
        match self {
            Self::Acknowledged => Ok(()),
            Self::Withheld => Err(StateError::ConfirmationRequired),
        }
    }
}

impl From<bool> for Confirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            Self::Acknowledged
        } else {
            Self::Withheld
        }
    }
}

/// Link state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    /// No token attached.
    Disconnected,
    /// Connection handshake running.
    Connecting,
    /// Idle and ready.
    Connected,
    /// A command is on the wire.
    CommandInFlight,
    /// Update mode or factory reset; only a reconnect leaves this state.
    Terminal(TerminalMode),
}

/// Result of one exchange as delivered to the submitter.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The token answered. The status may still be a failure.
    Success(Response),
    /// Transport or protocol failure.
    Failure(DeviceError),
    /// No answer before the transport deadline.
    Timeout,
    /// Detached before the command completed.
    Cancelled,
}

/// Handle to a queued command.
#[derive(Debug)]
pub struct PendingCommand {
    kind: CommandKind,
    reply: Receiver<DispatchOutcome>,
}

impl PendingCommand {
    /// Tag of the queued command.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Block until the command completes or is cancelled.
    #[must_use]
    pub fn wait(self) -> DispatchOutcome {
        self.reply.recv().unwrap_or(DispatchOutcome::Cancelled)
    }
}

/// Point-in-time view of the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Link state.
    pub link: LinkState,
    /// Token state, present while connected.
    pub device: Option<DeviceStatus>,
}

// ── Dispatcher internals ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connecting,
    Connected,
    Terminal(TerminalMode),
}

struct Ticket {
    id: u64,
    command: Command,
    reply: Sender<DispatchOutcome>,
}

struct InFlight {
    id: u64,
    reply: Sender<DispatchOutcome>,
}

struct Line {
    link: Link,
    pending: VecDeque<Ticket>,
    in_flight: Option<InFlight>,
    next_id: u64,
    shutdown: bool,
}

impl Line {
    /// Cancel the in-flight command and drain the queue.
    fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0usize;
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.reply.send(DispatchOutcome::Cancelled);
            cancelled = cancelled.saturating_add(1);
        }
        for ticket in self.pending.drain(..) {
            let _ = ticket.reply.send(DispatchOutcome::Cancelled);
            cancelled = cancelled.saturating_add(1);
        }
        cancelled
    }
}

struct Shared {
    line: Mutex<Line>,
    wake: Condvar,
    device: Mutex<Option<DeviceSession>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_ticket(shared: &Shared) -> Option<(u64, Command)> {
    let mut line = lock(&shared.line);
    loop {
        if line.shutdown {
            return None;
        }
        if let Some(ticket) = line.pending.pop_front() {
            line.in_flight = Some(InFlight {
                id: ticket.id,
                reply: ticket.reply,
            });
            return Some((ticket.id, ticket.command));
        }
        line = shared
            .wake
            .wait(line)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

fn classify(result: Result<Response, TransportError>) -> DispatchOutcome {
    match result {
        Ok(response) => match response.status {
            CommandStatus::Unexpected(code) => {
                DispatchOutcome::Failure(DeviceError::UnexpectedStatus(code))
            }
            _ => DispatchOutcome::Success(response),
        },
        Err(TransportError::Timeout) => DispatchOutcome::Timeout,
        Err(TransportError::Io(msg)) => DispatchOutcome::Failure(DeviceError::Io(msg)),
    }
}

fn run_dispatcher(shared: &Shared, mut transport: Box<dyn Transport>, delay: Duration) {
    while let Some((id, command)) = next_ticket(shared) {
        let kind = command.kind();
        trace!(?kind, id, "exchange");
        let outcome = classify(transport.send(&command));
        drop(command);

        let fatal = matches!(&outcome, DispatchOutcome::Failure(e) if e.class() == FailureClass::Fatal);
        let mut line = lock(&shared.line);
        let owner = match line.in_flight.take() {
            Some(flight) if flight.id == id => Some(flight),
            other => {
                line.in_flight = other;
                None
            }
        };
        if fatal && owner.is_some() {
            line.link = Link::Disconnected;
            line.cancel_all();
        }
        drop(line);

        match owner {
            Some(flight) => {
                if fatal {
                    warn!(?kind, "fatal transport failure, session torn down");
                    lock(&shared.device).take();
                }
                let _ = flight.reply.send(outcome);
            }
            None => debug!(?kind, "response discarded, command was cancelled"),
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
    debug!("dispatcher stopped");
}

// ── Session manager ────────────────────────────────────────────────

/// Owns the link to one token and everything known about it.
pub struct SessionManager {
    shared: Arc<Shared>,
    options: Options,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("link", &self.link_state())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Start a session manager over `transport` using the system clock.
    ///
    /// # Errors
    ///
    /// [`KeywardError::Validation`] for invalid options,
    /// [`KeywardError::Io`] if the dispatcher thread cannot be spawned.
    pub fn new<T: Transport + 'static>(transport: T, options: Options) -> Result<Self, KeywardError> {
        Self::with_clock(transport, options, Arc::new(SystemClock))
    }

    /// Like [`Self::new`] with an explicit host clock.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_clock<T: Transport + 'static>(
        transport: T,
        options: Options,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeywardError> {
        options.validate()?;
        let shared = Arc::new(Shared {
            line: Mutex::new(Line {
                link: Link::Disconnected,
                pending: VecDeque::new(),
                in_flight: None,
                next_id: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            device: Mutex::new(None),
        });

        let worker = Arc::clone(&shared);
        let transport: Box<dyn Transport> = Box::new(transport);
        let delay = options.command_delay();
        thread::Builder::new()
            .name("keyward-dispatch".into())
            .spawn(move || run_dispatcher(&worker, transport, delay))?;

        Ok(Self {
            shared,
            options,
            clock,
            generation: AtomicU64::new(1),
        })
    }

    /// Options in force.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn now_unix(&self) -> u64 {
        self.clock.now_unix()
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Queue `command` behind everything already submitted.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Disconnected`] without sending when no token is
    /// attached, [`StateError::Terminal`] after update mode or reset.
    pub fn submit(&self, command: Command) -> Result<PendingCommand, KeywardError> {
        let kind = command.kind();
        let (reply, receiver) = mpsc::channel();
        let mut line = lock(&self.shared.line);
        match line.link {
            Link::Disconnected => return Err(DeviceError::Disconnected.into()),
            Link::Terminal(mode) => return Err(StateError::Terminal(mode).into()),
            Link::Connecting | Link::Connected => {}
        }
        let id = line.next_id;
        line.next_id = id.wrapping_add(1);
        line.pending.push_back(Ticket { id, command, reply });
        drop(line);
        self.shared.wake.notify_all();
        debug!(?kind, id, "queued");
        Ok(PendingCommand {
            kind,
            reply: receiver,
        })
    }

    /// Submit `command` and wait for its response.
    ///
    /// # Errors
    ///
    /// Everything [`Self::submit`] returns, plus
    /// [`DeviceError::CommunicationTimeout`], fatal [`DeviceError`]s and
    /// [`KeywardError::Cancelled`].
    pub fn dispatch(&self, command: Command) -> Result<Response, KeywardError> {
        match self.submit(command)?.wait() {
            DispatchOutcome::Success(response) => Ok(response),
            DispatchOutcome::Failure(err) => Err(err.into()),
            DispatchOutcome::Timeout => Err(DeviceError::CommunicationTimeout.into()),
            DispatchOutcome::Cancelled => Err(KeywardError::Cancelled),
        }
    }

    /// Dispatch and require [`CommandStatus::Ok`].
    pub(crate) fn request(&self, command: Command) -> Result<Payload, KeywardError> {
        let response = self.dispatch(command)?;
        if !response.status.is_ok() {
            return Err(DeviceError::StatusCode(response.status.code()).into());
        }
        Ok(response.payload)
    }

    /// The token answered with a payload that does not fit the command.
    pub(crate) fn protocol_violation(&self, what: &'static str) -> KeywardError {
        warn!(what, "unexpected response payload, session torn down");
        self.tear_down(Link::Disconnected);
        DeviceError::UnexpectedResponse(what).into()
    }

    /// Run `f` against the connected token's state.
    pub(crate) fn with_device<R>(
        &self,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Result<R, KeywardError> {
        let mut device = lock(&self.shared.device);
        if let Some(session) = device.as_mut() {
            return Ok(f(session));
        }
        drop(device);
        Err(self.unavailable())
    }

    fn unavailable(&self) -> KeywardError {
        match lock(&self.shared.line).link {
            Link::Terminal(mode) => StateError::Terminal(mode).into(),
            _ => DeviceError::Disconnected.into(),
        }
    }

    fn tear_down(&self, link: Link) -> usize {
        let cancelled = {
            let mut line = lock(&self.shared.line);
            line.link = link;
            line.cancel_all()
        };
        self.shared.wake.notify_all();
        lock(&self.shared.device).take();
        cancelled
    }

    pub(crate) fn enter_terminal(&self, mode: TerminalMode) {
        self.tear_down(Link::Terminal(mode));
        info!(?mode, "session is terminal");
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Handshake with a newly attached token.
    ///
    /// Reads status, retry counters, clock and OTP slot metadata. A clock
    /// skew beyond `time_skew_tolerance_secs` is recorded, not refused;
    /// TOTP generation checks it.
    ///
    /// # Errors
    ///
    /// [`StateError::PreconditionNotMet`] when already connected, any
    /// dispatch error, or a fatal [`DeviceError`] for malformed answers.
    pub fn connect(&self) -> Result<DeviceStatus, KeywardError> {
        {
            let mut line = lock(&self.shared.line);
            match line.link {
                Link::Connecting | Link::Connected => {
                    return Err(KeywardError::precondition("token already connected"))
                }
                Link::Disconnected | Link::Terminal(_) => line.link = Link::Connecting,
            }
        }

        let session = match self.handshake() {
            Ok(session) => session,
            Err(err) => {
                let mut line = lock(&self.shared.line);
                if line.link == Link::Connecting {
                    line.link = Link::Disconnected;
                }
                return Err(err);
            }
        };
        let status = session.status();
        *lock(&self.shared.device) = Some(session);

        let connected = {
            let mut line = lock(&self.shared.line);
            let ok = line.link == Link::Connecting;
            if ok {
                line.link = Link::Connected;
            }
            ok
        };
        if !connected {
            lock(&self.shared.device).take();
            return Err(DeviceError::Disconnected.into());
        }

        info!(
            model = status.model.as_str(),
            firmware = %status.firmware,
            serial = %status.serial,
            "token connected"
        );
        if status.time.out_of_sync {
            warn!(skew_secs = status.time.skew_secs, "token clock out of sync");
        }
        Ok(status)
    }

    fn handshake(&self) -> Result<DeviceSession, KeywardError> {
        let report = self.read_status()?;
        let counters = self.read_counters()?;
        let time = self.measure_time()?;
        let mut otp: Vec<OtpSlotInfo> = Vec::new();
        for id in all_otp_slots() {
            match self.request(Command::GetOtpSlot(id))? {
                Payload::OtpSlot(info) if info.slot == id => otp.push(info),
                _ => return Err(self.protocol_violation("GetOtpSlot")),
            }
        }
        let id = self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceSession::new(id, report, counters, time, otp))
    }

    fn read_status(&self) -> Result<StatusReport, KeywardError> {
        match self.request(Command::GetStatus)? {
            Payload::Status(report) => Ok(*report),
            _ => Err(self.protocol_violation("GetStatus")),
        }
    }

    fn read_counters(&self) -> Result<[u8; 3], KeywardError> {
        let mut counters = [MAX_RETRIES; 3];
        for role in PinRole::ALL {
            counters[role.index()] = match self.request(Command::GetRetryCount(role))? {
                Payload::RetryCount(n) => n,
                _ => return Err(self.protocol_violation("GetRetryCount")),
            };
        }
        Ok(counters)
    }

    fn measure_time(&self) -> Result<TimeSync, KeywardError> {
        let device_time = match self.request(Command::GetTime)? {
            Payload::Time(t) => t,
            _ => return Err(self.protocol_violation("GetTime")),
        };
        Ok(TimeSync::measure(
            device_time,
            self.now_unix(),
            self.options.time_skew_tolerance_secs,
        ))
    }

    /// Token removed. Cancels the in-flight command and the queue, then
    /// drops all session state, scrubbing cached secrets.
    pub fn detach(&self) {
        let cancelled = self.tear_down(Link::Disconnected);
        info!(cancelled, "token detached");
    }

    /// Current link state.
    #[must_use]
    pub fn link_state(&self) -> LinkState {
        let line = lock(&self.shared.line);
        match line.link {
            Link::Disconnected => LinkState::Disconnected,
            Link::Connecting => LinkState::Connecting,
            Link::Connected if line.in_flight.is_some() => LinkState::CommandInFlight,
            Link::Connected => LinkState::Connected,
            Link::Terminal(mode) => LinkState::Terminal(mode),
        }
    }

    /// Non-secret status of the connected token; sends nothing.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Disconnected`], or [`StateError::Terminal`].
    pub fn status(&self) -> Result<DeviceStatus, KeywardError> {
        self.with_device(|d| d.status())
    }

    /// Cached view of the session; sends nothing.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let link = self.link_state();
        let device = lock(&self.shared.device).as_ref().map(DeviceSession::status);
        SessionSnapshot { link, device }
    }

    /// Re-read status flags and retry counters from the token.
    ///
    /// A volume the token reports as locked is locked here too, even when
    /// this session unlocked it.
    ///
    /// # Errors
    ///
    /// Dispatch errors, or [`DeviceError::Disconnected`].
    pub fn refresh_status(&self) -> Result<DeviceStatus, KeywardError> {
        let report = self.read_status()?;
        let counters = self.read_counters()?;
        self.with_device(|d| {
            d.report.aes_initialized = report.aes_initialized;
            d.report.otp_user_pin_protected = report.otp_user_pin_protected;
            d.report.firmware_locked = report.firmware_locked;
            d.report.new_sd_card = report.new_sd_card;
            d.report.filled_with_random = report.filled_with_random;
            d.report.unencrypted_mode = report.unencrypted_mode;
            if report.encrypted_volume_active {
                d.protected.encrypted = VolumeState::Enabled;
                d.report.encrypted_volume_active = true;
                if report.hidden_volume_active {
                    d.report.hidden_volume_active = true;
                } else {
                    d.lock_hidden_volumes();
                }
            } else {
                d.lock_encrypted_volume();
            }
            for role in PinRole::ALL {
                d.auth.sync_counter(role, counters[role.index()]);
            }
            d.status()
        })
    }

    // ── Clock ──────────────────────────────────────────────────────

    /// Compare the token clock with the host clock again.
    ///
    /// # Errors
    ///
    /// Dispatch errors.
    pub fn check_time(&self) -> Result<TimeSync, KeywardError> {
        let time = self.measure_time()?;
        self.with_device(|d| d.time = time)?;
        if time.out_of_sync {
            warn!(skew_secs = time.skew_secs, "token clock out of sync");
        }
        Ok(time)
    }

    /// Overwrite the token clock with the host clock.
    ///
    /// # Errors
    ///
    /// [`StateError::ConfirmationRequired`] or dispatch errors.
    pub fn resync_time(&self, confirmation: Confirmation) -> Result<(), KeywardError> {
        confirmation.require()?;
        self.request(Command::SetTime(self.now_unix()))?;
        self.with_device(|d| d.time = TimeSync::in_sync())?;
        info!("token clock reset to host time");
        Ok(())
    }

    // ── Device ─────────────────────────────────────────────────────

    /// Lock volumes and the safe and forget every authentication.
    ///
    /// # Errors
    ///
    /// Dispatch errors.
    pub fn lock_device(&self) -> Result<(), KeywardError> {
        self.request(Command::LockDevice)?;
        self.with_device(DeviceSession::apply_lock)?;
        info!("token locked");
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        {
            let mut line = lock(&self.shared.line);
            line.shutdown = true;
            line.cancel_all();
        }
        self.shared.wake.notify_all();
        lock(&self.shared.device).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_from_bool() {
        assert!(Confirmation::from(true).require().is_ok());
        assert_eq!(
            Confirmation::from(false).require(),
            Err(StateError::ConfirmationRequired)
        );
    }

    #[test]
    fn unexpected_status_is_fatal() {
        let outcome = classify(Ok(Response::status(CommandStatus::Unexpected(0xEE))));
        assert!(matches!(
            outcome,
            DispatchOutcome::Failure(DeviceError::UnexpectedStatus(0xEE))
        ));
        assert!(matches!(
            classify(Err(TransportError::Timeout)),
            DispatchOutcome::Timeout
        ));
    }

    #[test]
    fn cancel_all_answers_every_waiter() {
        let mut line = Line {
            link: Link::Connected,
            pending: VecDeque::new(),
            in_flight: None,
            next_id: 0,
            shutdown: false,
        };
        let (tx, rx) = mpsc::channel();
        line.in_flight = Some(InFlight { id: 0, reply: tx });
        let (tx2, rx2) = mpsc::channel();
        line.pending.push_back(Ticket {
            id: 1,
            command: Command::GetStatus,
            reply: tx2,
        });
        assert_eq!(line.cancel_all(), 2);
        assert!(matches!(rx.recv().unwrap(), DispatchOutcome::Cancelled));
        assert!(matches!(rx2.recv().unwrap(), DispatchOutcome::Cancelled));
    }
}

//! # Bus Session
//!
//! The session owns the single live bus connection. Its connect loop
//! ([`BusSession::run`]) reconnects with bounded exponential backoff whenever
//! the connection fails, so the rest of the bridge never sees a disconnect as
//! anything but a pause:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (I/O error) -> Reconnecting
//!                     ^                                         |
//!                     +-----------------------------------------+
//! any state -> Closed (after close())
//! ```
//!
//! Inbound telegrams flow through one bounded channel that outlives individual
//! connections. Active reads are queued to the connect loop and answered
//! through per-address waiters.

use crate::constants::{
    DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_TELEGRAM_BUFFER,
};
use crate::error::BridgeError;
use crate::knx::address::GroupAddress;
use crate::knx::telegram::{Telegram, TelegramKind};
use crate::knx::transport::{BusConnection, BusTransport};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Timing and buffering of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "crate::config::duration")]
    pub initial_backoff: Duration,
    #[serde(with = "crate::config::duration")]
    pub max_backoff: Duration,
    #[serde(with = "crate::config::duration")]
    pub request_timeout: Duration,
    pub telegram_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            telegram_buffer: DEFAULT_TELEGRAM_BUFFER,
        }
    }
}

/// Exponential reconnect delay, doubled per failure and capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Resolves once the shutdown flag is set.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // The sender lives as long as the session, so an error only means it is gone.
    let _ = shutdown.wait_for(|closed| *closed).await.map(|_| ());
}

type Waiters = HashMap<GroupAddress, Vec<oneshot::Sender<Vec<u8>>>>;

/// Drops reads queued for a connection that no longer exists.
fn discard_queued(requests: &mut mpsc::UnboundedReceiver<GroupAddress>) {
    let mut dropped = 0;
    while requests.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("Discarded {dropped} queued reads");
    }
}

/// Marks the connect loop as gone when `run` returns or its future is dropped.
struct LoopGuard<'a> {
    session: &'a BusSession,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        let session = self.session;
        // Cleared before the state changes: close() re-checks it on every change.
        session.running.store(false, Ordering::SeqCst);
        session.fail_pending();
        if session.state() != SessionState::Closed {
            if session.is_shutting_down() {
                session.set_state(SessionState::Closed);
            } else {
                session.set_state(SessionState::Disconnected);
            }
        }
    }
}

/// Handle onto the session's inbound telegram sequence.
///
/// Every handle reads from the same queue, so a consumer that drops its handle
/// and asks for a new one resumes where the previous one stopped. The sequence
/// pauses while the bus is disconnected and ends only after the session closes.
#[derive(Clone)]
pub struct TelegramStream {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Telegram>>>,
}

impl TelegramStream {
    /// Waits for the next telegram; `None` once the session is closed.
    pub async fn next(&mut self) -> Option<Telegram> {
        self.rx.lock().await.recv().await
    }
}

/// Owner of the bus connection.
pub struct BusSession {
    transport: Arc<dyn BusTransport>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    telegram_tx: Mutex<Option<mpsc::Sender<Telegram>>>,
    telegram_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Telegram>>>,
    request_tx: mpsc::UnboundedSender<GroupAddress>,
    request_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupAddress>>,
    pending: Mutex<Waiters>,
    running: AtomicBool,
}

impl BusSession {
    pub fn new(transport: Arc<dyn BusTransport>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (telegram_tx, telegram_rx) = mpsc::channel(config.telegram_buffer.max(1));
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        BusSession {
            transport,
            config,
            state_tx,
            shutdown_tx,
            telegram_tx: Mutex::new(Some(telegram_tx)),
            telegram_rx: Arc::new(tokio::sync::Mutex::new(telegram_rx)),
            request_tx,
            request_rx: tokio::sync::Mutex::new(request_rx),
            pending: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Bus session {previous:?} -> {state:?}");
        }
    }

    /// Returns a handle onto the inbound telegram sequence.
    pub fn telegrams(&self) -> TelegramStream {
        TelegramStream {
            rx: self.telegram_rx.clone(),
        }
    }

    /// Runs the connect loop until [`BusSession::close`] is called.
    ///
    /// Connection failures are retried after the backoff delay and never end
    /// the loop. If the returned future is dropped early the session falls back
    /// to `Disconnected` and the loop may be started again.
    pub async fn run(&self) -> Result<(), BridgeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Bus session connect loop is already running");
            return Ok(());
        }
        let _guard = LoopGuard { session: self };
        let telegram_tx = self.telegram_tx.lock().ok().and_then(|tx| tx.clone());
        let Some(telegram_tx) = telegram_tx else {
            self.set_state(SessionState::Closed);
            return Ok(());
        };

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut requests = self.request_rx.lock().await;
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let endpoint = self.transport.describe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(SessionState::Connecting);
            let attempt = tokio::select! {
                attempt = self.transport.connect() => attempt,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match attempt {
                Ok(mut conn) => {
                    info!("Connected to bus at {endpoint}");
                    backoff.reset();
                    discard_queued(&mut requests);
                    self.set_state(SessionState::Connected);
                    let outcome = self
                        .serve(conn.as_mut(), &telegram_tx, &mut requests, &mut shutdown)
                        .await;
                    // Leave Connected before failing the waiters so no new
                    // request can register against the dead connection.
                    if outcome.is_err() {
                        self.set_state(SessionState::Reconnecting);
                    }
                    self.fail_pending();
                    discard_queued(&mut requests);
                    if let Err(e) = conn.close().await {
                        debug!("Closing bus connection failed: {e}");
                    }
                    match outcome {
                        Ok(()) => break,
                        Err(e) => warn!("Bus connection to {endpoint} lost: {e}"),
                    }
                }
                Err(e) => warn!("Connecting to {endpoint} failed: {e}"),
            }

            self.set_state(SessionState::Reconnecting);
            let delay = backoff.next_delay();
            info!("Reconnecting to {endpoint} in {delay:?}");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.fail_pending();
        self.set_state(SessionState::Closed);
        info!("Bus session closed");
        Ok(())
    }

    /// Pumps one connection. `Ok` means shutdown was requested, `Err` that the
    /// connection failed.
    async fn serve(
        &self,
        conn: &mut dyn BusConnection,
        telegram_tx: &mpsc::Sender<Telegram>,
        requests: &mut mpsc::UnboundedReceiver<GroupAddress>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => return Ok(()),
                Some(address) = requests.recv() => {
                    trace!("Sending GroupValueRead to {address}");
                    conn.send_read(address).await?;
                }
                received = conn.recv() => {
                    let telegram = received?;
                    let Some(telegram) = self.route_response(telegram) else {
                        continue;
                    };
                    tokio::select! {
                        sent = telegram_tx.send(telegram) => {
                            if sent.is_err() {
                                // Receiver lives in self; only reachable while dropping.
                                return Ok(());
                            }
                        }
                        _ = shutdown_requested(shutdown) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Hands responses to waiting requests. Returns the telegram if it still
    /// has to go to the inbound sequence.
    fn route_response(&self, telegram: Telegram) -> Option<Telegram> {
        match telegram.kind {
            TelegramKind::Read => {
                trace!("Ignoring GroupValueRead for {}", telegram.destination);
                None
            }
            TelegramKind::Response => {
                let waiters = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&telegram.destination));
                match waiters {
                    Some(waiters) => {
                        for waiter in waiters {
                            let _ = waiter.send(telegram.payload.clone());
                        }
                        None
                    }
                    None => Some(telegram),
                }
            }
            TelegramKind::Write => Some(telegram),
        }
    }

    /// Drops every waiter, failing their requests.
    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    /// Reads the current value bytes of `address` from the bus.
    ///
    /// Fails with `SessionUnavailable` if the bus is not connected right now,
    /// `RequestTimeout` if nobody answers in time and `SessionClosed` once the
    /// session is closed.
    pub async fn request(&self, address: GroupAddress) -> Result<Vec<u8>, BridgeError> {
        match self.state() {
            SessionState::Connected => {}
            SessionState::Closed => return Err(BridgeError::SessionClosed),
            _ => return Err(BridgeError::SessionUnavailable),
        }
        if self.is_shutting_down() {
            return Err(BridgeError::SessionClosed);
        }

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.entry(address).or_default().push(tx);
        }
        // The connection may have ended between the check above and the
        // insert, after its waiters were failed.
        let gone = if self.is_shutting_down() {
            Some(BridgeError::SessionClosed)
        } else if self.state() != SessionState::Connected {
            Some(BridgeError::SessionUnavailable)
        } else {
            None
        };
        if let Some(e) = gone {
            drop(rx);
            self.prune_waiters(address);
            return Err(e);
        }
        if self.request_tx.send(address).is_err() {
            return Err(BridgeError::SessionClosed);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) if self.is_shutting_down() => Err(BridgeError::SessionClosed),
            Ok(Err(_)) => Err(BridgeError::SessionUnavailable),
            Err(_) => {
                self.prune_waiters(address);
                Err(BridgeError::RequestTimeout(address.to_string()))
            }
        }
    }

    /// Removes waiters of `address` whose requester has gone away.
    fn prune_waiters(&self, address: GroupAddress) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(waiters) = pending.get_mut(&address) {
                waiters.retain(|waiter| !waiter.is_closed());
                if waiters.is_empty() {
                    pending.remove(&address);
                }
            }
        }
    }

    /// Closes the session: in-flight requests fail with `SessionClosed`, the
    /// telegram sequence ends, and the call returns once the connect loop has
    /// exited or if none is running. Calling it again is a no-op.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);
        if let Ok(mut telegram_tx) = self.telegram_tx.lock() {
            telegram_tx.take();
        }
        if self.running.load(Ordering::SeqCst) {
            let mut state = self.state_tx.subscribe();
            let exited = state
                .wait_for(|s| *s == SessionState::Closed || !self.running.load(Ordering::SeqCst))
                .await;
            if exited.is_err() {
                warn!("Bus session dropped before reaching Closed");
            }
        }
        self.fail_pending();
        self.set_state(SessionState::Closed);
    }
}

//! # Poller
//!
//! Background tasks feeding the value cache:
//!
//! - dispatch: drains the session's telegram stream into
//!   [`MetricsBridge::on_telegram`]
//! - poll: on every `poll_interval` tick, refreshes the stale flags of all
//!   cached values and reads each `read_active` address whose value is missing
//!   or older than its `max_age`
//! - startup: reads each `read_startup` address once after the first connect,
//!   spaced by `read_startup_interval`
//!
//! All tasks stop on a shared shutdown flag; [`Poller::stop`] waits for them.

use crate::bridge::MetricsBridge;
use crate::error::BridgeError;
use crate::knx::address::GroupAddress;
use crate::knx::session::SessionState;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Resolves once the shutdown flag is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await.map(|_| ());
}

/// Resolves with `true` once the session is connected, `false` if it went away.
async fn connected(state: &mut watch::Receiver<SessionState>) -> bool {
    state
        .wait_for(|s| *s == SessionState::Connected)
        .await
        .is_ok()
}

/// Owner of the dispatch, poll and startup tasks of one bridge.
pub struct Poller {
    bridge: Arc<MetricsBridge>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<JoinSet<()>>>,
    started: AtomicBool,
}

impl Poller {
    pub fn new(bridge: Arc<MetricsBridge>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Poller {
            bridge,
            shutdown_tx,
            tasks: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the background tasks. Must be called inside a tokio runtime;
    /// further calls are ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Poller already started");
            return;
        }
        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch(self.bridge.clone(), self.shutdown_tx.subscribe()));
        // Runs without poll targets too: it also keeps the stale flags current.
        tasks.spawn(poll(self.bridge.clone(), self.shutdown_tx.subscribe()));
        if self.bridge.mapping().startup_targets().next().is_some() {
            tasks.spawn(startup_reads(
                self.bridge.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }
        info!(
            "Poller started: {} addresses polled every {:?}",
            self.bridge.mapping().poll_targets().count(),
            self.bridge.config().poll_interval
        );
        if let Ok(mut slot) = self.tasks.lock() {
            *slot = Some(tasks);
        }
    }

    /// Signals shutdown and waits for every task, including in-flight reads.
    /// After it returns the poller writes nothing more into the cache.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = self.tasks.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut tasks) = tasks else {
            return;
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!("Poller task panicked: {e}");
                }
            }
        }
        debug!("Poller stopped");
    }
}

async fn dispatch(bridge: Arc<MetricsBridge>, mut shutdown: watch::Receiver<bool>) {
    let mut telegrams = bridge.telegrams();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            next = telegrams.next() => match next {
                Some(telegram) => bridge.on_telegram(telegram),
                None => {
                    debug!("Telegram stream ended");
                    break;
                }
            },
        }
    }
}

type InFlightSet = Arc<Mutex<HashSet<GroupAddress>>>;

/// Claim on an address being read. Released on drop, so a read that panics or
/// is aborted does not keep its address out of later ticks.
struct InFlight {
    address: GroupAddress,
    set: InFlightSet,
}

impl InFlight {
    /// `None` if a read of `address` is already running.
    fn claim(set: &InFlightSet, address: GroupAddress) -> Option<Self> {
        let mut reading = set.lock().unwrap_or_else(|e| e.into_inner());
        reading.insert(address).then(|| InFlight {
            address,
            set: set.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.address);
    }
}

async fn poll(bridge: Arc<MetricsBridge>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(bridge.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reads: JoinSet<()> = JoinSet::new();
    let in_flight = InFlightSet::default();

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                let stale = bridge.refresh_staleness();
                if stale > 0 {
                    debug!("{stale} cached values are stale");
                }
                let now = SystemTime::now();
                for descriptor in bridge.mapping().poll_targets() {
                    let address = descriptor.address;
                    if !bridge.needs_read(descriptor, now) {
                        continue;
                    }
                    let Some(claim) = InFlight::claim(&in_flight, address) else {
                        continue;
                    };
                    let bridge = bridge.clone();
                    reads.spawn(async move {
                        let _claim = claim;
                        read(&bridge, address).await;
                    });
                }
            }
            Some(done) = reads.join_next(), if !reads.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!("Read task panicked: {e}");
                    }
                }
            }
        }
    }

    reads.abort_all();
    while reads.join_next().await.is_some() {}
}

async fn startup_reads(bridge: Arc<MetricsBridge>, mut shutdown: watch::Receiver<bool>) {
    let mut state = bridge.session().subscribe_state();
    tokio::select! {
        _ = stopped(&mut shutdown) => return,
        connected = connected(&mut state) => {
            if !connected {
                return;
            }
        }
    }

    let spacing = bridge.config().read_startup_interval;
    let targets: Vec<GroupAddress> = bridge
        .mapping()
        .startup_targets()
        .map(|d| d.address)
        .collect();
    info!("Reading {} addresses at startup", targets.len());
    for (i, address) in targets.into_iter().enumerate() {
        if i > 0 {
            tokio::select! {
                _ = stopped(&mut shutdown) => return,
                _ = sleep(spacing) => {}
            }
        }
        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            _ = read(&bridge, address) => {}
        }
    }
}

/// One active read. Failures are logged; the cached value stays as it was.
async fn read(bridge: &MetricsBridge, address: GroupAddress) {
    match bridge.read_now(address).await {
        Ok(()) => {}
        Err(BridgeError::SessionUnavailable) | Err(BridgeError::SessionClosed) => {
            debug!("Skipping read of {address}: bus not connected");
        }
        Err(e) => bridge.warn_throttled(address, format_args!("Reading {address} failed: {e}")),
    }
}

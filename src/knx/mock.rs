//! Mock bus transport for testing
//!
//! This module provides an in-memory transport that can be used to test the
//! session, bridge and poller without a KNX installation. Clones share state, so
//! a test keeps one clone as the "bus side" control handle while the session
//! owns the other.

use crate::error::BridgeError;
use crate::knx::address::GroupAddress;
use crate::knx::telegram::Telegram;
use crate::knx::transport::{BusConnection, BusTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Inbound = mpsc::UnboundedSender<Result<Telegram, BridgeError>>;

#[derive(Default)]
struct MockBusState {
    offline: AtomicBool,
    connects: AtomicUsize,
    current: Mutex<Option<Inbound>>,
    reads: Mutex<Vec<GroupAddress>>,
    responses: Mutex<HashMap<GroupAddress, Vec<u8>>>,
    response_delay: Mutex<Duration>,
}

/// Simulated bus shared between a test and the session under test.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockBusState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every connection attempt fails.
    pub fn set_online(&self, online: bool) {
        self.state.offline.store(!online, Ordering::SeqCst);
    }

    /// Number of successful connections so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// True while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state
            .current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Delivers a telegram on the open connection. Returns false if there is none.
    pub fn inject(&self, telegram: Telegram) -> bool {
        match self.state.current.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Ok(telegram)).is_ok(),
            None => false,
        }
    }

    /// Breaks the open connection with an I/O error.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.current.lock().unwrap().take() {
            let _ = tx.send(Err(BridgeError::Transport("mock link lost".into())));
        }
    }

    /// Answers future reads of `address` with `payload`.
    pub fn set_response(&self, address: GroupAddress, payload: Vec<u8>) {
        self.state.responses.lock().unwrap().insert(address, payload);
    }

    /// Stops answering reads of `address`.
    pub fn clear_response(&self, address: GroupAddress) {
        self.state.responses.lock().unwrap().remove(&address);
    }

    /// Delay before read responses are delivered.
    pub fn set_response_delay(&self, delay: Duration) {
        *self.state.response_delay.lock().unwrap() = delay;
    }

    /// Addresses read so far, in order.
    pub fn reads(&self) -> Vec<GroupAddress> {
        self.state.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, BridgeError> {
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("mock bus offline".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.current.lock().unwrap() = Some(tx.clone());
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            tx,
            rx,
        }))
    }

    fn describe(&self) -> String {
        "mock://bus".to_string()
    }
}

struct MockConnection {
    state: Arc<MockBusState>,
    tx: Inbound,
    rx: mpsc::UnboundedReceiver<Result<Telegram, BridgeError>>,
}

#[async_trait]
impl BusConnection for MockConnection {
    async fn send_read(&mut self, address: GroupAddress) -> Result<(), BridgeError> {
        self.state.reads.lock().unwrap().push(address);
        let payload = self.state.responses.lock().unwrap().get(&address).cloned();
        if let Some(payload) = payload {
            let delay = *self.state.response_delay.lock().unwrap();
            let tx = self.tx.clone();
            let telegram = Telegram::response(address, payload);
            if delay.is_zero() {
                let _ = tx.send(Ok(telegram));
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Ok(telegram));
                });
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Telegram, BridgeError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(BridgeError::Transport("mock connection closed".into())),
        }
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        self.rx.close();
        let mut current = self.state.current.lock().unwrap();
        if current.as_ref().is_some_and(|tx| tx.same_channel(&self.tx)) {
            *current = None;
        }
        Ok(())
    }
}

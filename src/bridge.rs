//! # Metrics Bridge
//!
//! Ties the pieces together: telegrams from the bus session are decoded with the
//! datapoint type of their address and written into the value cache, and the
//! cache is exposed to Prometheus through one collector per mapped address.
//!
//! ```text
//! BusSession --telegrams--> on_telegram --decode--> ValueCache <--collect-- Registry
//!      ^                                                ^
//!      +----------------- read_now (request) -----------+
//! ```

use crate::cache::{CachedValue, ValueCache};
use crate::collector::{ConnectionCollector, StalenessCollector, ValueCollector};
use crate::config::ExporterConfig;
use crate::constants::{
    BUS_CONNECTED_METRIC, MESSAGES_METRIC, POLL_REQUESTS_METRIC, VALUE_STALE_METRIC,
};
use crate::dpt::codec;
use crate::error::BridgeError;
use crate::knx::address::GroupAddress;
use crate::knx::session::{BusSession, TelegramStream};
use crate::knx::telegram::Telegram;
use crate::knx::transport::{self, BusTransport};
use crate::mapping::{AddressMapping, MetricDescriptor};
use crate::util::logging::ThrottleManager;
use log::{debug, trace, warn};
use prometheus::core::Collector;
use prometheus::{IntCounterVec, Opts, Registry};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

const INCOMING: &str = "incoming";
const OUTGOING: &str = "outgoing";
const POLL_SUCCESS: &str = "success";
const POLL_FAILURE: &str = "failure";

/// Counters describing the bridge itself.
struct BridgeStats {
    messages: IntCounterVec,
    poll_requests: IntCounterVec,
}

impl BridgeStats {
    fn new(prefix: &str) -> Result<Self, BridgeError> {
        let messages = IntCounterVec::new(
            Opts::new(
                format!("{prefix}{MESSAGES_METRIC}"),
                "KNX telegrams seen by the bridge",
            ),
            &["direction", "processed"],
        )?;
        let poll_requests = IntCounterVec::new(
            Opts::new(
                format!("{prefix}{POLL_REQUESTS_METRIC}"),
                "Active reads of group addresses",
            ),
            &["result"],
        )?;
        Ok(BridgeStats {
            messages,
            poll_requests,
        })
    }

    fn message(&self, direction: &str, processed: bool) {
        let processed = if processed { "true" } else { "false" };
        self.messages
            .with_label_values(&[direction, processed])
            .inc();
    }
}

/// Bridge between one bus session and the metrics registry.
pub struct MetricsBridge {
    config: ExporterConfig,
    mapping: AddressMapping,
    cache: ValueCache,
    session: BusSession,
    stats: BridgeStats,
    warnings: ThrottleManager,
}

impl MetricsBridge {
    /// Builds the bridge on top of `transport`.
    ///
    /// The address mapping is built first, so configuration errors surface here
    /// before any connection attempt.
    pub fn new(
        config: ExporterConfig,
        transport: Arc<dyn BusTransport>,
    ) -> Result<Arc<Self>, BridgeError> {
        let mapping = AddressMapping::from_config(&config)?;
        let cache = ValueCache::new(
            mapping
                .descriptors()
                .iter()
                .map(|d| (d.address, d.poll.max_age)),
        );
        let stats = BridgeStats::new(&config.metrics_prefix)?;
        let session = BusSession::new(transport, config.session.clone());
        debug!(
            "Bridge maps {} group addresses via {}",
            mapping.len(),
            session_endpoint(&config)
        );
        Ok(Arc::new(MetricsBridge {
            config,
            mapping,
            cache,
            session,
            stats,
            warnings: ThrottleManager::default(),
        }))
    }

    /// Builds the bridge with the transport named in the configuration.
    pub fn from_config(config: ExporterConfig) -> Result<Arc<Self>, BridgeError> {
        let transport = transport::from_config(&config.connection, config.session.request_timeout);
        Self::new(config, transport)
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn mapping(&self) -> &AddressMapping {
        &self.mapping
    }

    pub fn session(&self) -> &BusSession {
        &self.session
    }

    pub fn telegrams(&self) -> TelegramStream {
        self.session.telegrams()
    }

    /// One collector per mapped address plus the bridge's own metrics.
    pub fn register_metrics(&self) -> Result<Vec<Box<dyn Collector>>, BridgeError> {
        let prefix = &self.config.metrics_prefix;
        let mut collectors: Vec<Box<dyn Collector>> = Vec::with_capacity(self.mapping.len() + 4);
        let mut slots = Vec::with_capacity(self.mapping.len());
        for descriptor in self.mapping.descriptors() {
            let slot = self.cache.slot(descriptor.address).cloned().ok_or_else(|| {
                BridgeError::InvalidConfig(format!("no cache slot for {}", descriptor.address))
            })?;
            collectors.push(Box::new(ValueCollector::new(descriptor, slot.clone())?));
            slots.push((descriptor.name.clone(), slot));
        }
        collectors.push(Box::new(self.stats.messages.clone()));
        collectors.push(Box::new(self.stats.poll_requests.clone()));
        collectors.push(Box::new(ConnectionCollector::new(
            &format!("{prefix}{BUS_CONNECTED_METRIC}"),
            self.session.subscribe_state(),
        )?));
        collectors.push(Box::new(StalenessCollector::new(
            &format!("{prefix}{VALUE_STALE_METRIC}"),
            slots,
        )?));
        Ok(collectors)
    }

    /// Registers every collector of [`MetricsBridge::register_metrics`].
    pub fn register_into(&self, registry: &Registry) -> Result<(), BridgeError> {
        for collector in self.register_metrics()? {
            registry.register(collector)?;
        }
        Ok(())
    }

    /// Handles one inbound telegram. Unmapped addresses are ignored; payloads
    /// that do not decode are logged and leave the cache untouched.
    pub fn on_telegram(&self, telegram: Telegram) {
        if !telegram.carries_value() {
            return;
        }
        let address = telegram.destination;
        let Some(descriptor) = self.mapping.lookup(address) else {
            trace!("Ignoring telegram for unmapped {address}");
            self.stats.message(INCOMING, false);
            return;
        };
        match self.store(descriptor, &telegram.payload) {
            Ok(cached) => {
                self.stats.message(INCOMING, true);
                debug!("{} ({address}) = {}", descriptor.name, cached.value);
            }
            Err(e) => {
                self.stats.message(INCOMING, false);
                self.warn_throttled(
                    address,
                    format_args!(
                        "Dropping telegram for {address} ({}, DPT {}): {e}",
                        descriptor.name, descriptor.dpt
                    ),
                );
            }
        }
    }

    /// Reads `address` from the bus and stores the decoded value.
    pub async fn read_now(&self, address: GroupAddress) -> Result<(), BridgeError> {
        let descriptor = self.mapping.lookup(address).ok_or_else(|| {
            BridgeError::InvalidGroupAddress(format!("{address} is not mapped"))
        })?;
        let result = self.request_and_store(descriptor).await;
        let outcome = if result.is_ok() {
            POLL_SUCCESS
        } else {
            POLL_FAILURE
        };
        self.stats.poll_requests.with_label_values(&[outcome]).inc();
        result.map(|_| ())
    }

    async fn request_and_store(
        &self,
        descriptor: &MetricDescriptor,
    ) -> Result<CachedValue, BridgeError> {
        trace!("Reading {} ({})", descriptor.address, descriptor.name);
        let payload = self.session.request(descriptor.address).await;
        self.stats.message(OUTGOING, payload.is_ok());
        self.store(descriptor, &payload?)
    }

    fn store(
        &self,
        descriptor: &MetricDescriptor,
        payload: &[u8],
    ) -> Result<CachedValue, BridgeError> {
        let value = codec::decode(payload, descriptor.dpt)?;
        self.cache.update(descriptor.address, value).ok_or_else(|| {
            BridgeError::InvalidGroupAddress(format!("{} is not cached", descriptor.address))
        })
    }

    /// True if `descriptor` has no value yet or its value reached `max_age`.
    pub fn needs_read(&self, descriptor: &MetricDescriptor, now: SystemTime) -> bool {
        self.cache
            .slot(descriptor.address)
            .map_or(true, |slot| slot.needs_refresh(now))
    }

    /// Current cache entry of `address`.
    pub fn snapshot(&self, address: GroupAddress) -> Option<CachedValue> {
        self.cache.get(address)
    }

    /// Re-evaluates the stale flags. Returns the number of stale values.
    pub fn refresh_staleness(&self) -> usize {
        self.cache.refresh_staleness(SystemTime::now())
    }

    /// Logs a warning unless `address` has produced too many recently.
    pub(crate) fn warn_throttled(&self, address: GroupAddress, message: fmt::Arguments<'_>) {
        match self.warnings.allow(&address.to_string()) {
            Some(0) => warn!("{message}"),
            Some(suppressed) => warn!("{message} ({suppressed} similar messages suppressed)"),
            None => {}
        }
    }

    /// Number of telegrams counted under `direction`/`processed`.
    pub fn message_count(&self, direction: &str, processed: bool) -> u64 {
        let processed = if processed { "true" } else { "false" };
        self.stats
            .messages
            .with_label_values(&[direction, processed])
            .get()
    }

    /// Number of active reads that ended with `result` (`success`/`failure`).
    pub fn poll_count(&self, result: &str) -> u64 {
        self.stats.poll_requests.with_label_values(&[result]).get()
    }

    /// Runs the bus session's connect loop until [`MetricsBridge::close`].
    pub async fn run(&self) -> Result<(), BridgeError> {
        self.session.run().await
    }

    /// Closes the bus session. Safe to call more than once.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

fn session_endpoint(config: &ExporterConfig) -> String {
    format!("{:?} {}", config.connection.kind, config.connection.endpoint)
}

//! Prometheus collectors reading straight from the value cache.
//!
//! Each mapped address gets one [`ValueCollector`]. Nothing is pushed into the
//! registry when telegrams arrive; the current cache entry is turned into a
//! sample when the registry is scraped.

use crate::cache::ValueSlot;
use crate::constants::{GROUP_ADDRESS_LABEL, TEXT_VALUE_LABEL};
use crate::dpt::DatapointValue;
use crate::error::BridgeError;
use crate::knx::session::SessionState;
use crate::mapping::{MetricDescriptor, MetricKind};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Counter, Gauge, GaugeVec, IntGauge, Opts};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;

enum Sample {
    Gauge(Gauge),
    Counter(Counter),
    /// Info-style gauge of 1 carrying the text as a label.
    Text(GaugeVec),
}

impl Sample {
    fn desc(&self) -> Vec<&Desc> {
        match self {
            Sample::Gauge(g) => g.desc(),
            Sample::Counter(c) => c.desc(),
            Sample::Text(v) => v.desc(),
        }
    }
}

/// Collector exporting the cached value of one group address.
pub struct ValueCollector {
    slot: Arc<ValueSlot>,
    sample: Sample,
    // Serializes load-then-collect so concurrent scrapes never interleave.
    scrape: Mutex<()>,
}

impl ValueCollector {
    pub fn new(descriptor: &MetricDescriptor, slot: Arc<ValueSlot>) -> Result<Self, BridgeError> {
        let opts = Opts::new(descriptor.name.clone(), descriptor.help.clone())
            .const_labels(descriptor.const_labels());
        let sample = if descriptor.dpt.is_text() {
            Sample::Text(GaugeVec::new(opts, &[TEXT_VALUE_LABEL])?)
        } else {
            match descriptor.kind {
                MetricKind::Gauge => Sample::Gauge(Gauge::with_opts(opts)?),
                MetricKind::Counter => Sample::Counter(Counter::with_opts(opts)?),
            }
        };
        Ok(ValueCollector {
            slot,
            sample,
            scrape: Mutex::new(()),
        })
    }
}

impl Collector for ValueCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.sample.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _guard = self.scrape.lock().unwrap_or_else(|e| e.into_inner());
        let Some(cached) = self.slot.get() else {
            return Vec::new();
        };
        match (&self.sample, &cached.value) {
            (Sample::Text(vec), DatapointValue::Text(text)) => {
                vec.reset();
                vec.with_label_values(&[text.as_str()]).set(1.0);
                vec.collect()
            }
            (Sample::Gauge(gauge), value) => match value.as_f64() {
                Some(v) => {
                    gauge.set(v);
                    gauge.collect()
                }
                None => Vec::new(),
            },
            (Sample::Counter(counter), value) => match value.as_f64() {
                Some(v) if v >= 0.0 => {
                    counter.reset();
                    counter.inc_by(v);
                    counter.collect()
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

/// Exports `1` per address whose cached value is older than its `max_age`
/// and `0` for fresh ones. Addresses without a value are left out.
pub struct StalenessCollector {
    slots: Vec<(String, Arc<ValueSlot>)>,
    gauge: GaugeVec,
    scrape: Mutex<()>,
}

impl StalenessCollector {
    /// `slots` pairs each cache slot with the metric name it is exported as.
    pub fn new(name: &str, slots: Vec<(String, Arc<ValueSlot>)>) -> Result<Self, BridgeError> {
        let gauge = GaugeVec::new(
            Opts::new(
                name,
                "Whether the exported value of a group address is older than its max_age",
            ),
            &["metric", GROUP_ADDRESS_LABEL],
        )?;
        Ok(StalenessCollector {
            slots,
            gauge,
            scrape: Mutex::new(()),
        })
    }
}

impl Collector for StalenessCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _guard = self.scrape.lock().unwrap_or_else(|e| e.into_inner());
        let now = SystemTime::now();
        self.gauge.reset();
        for (metric, slot) in &self.slots {
            if let Some(stale) = slot.stale_at(now) {
                let address = slot.address().to_string();
                self.gauge
                    .with_label_values(&[metric.as_str(), address.as_str()])
                    .set(if stale { 1.0 } else { 0.0 });
            }
        }
        self.gauge.collect()
    }
}

/// Exports `1` while the bus session is connected and `0` otherwise.
pub struct ConnectionCollector {
    state: watch::Receiver<SessionState>,
    gauge: IntGauge,
}

impl ConnectionCollector {
    pub fn new(
        name: &str,
        state: watch::Receiver<SessionState>,
    ) -> Result<Self, BridgeError> {
        let gauge = IntGauge::with_opts(Opts::new(
            name,
            "Whether the bridge is connected to the KNX bus",
        ))?;
        Ok(ConnectionCollector { state, gauge })
    }
}

impl Collector for ConnectionCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let connected = *self.state.borrow() == SessionState::Connected;
        self.gauge.set(i64::from(connected));
        self.gauge.collect()
    }
}

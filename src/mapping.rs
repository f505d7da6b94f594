//! # Address Mapping
//!
//! Static table from group address to metric identity, built once from the
//! configuration and read-only afterwards.

use crate::config::ExporterConfig;
use crate::constants::{GROUP_ADDRESS_LABEL, RESERVED_METRIC_NAMES, TEXT_VALUE_LABEL};
use crate::dpt::DatapointType;
use crate::error::BridgeError;
use crate::knx::address::GroupAddress;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Prometheus metric type of an exported address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
}

/// How the value of an address is obtained besides passive listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub read_active: bool,
    pub max_age: Duration,
    pub read_startup: bool,
}

/// Metric identity of one group address.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub address: GroupAddress,
    /// Full metric name including the configured prefix.
    pub name: String,
    pub help: String,
    /// Static labels from the configuration.
    pub labels: BTreeMap<String, String>,
    pub dpt: DatapointType,
    pub kind: MetricKind,
    pub poll: PollSettings,
}

impl MetricDescriptor {
    /// Labels attached to every sample: the static ones plus the group address.
    pub fn const_labels(&self) -> HashMap<String, String> {
        let mut labels: HashMap<String, String> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(GROUP_ADDRESS_LABEL.to_string(), self.address.to_string());
        labels
    }
}

/// Lookup table from group address to [`MetricDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct AddressMapping {
    descriptors: Vec<MetricDescriptor>,
    index: HashMap<GroupAddress, usize>,
}

impl AddressMapping {
    /// Builds the table from the exported entries of `config`.
    ///
    /// Fails with `UnknownDatapointType` for unrecognized DPTs, with
    /// `DuplicateMetricIdentity` if two addresses share a metric name and label
    /// set, and with `InvalidConfig` for names taken by the bridge's own metrics.
    pub fn from_config(config: &ExporterConfig) -> Result<Self, BridgeError> {
        let mut mapping = AddressMapping::default();
        let mut identities: HashMap<(String, BTreeMap<String, String>), GroupAddress> =
            HashMap::new();

        for (text, entry) in config.address_configs.iter().filter(|(_, e)| e.export) {
            let address: GroupAddress = text.parse()?;
            let dpt: DatapointType = entry.dpt.parse()?;
            let name = format!("{}{}", config.metrics_prefix, entry.name);
            validate_metric_name(&name)?;
            if RESERVED_METRIC_NAMES.contains(&entry.name.as_str()) {
                return Err(BridgeError::InvalidConfig(format!(
                    "{address}: metric {name} is exported by the bridge itself"
                )));
            }
            for label in entry.labels.keys() {
                validate_label_name(label)?;
                if label == GROUP_ADDRESS_LABEL || (dpt.is_text() && label == TEXT_VALUE_LABEL) {
                    return Err(BridgeError::InvalidConfig(format!(
                        "{address}: label {label} is reserved"
                    )));
                }
            }
            if mapping.index.contains_key(&address) {
                return Err(BridgeError::InvalidConfig(format!(
                    "group address {address} is configured twice"
                )));
            }

            let identity = (name.clone(), entry.labels.clone());
            if let Some(first) = identities.get(&identity) {
                return Err(BridgeError::DuplicateMetricIdentity {
                    metric: name,
                    first: first.to_string(),
                    second: address.to_string(),
                });
            }
            identities.insert(identity, address);

            let mut help = if entry.comment.trim().is_empty() {
                format!("Value of KNX group address {address} (DPT {dpt})")
            } else {
                entry.comment.trim().to_string()
            };

            // Samples sharing a metric name form one family: the registry wants
            // the same help text, type and label names for all of them.
            if let Some(first) = mapping.descriptors.iter().find(|d| d.name == name) {
                if first.kind != entry.metric_type
                    || first.dpt.is_text() != dpt.is_text()
                    || !first.labels.keys().eq(entry.labels.keys())
                {
                    return Err(BridgeError::InvalidConfig(format!(
                        "{address}: metric {name} is also used by {} with a different type or label names",
                        first.address
                    )));
                }
                help = first.help.clone();
            }

            mapping.index.insert(address, mapping.descriptors.len());
            mapping.descriptors.push(MetricDescriptor {
                address,
                name,
                help,
                labels: entry.labels.clone(),
                dpt,
                kind: entry.metric_type,
                poll: PollSettings {
                    read_active: entry.read_active,
                    max_age: entry.max_age,
                    read_startup: entry.read_startup,
                },
            });
        }
        Ok(mapping)
    }

    pub fn lookup(&self, address: GroupAddress) -> Option<&MetricDescriptor> {
        self.index.get(&address).map(|i| &self.descriptors[*i])
    }

    /// All descriptors in configuration order.
    pub fn descriptors(&self) -> &[MetricDescriptor] {
        &self.descriptors
    }

    /// Descriptors that are read periodically.
    pub fn poll_targets(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.descriptors.iter().filter(|d| d.poll.read_active)
    }

    /// Descriptors that are read once at startup.
    pub fn startup_targets(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.descriptors.iter().filter(|d| d.poll.read_startup)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn validate_metric_name(name: &str) -> Result<(), BridgeError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidConfig(format!(
            "invalid metric name: {name:?}"
        )))
    }
}

fn validate_label_name(name: &str) -> Result<(), BridgeError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__");
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidConfig(format!(
            "invalid label name: {name:?}"
        )))
    }
}

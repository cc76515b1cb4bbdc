//! Prometheus metrics of the operator runtime. All metrics live in one process wide registry and
//! are labelled by the operator task that produced them.

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::Result;
use crate::error::Error;

const OPERATOR_LABEL: &str = "operator";

const EMITTED_TOTAL: &str = "emitted";
const DROPPED_TOTAL: &str = "dropped";
const ACKED_TOTAL: &str = "acked";
const REDELIVERED_TOTAL: &str = "redelivered";
const SEND_ERROR_TOTAL: &str = "send_error";
const LOST_TOTAL: &str = "lost";
const BUFFER_PENDING: &str = "buffer_pending";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // we register each metric only one time, a plain mutex is enough.
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

/// Metrics of the record distribution and fault-tolerance path. Each metric is a family
/// differentiated by its labels.
pub(crate) struct RuntimeMetrics {
    // counters
    pub(crate) emitted_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) dropped_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) acked_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) redelivered_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) send_error_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) lost_total: Family<Vec<(String, String)>, Counter>,

    // gauge
    pub(crate) buffer_pending: Family<Vec<(String, String)>, Gauge>,
}

impl RuntimeMetrics {
    fn new() -> Self {
        let metrics = Self {
            emitted_total: Family::default(),
            dropped_total: Family::default(),
            acked_total: Family::default(),
            redelivered_total: Family::default(),
            send_error_total: Family::default(),
            lost_total: Family::default(),
            buffer_pending: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix("rivulet");
        registry.register(
            EMITTED_TOTAL,
            "Total number of records collected and buffered for delivery",
            metrics.emitted_total.clone(),
        );
        registry.register(
            DROPPED_TOTAL,
            "Total number of records with no destination channel",
            metrics.dropped_total.clone(),
        );
        registry.register(
            ACKED_TOTAL,
            "Total number of records retired after every destination acknowledged them",
            metrics.acked_total.clone(),
        );
        registry.register(
            REDELIVERED_TOTAL,
            "Total number of redeliveries after an acknowledgement timeout",
            metrics.redelivered_total.clone(),
        );
        registry.register(
            SEND_ERROR_TOTAL,
            "Total number of failed channel sends",
            metrics.send_error_total.clone(),
        );
        registry.register(
            LOST_TOTAL,
            "Total number of records still unacknowledged when the operator terminated",
            metrics.lost_total.clone(),
        );
        registry.register(
            BUFFER_PENDING,
            "Number of records waiting for acknowledgement",
            metrics.buffer_pending.clone(),
        );
        metrics
    }
}

static RUNTIME_METRICS: OnceLock<RuntimeMetrics> = OnceLock::new();

pub(crate) fn runtime_metrics() -> &'static RuntimeMetrics {
    RUNTIME_METRICS.get_or_init(RuntimeMetrics::new)
}

pub(crate) fn operator_labels(operator: &str) -> Vec<(String, String)> {
    vec![(OPERATOR_LABEL.to_string(), operator.to_string())]
}

/// Renders every registered metric in the prometheus text format.
pub fn encode_registry() -> Result<String> {
    // make sure the runtime metrics are registered even if nothing ran yet
    let _ = runtime_metrics();
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry).map_err(|e| Error::Config(format!("encoding metrics: {e}")))?;
    Ok(buffer)
}

//! Runtime configuration of one operator task. The topology builder hands every operator a base64
//! encoded JSON object, see [RuntimeConfig::load]. Everything that is invalid is rejected here,
//! before the operator starts, never per record.

use std::env;
use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;
use serde_json::from_slice;

use crate::Result;
use crate::error::Error;
use crate::partitioner::Partitioning;
use crate::selector::{NamedOutput, OutputRouting};

const ENV_OPERATOR_OBJ: &str = "RIVULET_OPERATOR_OBJECT";

const DEFAULT_BUFFER_CAPACITY: usize = 10000;
const DEFAULT_BLOCK_SIZE: usize = 256;
const DEFAULT_BUFFER_FULL_STRATEGY: BufferFullStrategy = BufferFullStrategy::Block;
const DEFAULT_ACK_TIMEOUT_MILLIS: u64 = 30_000;
const DEFAULT_SWEEP_INTERVAL_MILLIS: u64 = 1000;
const DEFAULT_SWEEP_BATCH_SIZE: usize = 500;
const DEFAULT_DRAIN_TIMEOUT_MILLIS: u64 = 10_000;
const DEFAULT_CHANNELS: usize = 1;

/// What `collect` does when the buffer holds `capacity` unacknowledged records.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum BufferFullStrategy {
    /// Park the emitting operator until acknowledgements free a slot.
    #[default]
    Block,
    /// Return [Error::BufferFull] to the emitting operator.
    Fail,
}

impl TryFrom<String> for BufferFullStrategy {
    type Error = &'static str;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "block" => Ok(BufferFullStrategy::Block),
            "fail" => Ok(BufferFullStrategy::Fail),
            _ => Err("Invalid BufferFullStrategy string"),
        }
    }
}

impl fmt::Display for BufferFullStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferFullStrategy::Block => write!(f, "block"),
            BufferFullStrategy::Fail => write!(f, "fail"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// maximum number of live (unacknowledged) records
    pub capacity: usize,
    /// entries per block
    pub block_size: usize,
    pub buffer_full_strategy: BufferFullStrategy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            capacity: DEFAULT_BUFFER_CAPACITY,
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_full_strategy: DEFAULT_BUFFER_FULL_STRATEGY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckConfig {
    /// a record not acknowledged within this duration is redelivered
    pub timeout: Duration,
    pub sweep_interval: Duration,
    /// upper bound of expired entries handled by one sweep
    pub sweep_batch_size: usize,
    /// `None` redelivers forever
    pub max_redeliveries: Option<u32>,
}

impl Default for AckConfig {
    fn default() -> Self {
        AckConfig {
            timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MILLIS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MILLIS),
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            max_redeliveries: None,
        }
    }
}

/// Output wiring of an operator, supplied by the topology builder.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputsConfig {
    pub channels: usize,
    pub partitioning: Partitioning,
    /// named outputs and their channel ranges, empty when the operator does not branch
    pub outputs: Vec<NamedOutput>,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        OutputsConfig {
            channels: DEFAULT_CHANNELS,
            partitioning: Partitioning::default(),
            outputs: vec![],
        }
    }
}

impl OutputsConfig {
    /// Routing of named outputs, `None` if no named outputs are configured.
    pub fn routing(&self) -> Result<Option<OutputRouting>> {
        if self.outputs.is_empty() {
            return Ok(None);
        }
        OutputRouting::new(self.channels, &self.outputs).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub operator_name: String,
    pub replica: u16,
    pub buffer: BufferConfig,
    pub ack: AckConfig,
    pub drain_timeout: Duration,
    pub outputs: OutputsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            operator_name: "default".to_string(),
            replica: 0,
            buffer: BufferConfig::default(),
            ack: AckConfig::default(),
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MILLIS),
            outputs: OutputsConfig::default(),
        }
    }
}

/// Operator object as the topology builder serializes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperatorObject {
    operator_name: String,
    #[serde(default)]
    replica: u16,
    buffer: Option<BufferObject>,
    ack: Option<AckObject>,
    drain_timeout_ms: Option<u64>,
    outputs: Option<OutputsObject>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferObject {
    capacity: Option<usize>,
    block_size: Option<usize>,
    buffer_full_strategy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckObject {
    timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    sweep_batch_size: Option<usize>,
    max_redeliveries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputsObject {
    channels: Option<usize>,
    #[serde(default)]
    partitioning: Partitioning,
    #[serde(default)]
    outputs: Vec<NamedOutput>,
}

impl RuntimeConfig {
    /// Loads the configuration from the base64 encoded operator object.
    pub fn load(operator_obj: String) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(operator_obj.as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode operator object: {:?}", e)))?;

        let obj: OperatorObject = from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse operator object: {:?}", e)))?;

        let buffer = obj.buffer.unwrap_or_default();
        let buffer_full_strategy = match buffer.buffer_full_strategy {
            Some(strategy) => BufferFullStrategy::try_from(strategy)
                .map_err(|e| Error::Config(e.to_string()))?,
            None => DEFAULT_BUFFER_FULL_STRATEGY,
        };

        let ack = obj.ack.unwrap_or_default();
        let outputs = obj.outputs.unwrap_or_default();

        let config = RuntimeConfig {
            operator_name: obj.operator_name,
            replica: obj.replica,
            buffer: BufferConfig {
                capacity: buffer.capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
                block_size: buffer.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
                buffer_full_strategy,
            },
            ack: AckConfig {
                timeout: Duration::from_millis(ack.timeout_ms.unwrap_or(DEFAULT_ACK_TIMEOUT_MILLIS)),
                sweep_interval: Duration::from_millis(
                    ack.sweep_interval_ms
                        .unwrap_or(DEFAULT_SWEEP_INTERVAL_MILLIS),
                ),
                sweep_batch_size: ack.sweep_batch_size.unwrap_or(DEFAULT_SWEEP_BATCH_SIZE),
                max_redeliveries: ack.max_redeliveries,
            },
            drain_timeout: Duration::from_millis(
                obj.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MILLIS),
            ),
            outputs: OutputsConfig {
                channels: outputs.channels.unwrap_or(DEFAULT_CHANNELS),
                partitioning: outputs.partitioning,
                outputs: outputs.outputs,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the `RIVULET_OPERATOR_OBJECT` environment variable.
    pub fn from_env() -> Result<Self> {
        let obj = env::var(ENV_OPERATOR_OBJ)
            .map_err(|_| Error::Config(format!("{ENV_OPERATOR_OBJ} is not set")))?;
        Self::load(obj)
    }

    /// Rejects settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.operator_name.is_empty() {
            return Err(Error::Config("operator name is empty".to_string()));
        }
        if self.buffer.capacity == 0 {
            return Err(Error::Config("buffer capacity must be positive".to_string()));
        }
        if self.buffer.block_size == 0 {
            return Err(Error::Config("block size must be positive".to_string()));
        }
        if self.ack.timeout.is_zero() {
            return Err(Error::Config("ack timeout must be positive".to_string()));
        }
        if self.ack.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be positive".to_string()));
        }
        if self.ack.sweep_batch_size == 0 {
            return Err(Error::Config("sweep batch size must be positive".to_string()));
        }
        if self.outputs.channels == 0 {
            return Err(Error::Config(
                "an operator needs at least one output channel".to_string(),
            ));
        }
        self.outputs.partitioning.selector()?;
        self.outputs.routing()?;
        Ok(())
    }

    /// Identity of the task, used as the producer of every [crate::message::RecordId] it emits.
    pub fn task_id(&self) -> String {
        format!("{}-{}", self.operator_name, self.replica)
    }
}

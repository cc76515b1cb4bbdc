//! Operator invocation runtime drives one operator task through its lifecycle.
//!
//! ```text
//! Idle --start--> Running --input exhausted / source done--> Closing --drained--> Terminated
//!                    |                                           |
//!                    +------------- user error, buffer error ----+------------> Failed
//! ```
//!
//! In `Running` a source is asked for records until it is done; a task or sink pulls the next
//! frame from its input, runs the user logic, collects what was emitted and then acknowledges the
//! input. In `Closing` the runtime waits up to `drain_timeout` for the fault-tolerance buffer to
//! empty; whatever is still unacknowledged afterwards is logged as lost. Acks and redeliveries
//! keep flowing while draining.
//!
//! [OperatorHandle::stop] cancels the operator in any state. It ends in `Terminated` without a
//! drain and buffered records are dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::ack::{AckEvent, AckListener, RedeliverySweep};
use crate::buffer::BufferHandle;
use crate::codec::{decode_record, encode_ack};
use crate::collector::Collector;
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::message::{Record, RecordIdGenerator};
use crate::metrics::{operator_labels, runtime_metrics};
use crate::operator::{
    Emitter, Operator, OperatorError, SinkOperator, SourceOperator, SourceState, TaskOperator,
};
use crate::selector::OutputSelector;
use crate::transport::{AckReader, ChannelWriter, InputReader};

/// State of an operator task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorStatus {
    Idle,
    Running,
    Closing,
    Terminated,
    /// terminal, the scheduler decides about a restart
    Failed(String),
}

impl OperatorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperatorStatus::Terminated | OperatorStatus::Failed(_))
    }
}

impl fmt::Display for OperatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorStatus::Idle => write!(f, "Idle"),
            OperatorStatus::Running => write!(f, "Running"),
            OperatorStatus::Closing => write!(f, "Closing"),
            OperatorStatus::Terminated => write!(f, "Terminated"),
            OperatorStatus::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Invoked once with the task id and the terminal status.
pub type TerminalCallback = Arc<dyn Fn(&str, &OperatorStatus) + Send + Sync>;

/// Output side of an operator as wired by the topology builder.
pub struct Outputs {
    writer: Arc<dyn ChannelWriter>,
    acks: Box<dyn AckReader>,
    output_selector: Option<Arc<dyn OutputSelector>>,
}

impl Outputs {
    pub fn new(writer: Arc<dyn ChannelWriter>, acks: Box<dyn AckReader>) -> Self {
        Self {
            writer,
            acks,
            output_selector: None,
        }
    }

    /// Routes records by name, the names map to channels through the configured outputs.
    pub fn with_output_selector(mut self, selector: Arc<dyn OutputSelector>) -> Self {
        self.output_selector = Some(selector);
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Exhausted,
}

pub struct OperatorRuntime {
    config: RuntimeConfig,
    operator: Operator,
    input: Option<Box<dyn InputReader>>,
    outputs: Option<Outputs>,
    on_terminal: Option<TerminalCallback>,
}

impl OperatorRuntime {
    pub fn source(
        config: RuntimeConfig,
        operator: impl SourceOperator + 'static,
        outputs: Outputs,
    ) -> Result<Self> {
        Self::build(
            config,
            Operator::Source(Box::new(operator)),
            None,
            Some(outputs),
        )
    }

    pub fn task(
        config: RuntimeConfig,
        operator: impl TaskOperator + 'static,
        input: impl InputReader + 'static,
        outputs: Outputs,
    ) -> Result<Self> {
        Self::build(
            config,
            Operator::Task(Box::new(operator)),
            Some(Box::new(input)),
            Some(outputs),
        )
    }

    pub fn sink(
        config: RuntimeConfig,
        operator: impl SinkOperator + 'static,
        input: impl InputReader + 'static,
    ) -> Result<Self> {
        Self::build(
            config,
            Operator::Sink(Box::new(operator)),
            Some(Box::new(input)),
            None,
        )
    }

    fn build(
        config: RuntimeConfig,
        operator: Operator,
        input: Option<Box<dyn InputReader>>,
        outputs: Option<Outputs>,
    ) -> Result<Self> {
        config.validate()?;
        let selects_outputs = outputs
            .as_ref()
            .is_some_and(|outputs| outputs.output_selector.is_some());
        if selects_outputs && config.outputs.outputs.is_empty() {
            return Err(Error::Config(format!(
                "{} has an output selector but no named outputs",
                config.task_id()
            )));
        }
        Ok(Self {
            config,
            operator,
            input,
            outputs,
            on_terminal: None,
        })
    }

    /// Registers the callback told about the terminal state.
    pub fn on_terminal(
        mut self,
        callback: impl Fn(&str, &OperatorStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_terminal = Some(Arc::new(callback));
        self
    }

    pub fn task_id(&self) -> String {
        self.config.task_id()
    }

    /// Spawns the operator on its own task.
    pub fn start(self) -> OperatorHandle {
        let task_id = self.task_id();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(OperatorStatus::Idle);

        let task = tokio::spawn(supervise(self, cancel.clone(), Arc::new(status_tx)));
        OperatorHandle {
            task_id,
            cancel,
            status: status_rx,
            task,
        }
    }

    async fn execute(
        self,
        cancel: CancellationToken,
        status: Arc<watch::Sender<OperatorStatus>>,
    ) -> Result<()> {
        let task_id = self.config.task_id();
        let OperatorRuntime {
            config,
            mut operator,
            mut input,
            outputs,
            ..
        } = self;

        transition(&status, &task_id, OperatorStatus::Running);
        info!(task = %task_id, role = operator.role(), "Operator started");

        // ack listener and redelivery sweep, stopped whenever we leave
        let background_cancel = cancel.child_token();
        let _background_guard = background_cancel.clone().drop_guard();
        let (failure_tx, mut failures) = mpsc::channel::<Error>(2);
        let mut background = Vec::new();

        let mut collector = match outputs {
            Some(outputs) => {
                let buffer = BufferHandle::new(&task_id, &config.buffer, &config.ack);
                let mut collector = Collector::new(
                    &task_id,
                    config.outputs.channels,
                    config.outputs.partitioning.selector()?,
                    outputs.writer,
                    buffer.clone(),
                )?;
                if let Some(selector) = outputs.output_selector {
                    let routing = config.outputs.routing()?.ok_or_else(|| {
                        Error::Config(format!("{task_id} has no named outputs"))
                    })?;
                    collector = collector.with_output_selector(selector, routing);
                }

                background.push(spawn_background(
                    "ack-listener",
                    AckListener::new(outputs.acks, buffer).run(background_cancel.clone()),
                    failure_tx.clone(),
                ));
                background.push(spawn_background(
                    "redelivery-sweep",
                    RedeliverySweep::new(collector.clone(), config.ack.sweep_interval)
                        .run(background_cancel.clone()),
                    failure_tx.clone(),
                ));
                Some(collector)
            }
            None => None,
        };
        drop(failure_tx);

        let mut emitter = Emitter::new(RecordIdGenerator::new(task_id.clone()));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                Some(e) = failures.recv() => Some(Err(e)),
                result = step(&mut operator, input.as_mut(), &mut emitter, collector.as_mut()) => Some(result),
            };
            match next {
                None => return abandon(&task_id, collector.as_ref().map(Collector::buffer)).await,
                Some(result) => {
                    if result? == Step::Exhausted {
                        break;
                    }
                }
            }
        }

        if let Operator::Task(task) = &mut operator {
            task.finish(&mut emitter).map_err(operator_error)?;
            emit_all(&mut emitter, collector.as_mut()).await?;
        }

        transition(&status, &task_id, OperatorStatus::Closing);
        if let Some(collector) = collector.take() {
            let buffer = collector.buffer().clone();
            let drained = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                Some(e) = failures.recv() => Some(Err(e)),
                drained = tokio::time::timeout(config.drain_timeout, buffer.wait_until_drained()) => Some(Ok(drained)),
            };
            match drained {
                None => return abandon(&task_id, Some(&buffer)).await,
                Some(Err(e)) => return Err(e),
                Some(Ok(Ok(drained))) => {
                    drained?;
                    info!(task = %task_id, "Every emitted record was acknowledged");
                }
                Some(Ok(Err(_))) => {
                    let lost = buffer.evict_all().await?;
                    warn!(
                        task = %task_id,
                        count = lost.len(),
                        lost = ?lost.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "Drain timed out, terminating with unacknowledged records"
                    );
                    runtime_metrics()
                        .lost_total
                        .get_or_create(&operator_labels(&task_id))
                        .inc_by(lost.len() as u64);
                }
            }
        }

        // closes the output channels once the background tasks let go of the writer
        background_cancel.cancel();
        for handle in background {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Runs the operator and reports its terminal state, including panics of user logic.
async fn supervise(
    runtime: OperatorRuntime,
    cancel: CancellationToken,
    status: Arc<watch::Sender<OperatorStatus>>,
) -> OperatorStatus {
    let task_id = runtime.task_id();
    let on_terminal = runtime.on_terminal.clone();

    let execution = tokio::spawn(runtime.execute(cancel, Arc::clone(&status)));
    let terminal = match execution.await {
        Ok(Ok(()) | Err(Error::Cancelled)) => OperatorStatus::Terminated,
        Ok(Err(e)) => {
            error!(?e, task = %task_id, "Operator failed");
            OperatorStatus::Failed(e.to_string())
        }
        Err(e) => {
            error!(?e, task = %task_id, "Operator task panicked");
            OperatorStatus::Failed(format!("operator task aborted: {e}"))
        }
    };

    transition(&status, &task_id, terminal.clone());
    if let Some(callback) = on_terminal {
        callback(&task_id, &terminal);
    }
    terminal
}

/// One turn of the operator loop.
async fn step(
    operator: &mut Operator,
    input: Option<&mut Box<dyn InputReader>>,
    emitter: &mut Emitter,
    collector: Option<&mut Collector>,
) -> Result<Step> {
    let input = match operator {
        Operator::Source(source) => {
            let state = source.produce(emitter).map_err(operator_error)?;
            if !emit_all(emitter, collector).await? {
                // nothing to collect, give others a chance to run
                tokio::task::yield_now().await;
            }
            return Ok(match state {
                SourceState::Continue => Step::Continue,
                SourceState::Done => Step::Exhausted,
            });
        }
        Operator::Task(_) | Operator::Sink(_) => input.ok_or_else(|| {
            Error::Config(format!("{} operator has no input", operator.role()))
        })?,
    };

    // suspends until a record arrives or every input lane is closed
    let Some(inbound) = input.read().await? else {
        return Ok(Step::Exhausted);
    };
    let record = decode_record(inbound.frame)?;

    match operator {
        Operator::Task(task) => {
            task.process(&record, emitter).map_err(operator_error)?;
            emit_all(emitter, collector).await?;
        }
        Operator::Sink(sink) => sink.consume(&record).map_err(operator_error)?,
        Operator::Source(_) => {}
    }

    ack_input(&mut **input, inbound.lane, &record).await?;
    Ok(Step::Continue)
}

/// Collects everything the operator emitted, returning whether there was anything.
async fn emit_all(emitter: &mut Emitter, collector: Option<&mut Collector>) -> Result<bool> {
    let records = emitter.take();
    if records.is_empty() {
        return Ok(false);
    }
    let Some(collector) = collector else {
        return Err(Error::Config(format!(
            "{} emitted records but has no outputs",
            emitter.producer()
        )));
    };
    for record in records {
        collector.collect(record).await?;
    }
    Ok(true)
}

async fn ack_input(input: &mut dyn InputReader, lane: usize, record: &Record) -> Result<()> {
    let frame = encode_ack(&AckEvent::new(record.id().clone()))?;
    // a lost ack only causes a redelivery upstream
    if let Err(e) = input.ack(lane, frame).await {
        warn!(?e, id = %record.id(), lane, "Failed to acknowledge input record");
    }
    Ok(())
}

/// Leaves on stop, buffered records are dropped.
async fn abandon(task_id: &str, buffer: Option<&BufferHandle>) -> Result<()> {
    if let Some(buffer) = buffer {
        if let Ok(pending) = buffer.len().await {
            if pending > 0 {
                warn!(task = %task_id, pending, "Operator stopped, dropping unacknowledged records");
            }
        }
    }
    Err(Error::Cancelled)
}

fn spawn_background<F>(
    name: &'static str,
    future: F,
    failures: mpsc::Sender<Error>,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            error!(?e, task = name, "Background task failed");
            let _ = failures.send(e).await;
        }
    })
}

fn operator_error(e: OperatorError) -> Error {
    Error::Operator(e.to_string())
}

fn transition(status: &watch::Sender<OperatorStatus>, task_id: &str, next: OperatorStatus) {
    let previous = status.send_replace(next.clone());
    info!(task = %task_id, from = %previous, to = %next, "Operator state transition");
}

/// Scheduler side of a started operator.
pub struct OperatorHandle {
    task_id: String,
    cancel: CancellationToken,
    status: watch::Receiver<OperatorStatus>,
    task: JoinHandle<OperatorStatus>,
}

impl OperatorHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Cancels the operator. It terminates without draining.
    pub fn stop(&self) {
        info!(task = %self.task_id, "Stopping operator");
        self.cancel.cancel();
    }

    pub fn status(&self) -> OperatorStatus {
        self.status.borrow().clone()
    }

    /// Receiver of every status change.
    pub fn subscribe(&self) -> watch::Receiver<OperatorStatus> {
        self.status.clone()
    }

    /// Waits for the terminal state.
    pub async fn wait(self) -> OperatorStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => OperatorStatus::Failed(format!("operator supervisor aborted: {e}")),
        }
    }
}

//! Engine entry points: a long-running worker over stdin and a one-shot run.

use anyhow::{Context, Result, bail};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use kiln_config::EngineConfig;
use kiln_core::Task;
use kiln_scheduler::{Admission, ChannelNotifier, Delivery, TaskEngine, WorkerContext, WorkerRegistry};

use crate::collaborators;

const DELIVERY_BUFFER: usize = 256;

/// How long queued deliveries may take to flush at exit.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Decode one envelope line. Blank lines yield `None`.
pub fn parse_envelope(line: &str) -> Result<Option<Task>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let task: Task = serde_json::from_str(line).context("Malformed task envelope")?;
    Ok(Some(task))
}

/// Write every delivery to `out` as one JSON line.
fn spawn_printer<W>(mut rx: mpsc::Receiver<Delivery>, mut out: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            let mut line = match serde_json::to_vec(&delivery) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode delivery");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = out.write_all(&line).await {
                warn!(error = %e, "Failed to write delivery");
                return;
            }
            if let Err(e) = out.flush().await {
                warn!(error = %e, "Failed to flush delivery");
            }
        }
    })
}

async fn engine(
    config: EngineConfig,
    database_url: Option<String>,
) -> Result<(TaskEngine, JoinHandle<()>)> {
    let (notifier, rx) = ChannelNotifier::new(DELIVERY_BUFFER);
    let collab = collaborators::build(&config, database_url.as_deref(), Arc::new(notifier)).await?;
    let registry = WorkerRegistry::builtin(&config);
    let ctx = WorkerContext::new(config, collab);
    let printer = spawn_printer(rx, tokio::io::stdout());
    Ok((TaskEngine::new(ctx, registry), printer))
}

/// Drop the engine so the delivery channel closes, then let the printer
/// drain what is queued.
async fn flush(engine: TaskEngine, printer: JoinHandle<()>) {
    drop(engine);
    if tokio::time::timeout(FLUSH_TIMEOUT, printer).await.is_err() {
        warn!("Timed out flushing deliveries");
    }
}

/// Submit envelopes from `input` until it closes or `interrupt` resolves.
///
/// The interrupt is watched on its own task, so it shuts the engine down
/// even while a submission is held waiting for a slot. Returns whether the
/// engine was interrupted.
async fn feed<R, S>(engine: &TaskEngine, input: R, interrupt: S) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()> + Send + 'static,
{
    let mut watcher = {
        let engine = engine.clone();
        tokio::spawn(async move {
            interrupt.await;
            info!("Interrupted, handing in-flight tasks back");
            let drained = engine.shutdown().await;
            info!(drained, "Engine drained");
        })
    };

    let mut lines = input.lines();
    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut watcher => break Ok(true),
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(false),
                    Err(e) => break Err(e),
                };
                let task = match parse_envelope(&line) {
                    Ok(Some(task)) => task,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Skipping envelope");
                        continue;
                    }
                };
                match engine.submit(task).await {
                    Admission::Accepted => {}
                    Admission::Shed => info!("Task shed for redelivery"),
                    Admission::Duplicate => info!("Duplicate task ignored"),
                }
            }
        }
    };
    if !matches!(outcome, Ok(true)) {
        watcher.abort();
    }
    outcome.context("Failed to read task envelopes")
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Read envelopes from stdin until EOF or ctrl-c.
pub async fn serve(config: EngineConfig, database_url: Option<String>) -> Result<()> {
    let capacity = config.max_concurrent_tasks;
    let (engine, printer) = engine(config, database_url).await?;
    info!(capacity, "Worker started, reading task envelopes from stdin");

    let input = BufReader::new(tokio::io::stdin());
    if !feed(&engine, input, ctrl_c()).await? {
        info!("Input closed, waiting for in-flight tasks");
        engine.wait_idle().await;
    }
    let stats = engine.stats();
    info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        panicked = stats.panicked,
        shed = stats.shed,
        "Worker stopped"
    );
    flush(engine, printer).await;
    Ok(())
}

/// Run one envelope to completion.
pub async fn run_once(config: EngineConfig, database_url: Option<String>, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read envelope: {}", path.display()))?;
    let task = parse_envelope(&content)?
        .with_context(|| format!("Envelope file is empty: {}", path.display()))?;
    info!(task_id = %task.id, task_type = %task.task_type, "Running task");

    let (engine, printer) = engine(config, database_url).await?;
    if engine.submit(task).await != Admission::Accepted {
        flush(engine, printer).await;
        bail!("Task was not admitted");
    }
    engine.wait_idle().await;
    let stats = engine.stats();
    flush(engine, printer).await;

    if stats.succeeded == 1 {
        Ok(())
    } else {
        bail!("Task failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::event::MemoryEventSink;
    use kiln_core::job::{BuildJob, BuildJobScheduler, JobHandle, JobStatus};
    use kiln_core::{Error, EventLogger, Outbound, StaticHostAliases, TaskType, WorkerTask};
    use kiln_db::MemoryStore;
    use kiln_executor::NerdctlImageOps;
    use kiln_scheduler::{Collaborators, RetryPolicy, SlotMode, TaskPolicy};
    use kiln_source::ProcessRunner;
    use tokio::sync::{Notify, oneshot};

    struct NoJobs;

    #[async_trait]
    impl BuildJobScheduler for NoJobs {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn submit(&self, _job: BuildJob) -> kiln_core::Result<JobHandle> {
            Err(Error::Internal("no build jobs here".into()))
        }

        async fn status(&self, _handle: &JobHandle) -> kiln_core::Result<JobStatus> {
            Err(Error::Internal("no build jobs here".into()))
        }

        async fn wait(&self, _handle: &JobHandle) -> kiln_core::Result<JobStatus> {
            Err(Error::Internal("no build jobs here".into()))
        }

        async fn cancel(&self, _handle: &JobHandle) -> kiln_core::Result<()> {
            Ok(())
        }
    }

    /// Holds its slot until the gate opens.
    struct GatedWorker {
        logger: EventLogger,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl WorkerTask for GatedWorker {
        fn name(&self) -> &str {
            "gated"
        }

        fn logger(&self) -> &EventLogger {
            &self.logger
        }

        async fn run(&self, _timeout: Duration) -> kiln_core::Result<()> {
            self.gate.notified().await;
            Ok(())
        }

        async fn stop(&self) -> kiln_core::Result<()> {
            Ok(())
        }

        async fn on_error(&self, _err: &Error) {}
    }

    fn gated_engine(gate: Arc<Notify>) -> (TaskEngine, mpsc::Receiver<Delivery>) {
        let (notifier, rx) = ChannelNotifier::new(16);
        let store = Arc::new(MemoryStore::new());
        let collab = Collaborators {
            runner: Arc::new(ProcessRunner),
            jobs: Arc::new(NoJobs),
            image_ops: Arc::new(NerdctlImageOps::default()),
            versions: store.clone(),
            plugins: store.clone(),
            workloads: store,
            notifier: Arc::new(notifier),
            host_aliases: Arc::new(StaticHostAliases::default()),
            events: Arc::new(MemoryEventSink::new()),
        };
        let mut config = EngineConfig::default();
        config.max_concurrent_tasks = 1;

        let mut registry = WorkerRegistry::empty();
        let policy = TaskPolicy {
            retry: RetryPolicy::attempts(1),
            slot: SlotMode::Hold,
        };
        registry
            .register("gated", policy, move |task: &Task, ctx: &WorkerContext| {
                Ok(Box::new(GatedWorker {
                    logger: ctx.logger(&task.event_id()),
                    gate: gate.clone(),
                }) as Box<dyn WorkerTask>)
            })
            .unwrap();
        (TaskEngine::new(WorkerContext::new(config, collab), registry), rx)
    }

    #[test]
    fn test_parse_envelope() {
        let line = r#"{"task_id":"t-1","task_type":"build-from-image","task_body":{"event_id":"ev","image":"nginx"}}"#;
        let task = parse_envelope(line).unwrap().unwrap();
        assert_eq!(task.id.to_string(), "t-1");
        assert_eq!(task.known_type(), Some(TaskType::BuildFromImage));
        assert_eq!(task.event_id(), "ev");
    }

    #[test]
    fn test_blank_and_malformed_lines() {
        assert!(parse_envelope("   ").unwrap().is_none());
        assert!(parse_envelope("{not json").is_err());
    }

    #[tokio::test]
    async fn test_printer_writes_json_lines() {
        let (tx, rx) = mpsc::channel(4);
        let (client, mut server) = tokio::io::duplex(4096);
        let printer = spawn_printer(rx, client);

        tx.send(Delivery::Publish {
            message: Outbound::ShareResult {
                event_id: "ev".into(),
                share_id: "sh".into(),
                success: true,
                location: None,
                message: String::new(),
            },
        })
        .await
        .unwrap();
        drop(tx);
        printer.await.unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["type"], "publish");
        assert_eq!(value["message"]["kind"], "share_result");
    }

    /// Keeps what it is given but refuses every flush.
    #[derive(Clone, Default)]
    struct NoFlush(Arc<std::sync::Mutex<Vec<u8>>>);

    impl AsyncWrite for NoFlush {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("broken pipe")))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_printer_keeps_going_when_flush_fails() {
        let (tx, rx) = mpsc::channel(4);
        let out = NoFlush::default();
        let printer = spawn_printer(rx, out.clone());

        for id in ["t-1", "t-2"] {
            tx.send(Delivery::Redeliver {
                task: Task::new("gated", serde_json::json!({})).with_id(id),
            })
            .await
            .unwrap();
        }
        drop(tx);
        printer.await.unwrap();

        let written = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_reaches_a_held_submission() {
        let gate = Arc::new(Notify::new());
        let (engine, mut rx) = gated_engine(gate.clone());
        let (mut writer, reader) = tokio::io::duplex(4096);
        writer
            .write_all(
                b"{\"task_id\":\"t-1\",\"task_type\":\"gated\",\"task_body\":{}}\n\
                  {\"task_id\":\"t-2\",\"task_type\":\"gated\",\"task_body\":{}}\n",
            )
            .await
            .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let feeder = engine.clone();
        let fed = tokio::spawn(async move {
            let interrupt = async move {
                let _ = stop_rx.await;
            };
            feed(&feeder, BufReader::new(reader), interrupt).await
        });

        // The second task is shed and its submission held for a slot.
        match rx.recv().await.unwrap() {
            Delivery::Redeliver { task } => assert_eq!(task.id.as_str(), "t-2"),
            other => panic!("unexpected delivery: {:?}", other),
        }
        stop_tx.send(()).unwrap();

        let interrupted = tokio::time::timeout(Duration::from_secs(5), fed)
            .await
            .expect("interrupt was not observed")
            .unwrap()
            .unwrap();
        assert!(interrupted);
        match rx.recv().await.unwrap() {
            Delivery::Redeliver { task } => assert_eq!(task.id.as_str(), "t-1"),
            other => panic!("unexpected delivery: {:?}", other),
        }
        assert_eq!(engine.stats().drained, 1);
        drop(writer);
    }

    #[tokio::test]
    async fn test_closed_input_ends_feed_without_interrupt() {
        let (engine, _rx) = gated_engine(Arc::new(Notify::new()));
        let input: &[u8] = b"\n{not json\n";
        let interrupted = feed(&engine, input, std::future::pending::<()>()).await.unwrap();
        assert!(!interrupted);
        assert_eq!(engine.stats().submitted, 0);
    }
}

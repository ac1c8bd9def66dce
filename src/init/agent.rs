// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::bounded;
use crate::exporters::elasticsearch::{BulkSender, SenderWorker};
use crate::init::config::Config;
use crate::init::wait::{self, TaskSet};
use crate::tailer::{Coordinator, Persister, PositionStore};
use crate::topology::buffer::EventBuffer;
use crate::topology::dispatcher::Dispatcher;

/// Time allowed for the final checkpoint, on top of the shutdown grace.
pub const PERSISTER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Agent {
    config: Config,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs the pipeline until `agent_cancel` fires or any task fails, then
    /// shuts it down stage by stage: tailer, dispatcher, senders and finally
    /// the checkpoint persister. Returns the first error seen.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let config = self.config;
        info!(
            env = %config.env,
            roots = ?config.logs_path,
            state_path = %config.state_path.display(),
            host = %config.elasticsearch.host,
            port = config.elasticsearch.port,
            index = %config.elasticsearch.index_name,
            workers = config.elasticsearch.workers,
            "Starting logfwd agent."
        );

        let store = PositionStore::shared();
        let (buffer, queue) = EventBuffer::new(config.event_queue_len());
        let (batch_tx, batch_rx) = bounded(config.batch_queue_len());

        let sender = BulkSender::new(config.bulk_sender_config())?;

        // loads the checkpoint before the persister exists, so a checkpoint
        // that cannot be read is never replaced
        let overflow = buffer.clone();
        let mut coordinator = Coordinator::new(config.tailer_config(), store.clone(), buffer);
        coordinator.recover()?;

        let tailer_cancel = CancellationToken::new();
        let dispatcher_cancel = CancellationToken::new();
        let senders_shutdown = CancellationToken::new();
        let persister_cancel = CancellationToken::new();

        let mut persister_task = TaskSet::new();
        let mut sender_tasks = TaskSet::new();
        let mut dispatcher_task = TaskSet::new();
        let mut tailer_task = TaskSet::new();

        {
            let mut persister = Persister::new(
                store.clone(),
                config.state_path.clone(),
                config.persister_config(),
            );
            let token = persister_cancel.clone();
            persister_task.spawn(async move { persister.run(token).await.map_err(BoxError::from) });
        }

        for id in 0..config.elasticsearch.workers {
            let mut worker = SenderWorker::new(id, sender.clone(), batch_rx.clone());
            let token = senders_shutdown.clone();
            sender_tasks.spawn(async move { worker.run(token).await });
        }
        drop(batch_rx);

        {
            let mut dispatcher = Dispatcher::new(queue, batch_tx, config.dispatcher_config());
            let token = dispatcher_cancel.clone();
            dispatcher_task.spawn(async move { dispatcher.run(token).await });
        }

        {
            let token = tailer_cancel.clone();
            tailer_task
                .spawn(async move { coordinator.run(token).await.map_err(BoxError::from) });
        }

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut tailer_task) => {
                result = early_exit("tailer", e);
            },
            e = wait::wait_for_any_task(&mut dispatcher_task) => {
                result = early_exit("dispatcher", e);
            },
            e = wait::wait_for_any_task(&mut sender_tasks) => {
                result = early_exit("sender worker", e);
            },
            e = wait::wait_for_any_task(&mut persister_task) => {
                result = early_exit("checkpoint persister", e);
            },
        }

        let started = Instant::now();
        let hard_stop = started + config.shutdown_timeout();
        info!(timeout = ?config.shutdown_timeout(), "Shutting down.");

        // failed sends are logged and skipped from here on
        senders_shutdown.cancel();

        // Step one, stop reading. Followers run one last read pass.
        tailer_cancel.cancel();
        let res = wait::wait_for_tasks_with_deadline(&mut tailer_task, hard_stop).await;
        keep_first(&mut result, "tailer", res);
        if !tailer_task.is_empty() {
            warn!("Tailer did not stop in time, aborting.");
            tailer_task.shutdown().await;
        }

        // Step two, flush what is buffered. The dispatcher closes the batch
        // queue when it returns.
        dispatcher_cancel.cancel();
        let res = wait::wait_for_tasks_with_deadline(&mut dispatcher_task, hard_stop).await;
        keep_first(&mut result, "dispatcher", res);
        if !dispatcher_task.is_empty() {
            warn!("Dispatcher did not stop in time, aborting.");
            dispatcher_task.shutdown().await;
        }

        // Step three, senders drain the closed batch queue.
        let res = wait::wait_for_tasks_with_deadline(&mut sender_tasks, hard_stop).await;
        keep_first(&mut result, "sender workers", res);
        if !sender_tasks.is_empty() {
            warn!(
                remaining = sender_tasks.len(),
                "Sender workers did not drain in time, aborting."
            );
            sender_tasks.shutdown().await;
        }

        // Last, the final checkpoint, once nothing moves offsets anymore.
        persister_cancel.cancel();
        let res =
            wait::wait_for_tasks_with_timeout(&mut persister_task, PERSISTER_STOP_TIMEOUT).await;
        keep_first(&mut result, "checkpoint persister", res);
        if !persister_task.is_empty() {
            error!("Checkpoint persister did not stop in time, aborting.");
            persister_task.shutdown().await;
        }

        info!(
            duration = ?started.elapsed(),
            files = store.len(),
            dropped = overflow.dropped(),
            "Shutdown complete."
        );
        result
    }
}

fn early_exit(task: &str, res: Result<(), BoxError>) -> Result<(), BoxError> {
    match res {
        Ok(()) => {
            warn!(task, "Unexpected early exit of task.");
            Err(format!("{} exited unexpectedly", task).into())
        }
        Err(e) => {
            error!(task, error = %e, "Task failed, shutting down.");
            Err(e)
        }
    }
}

fn keep_first(result: &mut Result<(), BoxError>, stage: &str, res: Result<(), BoxError>) {
    if let Err(e) = res {
        warn!(stage, error = %e, "Shutdown stage finished with error.");
        if result.is_ok() {
            *result = Err(e);
        }
    }
}

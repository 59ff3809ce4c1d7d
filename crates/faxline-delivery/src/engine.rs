//! Worker pool draining a queue of delivery tasks.
//!
//! ```text
//! ┌─────────────────┐  submit  ┌──────────────┐  recv  ┌──────────┐
//! │ LifecycleManager│ ───────▶ │ mpsc queue   │ ─────▶ │ workers  │──▶ DeliveryDispatcher
//! └─────────────────┘          └──────────────┘        └──────────┘
//! ```
//!
//! Producers hold a cheap [`TaskSender`]. Transition calls only enqueue, so
//! slow receivers never stall the lifecycle. On shutdown the workers stop
//! waiting for new tasks, drain what is already queued and exit.

use std::{sync::Arc, time::Duration};

use faxline_core::DeliveryTask;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::ClientConfig,
    dispatcher::{DeliveryDispatcher, DispatcherStats},
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
    suppression::SuppressionPolicy,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Tasks buffered before `submit` waits.
    pub queue_capacity: usize,

    /// Maximum time to wait for workers to drain on shutdown.
    pub shutdown_timeout: Duration,

    /// HTTP client configuration.
    pub client: ClientConfig,

    /// Endpoint suppression thresholds.
    pub suppression: SuppressionPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: Duration::from_secs(30),
            client: ClientConfig::default(),
            suppression: SuppressionPolicy::default(),
        }
    }
}

/// Producer handle for the delivery queue.
#[derive(Debug, Clone)]
pub struct TaskSender {
    sender: mpsc::Sender<DeliveryTask>,
}

impl TaskSender {
    /// Enqueues one task, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the engine has shut down.
    pub async fn submit(&self, task: DeliveryTask) -> Result<()> {
        self.sender.send(task).await.map_err(|_| DeliveryError::QueueClosed)
    }

    /// Enqueues tasks in order.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the engine has shut down; tasks before the
    /// failing one stay queued.
    pub async fn submit_all(&self, tasks: impl IntoIterator<Item = DeliveryTask>) -> Result<()> {
        for task in tasks {
            self.submit(task).await?;
        }
        Ok(())
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<DeliveryTask>>>;

/// Delivery worker pool.
pub struct DeliveryEngine<S> {
    dispatcher: Arc<DeliveryDispatcher<S>>,
    config: DeliveryConfig,
    sender: mpsc::Sender<DeliveryTask>,
    receiver: SharedReceiver,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl<S: DeliveryStorage> DeliveryEngine<S> {
    /// Creates an engine; call [`Self::start`] to spawn workers.
    pub fn new(dispatcher: Arc<DeliveryDispatcher<S>>, config: DeliveryConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        Self {
            dispatcher,
            config,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Returns a producer handle.
    pub fn sender(&self) -> TaskSender {
        TaskSender { sender: self.sender.clone() }
    }

    /// Enqueues one task.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` if the queue no longer accepts tasks.
    pub async fn submit(&self, task: DeliveryTask) -> Result<()> {
        self.sender().submit(task).await
    }

    /// Spawns the configured number of workers.
    pub fn start(&mut self) {
        let worker_count = self.config.worker_count.max(1);
        info!(worker_count, "starting delivery workers");

        for worker_id in 0..worker_count {
            let dispatcher = self.dispatcher.clone();
            let receiver = self.receiver.clone();
            let token = self.cancellation_token.clone();

            self.worker_handles.push(tokio::spawn(async move {
                debug!(worker_id, "delivery worker starting");
                run_worker(worker_id, &dispatcher, &receiver, &token).await;
                debug!(worker_id, "delivery worker stopped");
            }));
        }
    }

    /// True while any worker is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }

    /// Counters of the underlying dispatcher.
    pub async fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats().await
    }

    /// Stops the workers after they drain the queue.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if draining exceeds the configured timeout (the
    /// remaining workers are aborted), `WorkerPanic` if a worker panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down delivery engine"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        let Ok(results) = joined else {
            error!(timeout_seconds = timeout.as_secs(), "delivery workers did not drain in time");
            for abort in aborts {
                abort.abort();
            }
            return Err(DeliveryError::ShutdownTimeout { timeout });
        };

        let mut first_panic = None;
        for (worker_id, result) in results.into_iter().enumerate() {
            if let Err(join_error) = result {
                error!(worker_id, error = %join_error, "delivery worker panicked");
                first_panic.get_or_insert(DeliveryError::WorkerPanic {
                    worker_id,
                    error: join_error.to_string(),
                });
            }
        }

        match first_panic {
            Some(err) => Err(err),
            None => {
                info!("delivery engine stopped");
                Ok(())
            },
        }
    }
}

async fn run_worker<S: DeliveryStorage>(
    worker_id: usize,
    dispatcher: &DeliveryDispatcher<S>,
    receiver: &SharedReceiver,
    token: &CancellationToken,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                task = receiver.recv() => task,
            }
        };

        let Some(task) = next else { break };
        deliver(worker_id, dispatcher, &task).await;
    }

    // Drain whatever producers queued before shutdown.
    loop {
        let next = receiver.lock().await.try_recv().ok();
        let Some(task) = next else { break };
        deliver(worker_id, dispatcher, &task).await;
    }
}

async fn deliver<S: DeliveryStorage>(
    worker_id: usize,
    dispatcher: &DeliveryDispatcher<S>,
    task: &DeliveryTask,
) {
    let result = dispatcher.deliver(task).await;
    if !result.is_delivered() {
        warn!(
            worker_id,
            transmission_id = %task.transmission_id,
            event = %task.event,
            ?result,
            "delivery task not delivered"
        );
    }
}

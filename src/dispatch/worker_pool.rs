use crate::config::WorkerPoolSettings;
use crate::consumers::{ConsumerDescriptor, Delivery};
use crate::dispatch::{
    Admission, AdmissionToken, BrokerAction, DispatchError, TaskExecutor, TaskPayload,
};
use futures_util::{future::join_all, Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A delivery on its way to a worker.
struct Envelope {
    delivery: Delivery,
    descriptor: Arc<ConsumerDescriptor>,
    /// Released when the envelope is dropped, once processing is over.
    token: Option<AdmissionToken>,
    /// The worker slot reserved for this delivery.
    worker: AdmissionToken,
}

/// A fixed set of workers processing the deliveries of every attached consumer.
///
/// The number of workers is independent of the number of consumers: all of them drain a
/// single queue. A delivery only enters the queue once a worker is free to take it, so busy
/// workers leave deliveries with their consumer.
pub struct WorkerPool {
    queue: Mutex<Option<mpsc::Sender<Envelope>>>,
    idle_workers: Admission,
    stop: watch::Sender<bool>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `settings.num_workers` workers (at least one).
    pub fn new(executor: Arc<dyn TaskExecutor>, settings: &WorkerPoolSettings) -> Self {
        let num_workers = settings.num_workers.max(1);
        let (sender, receiver) = mpsc::channel(num_workers);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let exec_timeout = settings.exec_timeout();
        let workers = (0..num_workers)
            .map(|_| {
                tokio::spawn(work(
                    Arc::clone(&receiver),
                    Arc::clone(&executor),
                    exec_timeout,
                ))
            })
            .collect();
        let (stop, _) = watch::channel(false);
        Self {
            queue: Mutex::new(Some(sender)),
            idle_workers: Admission::new(num_workers),
            stop,
            forwarders: Mutex::new(Vec::new()),
            workers: Mutex::new(workers),
        }
    }

    /// Dispatch the deliveries of a consumer to the workers.
    ///
    /// If `descriptor.concurrency` is greater than zero, at most that many deliveries from this
    /// stream are being processed at any point in time.
    pub fn attach<S>(&self, deliveries: S, descriptor: Arc<ConsumerDescriptor>)
    where
        S: Stream<Item = Delivery> + Send + Unpin + 'static,
    {
        let Some(queue) = lock(&self.queue).clone() else {
            warn!(queue = %descriptor.queue, "The worker pool is closed, deliveries will not be dispatched");
            return;
        };
        let admission =
            (descriptor.concurrency > 0).then(|| Admission::new(descriptor.concurrency));
        let forwarder = tokio::spawn(forward(
            deliveries,
            descriptor,
            admission,
            self.idle_workers.clone(),
            queue,
            self.stop.subscribe(),
        ));
        lock(&self.forwarders).push(forwarder);
    }

    /// Stop dispatching and wait for the deliveries already dispatched to be processed.
    ///
    /// Attached streams are not read anymore: a delivery taken from a stream but not yet
    /// dispatched is nacked and requeued.
    pub async fn wait_close(&self) {
        self.stop.send_replace(true);

        let forwarders = std::mem::take(&mut *lock(&self.forwarders));
        for outcome in join_all(forwarders).await {
            if let Err(e) = outcome {
                error!(error = %e, "A delivery forwarder crashed");
            }
        }

        // Workers exit once the queue is closed and drained.
        drop(lock(&self.queue).take());
        let workers = std::mem::take(&mut *lock(&self.workers));
        for outcome in join_all(workers).await {
            if let Err(e) = outcome {
                error!(error = %e, "A worker crashed");
            }
        }
        debug!("Worker pool closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Move the deliveries of a single consumer into the shared queue.
async fn forward<S>(
    mut deliveries: S,
    descriptor: Arc<ConsumerDescriptor>,
    admission: Option<Admission>,
    idle_workers: Admission,
    queue: mpsc::Sender<Envelope>,
    mut stop: watch::Receiver<bool>,
) where
    S: Stream<Item = Delivery> + Unpin,
{
    debug!(
        queue = %descriptor.queue,
        concurrency = admission.as_ref().map(Admission::limit),
        workers = idle_workers.limit(),
        "Dispatching deliveries"
    );
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            next = deliveries.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let token = match &admission {
            None => None,
            Some(admission) => tokio::select! {
                biased;
                _ = stopped(&mut stop) => None,
                token = admission.acquire() => token.ok(),
            },
        };
        if admission.is_some() && token.is_none() {
            requeue(&delivery, &descriptor).await;
            break;
        }

        let slot = tokio::select! {
            biased;
            _ = stopped(&mut stop) => None,
            slot = async {
                let worker = idle_workers.acquire().await.ok()?;
                let slot = queue.reserve().await.ok()?;
                Some((worker, slot))
            } => slot,
        };
        match slot {
            Some((worker, slot)) => slot.send(Envelope {
                delivery,
                descriptor: Arc::clone(&descriptor),
                token,
                worker,
            }),
            None => {
                requeue(&delivery, &descriptor).await;
                break;
            }
        }
    }
    debug!(queue = %descriptor.queue, "Delivery forwarder stopped");
}

async fn requeue(delivery: &Delivery, descriptor: &ConsumerDescriptor) {
    if descriptor.auto_ack {
        return;
    }
    if let Err(e) = delivery.nack(true).await {
        error!(
            queue = %descriptor.queue,
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Failed to nack an undispatched delivery"
        );
    }
}

async fn work(
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    executor: Arc<dyn TaskExecutor>,
    exec_timeout: Duration,
) {
    loop {
        let envelope = queue.lock().await.recv().await;
        let Some(envelope) = envelope else {
            break;
        };
        // Processing runs as its own task: a panicking executor does not take the worker down.
        let processing = tokio::spawn(do_work(envelope, Arc::clone(&executor), exec_timeout));
        if let Err(e) = processing.await {
            error!(error = %e, "Processing of a delivery panicked");
        }
    }
}

/// Process a delivery - executor call, ack/nack/reject against the AMQP broker.
#[tracing::instrument(
    name = "process_delivery",
    skip_all,
    fields(queue = %envelope.descriptor.queue, delivery_tag = envelope.delivery.delivery_tag),
    level = tracing::Level::DEBUG
)]
async fn do_work(envelope: Envelope, executor: Arc<dyn TaskExecutor>, exec_timeout: Duration) {
    let Envelope {
        delivery,
        descriptor,
        token,
        worker,
    } = envelope;

    if delivery.is_channel_closed() {
        debug!("The delivery channel is closed, dropping the delivery");
        return;
    }

    let action = match execute(&delivery, &descriptor, executor.as_ref(), exec_timeout).await {
        Ok(action) => action,
        Err(e) => {
            error!(error = ?e, "Failed to process the delivery");
            BrokerAction::on_failure(descriptor.requeue_on_fail)
        }
    };

    if descriptor.auto_ack {
        debug!(action = ?action, "Auto-ack consumer, nothing to settle");
    } else if let Err(e) = action.apply(&delivery).await {
        error!(action = ?action, error = %e, "Failed to settle the delivery with the broker");
    }

    drop(token);
    drop(worker);
}

async fn execute(
    delivery: &Delivery,
    descriptor: &ConsumerDescriptor,
    executor: &dyn TaskExecutor,
    exec_timeout: Duration,
) -> Result<BrokerAction, DispatchError> {
    let payload = TaskPayload::from_delivery(delivery, descriptor)?;
    let result = tokio::time::timeout(exec_timeout, executor.exec(payload))
        .await
        .map_err(|_| DispatchError::Timeout(exec_timeout))?
        .map_err(DispatchError::Executor)?;
    if result.streamed {
        return Err(DispatchError::Streaming);
    }
    BrokerAction::from_status(&result.body)
}

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::services::notification::BookingEventPublisher;
use crate::services::queue::QueueTransport;
use crate::services::store::BookingStore;
use crate::services::worker::BookingIngestionWorker;
use crate::{BookingQueueError, Delivery, QueueStats, WorkerConfig};

/// A received delivery together with its share of the in-flight budget.
struct Admitted {
    delivery: Delivery,
    in_flight: OwnedSemaphorePermit,
}

struct Lane {
    sender: mpsc::UnboundedSender<Admitted>,
    handle: JoinHandle<()>,
}

type Lanes = HashMap<String, Lane>;
type Retired = HashMap<String, JoinHandle<()>>;

/// Long-running consumer: pulls deliveries in transport order and routes each
/// to the task that owns its lane.
///
/// One task per active lane processes deliveries strictly in order. Handing a
/// delivery to a lane never waits, so a slow lane cannot hold up the others;
/// backpressure comes from the in-flight budget taken before each receive.
/// An idle lane closes itself; a replacement for the same lane waits for the
/// old task to finish before touching its first delivery.
///
/// Only the holder of the transport's consumer lease receives. Other
/// instances stand by until the lease is released or lapses.
pub struct BookingConsumerService {
    worker: Arc<BookingIngestionWorker>,
    queue: Arc<dyn QueueTransport>,
    config: WorkerConfig,
    lane_slots: Arc<Semaphore>,
    in_flight: Arc<Semaphore>,
    is_running: RwLock<bool>,
    stopped: watch::Sender<bool>,
}

impl BookingConsumerService {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn QueueTransport>,
        store: Arc<dyn BookingStore>,
        events: BookingEventPublisher,
    ) -> Self {
        let worker = Arc::new(BookingIngestionWorker::new(
            config.clone(),
            Arc::clone(&queue),
            store,
            events,
        ));
        let (stopped, _) = watch::channel(true);

        Self {
            worker,
            queue,
            lane_slots: Arc::new(Semaphore::new(config.max_concurrent_lanes)),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            is_running: RwLock::new(false),
            stopped,
        }
    }

    pub fn worker(&self) -> Arc<BookingIngestionWorker> {
        Arc::clone(&self.worker)
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Runs the dispatch loop until [`shutdown`](Self::shutdown) is called.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), BookingQueueError> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                warn!("Consumer service is already running");
                return Ok(());
            }
            *running = true;
        }
        self.stopped.send_replace(false);

        info!("Starting booking consumer with worker {}", self.config.worker_id);

        let wait = Duration::from_millis(self.config.receive_wait_ms);
        let lease_ttl = Duration::from_secs(self.config.consumer_lease_secs);
        let renew_every = lease_ttl / 3;
        let mut lease_renewed_at: Option<Instant> = None;
        let mut lanes = Lanes::new();
        let mut retired = Retired::new();
        let mut failures: u32 = 0;

        while *self.is_running.read().await {
            prune_finished(&mut lanes, &mut retired);

            if lease_renewed_at.map_or(true, |at| at.elapsed() >= renew_every) {
                let held = lease_renewed_at.is_some();
                match self.queue.claim_consumer(&self.config.worker_id, lease_ttl).await {
                    Ok(true) => {
                        if !held {
                            info!("Worker {} holds the consumer lease", self.config.worker_id);
                            self.recover().await;
                        }
                        lease_renewed_at = Some(Instant::now());
                    }
                    Ok(false) => {
                        if held {
                            error!("Consumer lease taken over by another instance; finishing local lanes");
                            self.drain(std::mem::take(&mut lanes), std::mem::take(&mut retired)).await;
                        } else {
                            debug!("Consumer lease held by another instance; standing by");
                        }
                        lease_renewed_at = None;
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to refresh consumer lease: {}", e);
                        if !held {
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                    }
                }
            }

            let Ok(Ok(permit)) =
                tokio::time::timeout(wait, Arc::clone(&self.in_flight).acquire_owned()).await
            else {
                debug!("In-flight budget exhausted; waiting for lanes to settle");
                continue;
            };

            match self.queue.receive(wait).await {
                Ok(Some(delivery)) => {
                    failures = 0;
                    self.dispatch(Admitted { delivery, in_flight: permit }, &mut lanes, &mut retired);
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    failures += 1;
                    let delay = self.config.retry_delay(failures).min(Duration::from_secs(5));
                    error!("Failed to receive from booking queue: {}; backing off {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.drain(lanes, retired).await;
        if let Err(e) = self.queue.release_consumer(&self.config.worker_id).await {
            warn!("Failed to release consumer lease: {}", e);
        }
        self.stopped.send_replace(true);
        info!("Booking consumer stopped");
        Ok(())
    }

    /// Stops receiving and waits, bounded, for every lane to finish its backlog.
    /// Anything left in flight is recovered by the next lease holder.
    pub async fn shutdown(&self) -> Result<(), BookingQueueError> {
        info!("Initiating consumer service shutdown");

        {
            let mut running = self.is_running.write().await;
            *running = false;
        }

        let timeout = Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);
        let mut stopped = self.stopped.subscribe();
        if tokio::time::timeout(timeout, stopped.wait_for(|done| *done)).await.is_err() {
            warn!("Consumer did not stop within {:?}", timeout);
        }

        info!("Consumer service shutdown complete");
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, BookingQueueError> {
        self.queue.stats().await
    }

    async fn recover(&self) {
        match self.queue.recover_in_flight().await {
            Ok(0) => {}
            Ok(recovered) => info!("Returned {} abandoned deliveries to the queue", recovered),
            Err(e) => error!("Failed to recover in-flight deliveries: {}", e),
        }
    }

    fn dispatch(&self, admitted: Admitted, lanes: &mut Lanes, retired: &mut Retired) {
        let key = admitted.delivery.group_key.clone();

        let admitted = match lanes.get(&key) {
            Some(lane) => {
                let sent = lane.sender.send(admitted);
                match sent {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => {
                        // The lane closed itself after idling.
                        if let Some(closed) = lanes.remove(&key) {
                            retired.insert(key.clone(), closed.handle);
                        }
                        returned
                    }
                }
            }
            None => admitted,
        };

        let lane = self.spawn_lane(key.clone(), retired.remove(&key));
        if let Err(mpsc::error::SendError(lost)) = lane.sender.send(admitted) {
            error!("Lane {} rejected message {}; left in flight", key, lost.delivery.message_id);
        }
        lanes.insert(key, lane);
    }

    fn spawn_lane(&self, key: String, predecessor: Option<JoinHandle<()>>) -> Lane {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Admitted>();
        let worker = Arc::clone(&self.worker);
        let slots = Arc::clone(&self.lane_slots);
        let idle = Duration::from_secs(self.config.lane_idle_secs.max(1));

        let handle = tokio::spawn(async move {
            if let Some(previous) = predecessor {
                if let Err(e) = previous.await {
                    warn!("Previous task for lane {} ended abnormally: {}", key, e);
                }
            }
            debug!("Lane {} opened", key);

            loop {
                match tokio::time::timeout(idle, receiver.recv()).await {
                    Ok(Some(admitted)) => run_delivery(&worker, &slots, admitted).await,
                    Ok(None) => break,
                    Err(_) => {
                        receiver.close();
                        while let Some(admitted) = receiver.recv().await {
                            run_delivery(&worker, &slots, admitted).await;
                        }
                        break;
                    }
                }
            }

            debug!("Lane {} closed", key);
        });

        Lane { sender, handle }
    }

    async fn drain(&self, lanes: Lanes, retired: Retired) {
        let mut handles: Vec<JoinHandle<()>> = retired.into_values().collect();
        // Dropping the senders lets each lane finish its buffer and exit.
        handles.extend(lanes.into_values().map(|lane| lane.handle));

        if handles.is_empty() {
            return;
        }

        debug!("Draining {} lanes", handles.len());
        let timeout = Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Lane task ended abnormally during drain: {}", e);
                    }
                }
            }
            Err(_) => warn!("Lanes still busy after {:?}; remaining deliveries stay in flight", timeout),
        }
    }
}

async fn run_delivery(worker: &BookingIngestionWorker, slots: &Semaphore, admitted: Admitted) {
    let Admitted { delivery, in_flight } = admitted;
    let _permit = slots.acquire().await.ok();
    let message_id = delivery.message_id;
    let outcome = worker.process_delivery(delivery).await;
    drop(in_flight);
    debug!(outcome = outcome.label(), "Message {} settled", message_id);
}

fn prune_finished(lanes: &mut Lanes, retired: &mut Retired) {
    lanes.retain(|_, lane| !lane.handle.is_finished());
    retired.retain(|_, handle| !handle.is_finished());
}

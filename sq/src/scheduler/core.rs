//! RequestScheduler implementation

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::ratelimit::{ExhaustedPolicy, RateLimitAdmissionController};

use super::backoff::backoff_delay;
use super::config::SchedulerConfig;
use super::queue::{Failure, QueuedItem, RequestResult, SchedulerStats, WorkItem};
use super::work::{Work, WorkOutput, WorkRequest};

/// Pending work, ordered by priority then enqueue sequence
struct QueueInner {
    heap: BinaryHeap<QueuedItem>,
    next_seq: u64,
}

impl QueueInner {
    fn push(&mut self, item: WorkItem) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedItem { seq, item });
    }
}

/// Notification slot for one request id; `None` until the item is terminal
type ResultSlot = watch::Sender<Option<RequestResult>>;

/// Result slots by id, plus terminal ids in the order they finished
struct ResultTable {
    slots: HashMap<String, ResultSlot>,
    retained: VecDeque<String>,
}

impl ResultTable {
    /// Note a terminal result and drop the oldest ones beyond `capacity`
    fn retain_terminal(&mut self, id: String, capacity: usize) {
        self.retained.push_back(id);
        while self.retained.len() > capacity.max(1) {
            let Some(oldest) = self.retained.pop_front() else {
                break;
            };
            // A resubmitted id may be pending again; leave it alone
            if self.slots.get(&oldest).is_some_and(|slot| slot.borrow().is_some()) {
                debug!(id = %oldest, "ResultTable::retain_terminal: evicting oldest result");
                self.slots.remove(&oldest);
            }
        }
    }
}

/// An occupied in-flight slot
///
/// Holds the concurrency permit and the gauge until the attempt has really
/// finished. For blocking work that is when the thread returns, even if the
/// attempt already timed out.
struct FlightSlot {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<AtomicUsize>,
}

impl Drop for FlightSlot {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Priority queue plus bounded worker pool for retryable work items.
///
/// Workers pop the highest-priority item, take an in-flight permit, wait for
/// rate-limit admission when the item carries a class, then run the callable
/// under its timeout. Failures are retried with capped exponential backoff
/// until the item's retry budget is spent.
pub struct RequestScheduler {
    config: SchedulerConfig,
    admission: Arc<RateLimitAdmissionController>,
    queue: Mutex<QueueInner>,
    results: Mutex<ResultTable>,
    stats: Mutex<SchedulerStats>,
    notify: Notify,
    permits: Arc<Semaphore>,
    blocking: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestScheduler {
    /// Create a new scheduler; call [`start`](Self::start) to spawn workers
    pub fn new(config: SchedulerConfig, admission: Arc<RateLimitAdmissionController>) -> Self {
        debug!(?config, "RequestScheduler::new: called");
        let (shutdown, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            blocking: Arc::new(Semaphore::new(config.blocking_threads.max(1))),
            config,
            admission,
            queue: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            results: Mutex::new(ResultTable {
                slots: HashMap::new(),
                retained: VecDeque::new(),
            }),
            stats: Mutex::new(SchedulerStats::default()),
            notify: Notify::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<RateLimitAdmissionController> {
        &self.admission
    }

    /// Queue a work item and return its id without waiting for it to run
    pub async fn submit(&self, request: WorkRequest) -> Result<String, SchedulerError> {
        debug!(id = %request.id, ?request.priority, "RequestScheduler::submit: called");
        let item = WorkItem::from_request(request, &self.config);
        let id = item.id.clone();

        let mut queue = self.queue.lock().await;
        if queue.heap.len() >= self.config.max_queue_size {
            drop(queue);
            debug!(%id, "RequestScheduler::submit: queue full, rejecting");
            self.stats.lock().await.total_rejected += 1;
            return Err(SchedulerError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        {
            let mut results = self.results.lock().await;
            if results.slots.get(&id).is_some_and(|slot| slot.borrow().is_none()) {
                debug!(%id, "RequestScheduler::submit: id still pending, rejecting");
                return Err(SchedulerError::DuplicateRequest { request_id: id });
            }
            let (slot, _) = watch::channel(None);
            results.slots.insert(id.clone(), slot);
        }

        queue.push(item);
        let depth = queue.heap.len();
        drop(queue);

        let mut stats = self.stats.lock().await;
        stats.total_submitted += 1;
        stats.peak_queue_depth = stats.peak_queue_depth.max(depth);
        drop(stats);

        self.notify.notify_one();
        Ok(id)
    }

    /// Wait for the terminal result of `id`
    ///
    /// Wakes as soon as the result is written. `None` waits indefinitely.
    pub async fn await_result(&self, id: &str, timeout: Option<Duration>) -> Result<RequestResult, SchedulerError> {
        debug!(%id, ?timeout, "RequestScheduler::await_result: called");
        let mut rx = {
            let results = self.results.lock().await;
            match results.slots.get(id) {
                Some(slot) => slot.subscribe(),
                None => {
                    return Err(SchedulerError::RequestNotFound {
                        request_id: id.to_string(),
                    });
                }
            }
        };

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx.wait_for(Option::is_some))
                .await
                .map_err(|_| SchedulerError::Timeout {
                    request_id: id.to_string(),
                    timeout: limit,
                })?,
            None => rx.wait_for(Option::is_some).await,
        };

        // A dropped slot means stop() discarded the item
        let result: Option<RequestResult> = waited.map_err(|_| SchedulerError::Stopped)?.clone();
        result.ok_or(SchedulerError::Stopped)
    }

    /// Submit one item and wait for it; the stored result is released afterwards
    pub async fn submit_and_wait(
        &self,
        request: WorkRequest,
        timeout: Option<Duration>,
    ) -> Result<RequestResult, SchedulerError> {
        let id = self.submit(request).await?;
        let result = self.await_result(&id, timeout).await?;
        self.forget_result(&id).await;
        Ok(result)
    }

    /// Submit many items and wait for all of them
    ///
    /// Results come back in the order the requests were given; dispatch order
    /// still follows priority.
    pub async fn submit_batch(
        &self,
        requests: Vec<WorkRequest>,
        timeout: Option<Duration>,
    ) -> Vec<Result<RequestResult, SchedulerError>> {
        debug!(count = requests.len(), "RequestScheduler::submit_batch: called");
        let mut submitted = Vec::with_capacity(requests.len());
        for request in requests {
            submitted.push(self.submit(request).await);
        }

        join_all(submitted.into_iter().map(|submission| async move {
            let id = submission?;
            let result = self.await_result(&id, timeout).await?;
            self.forget_result(&id).await;
            Ok::<_, SchedulerError>(result)
        }))
        .await
    }

    /// Drop a terminal result; pending items are left alone
    pub async fn forget_result(&self, id: &str) -> Option<RequestResult> {
        let mut results = self.results.lock().await;
        if !results.slots.get(id).is_some_and(|slot| slot.borrow().is_some()) {
            return None;
        }
        let slot = results.slots.remove(id)?;
        let result = slot.borrow().clone();
        result
    }

    /// Terminal result for `id`, if it has finished
    pub async fn result(&self, id: &str) -> Option<RequestResult> {
        self.results
            .lock()
            .await
            .slots
            .get(id)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Snapshot of the scheduler counters
    pub async fn stats(&self) -> SchedulerStats {
        let queued = self.queue.lock().await.heap.len();
        let mut stats = self.stats.lock().await.clone();
        stats.queued = queued;
        stats.in_flight = self.in_flight.load(Ordering::SeqCst);
        stats.peak_in_flight = self.peak_in_flight.load(Ordering::SeqCst);
        stats
    }

    pub async fn is_running(&self) -> bool {
        !self.workers.lock().await.is_empty()
    }

    /// Spawn the worker pool; a no-op when already running
    pub async fn start(self: &Arc<Self>) {
        debug!("RequestScheduler::start: called");
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            debug!("RequestScheduler::start: already running");
            return;
        }

        self.shutdown.send_replace(false);
        for worker_id in 0..self.config.max_concurrent_requests {
            let shutdown_rx = self.shutdown.subscribe();
            workers.push(tokio::spawn(Arc::clone(self).worker_loop(worker_id, shutdown_rx)));
        }
        info!(workers = workers.len(), "RequestScheduler started");
    }

    /// Cancel the workers and wait for them to unwind
    ///
    /// Queued items are finalized with [`Failure::Stopped`]. In-flight items
    /// are abandoned without a result; anyone waiting on them gets
    /// [`SchedulerError::Stopped`].
    pub async fn stop(&self) {
        debug!("RequestScheduler::stop: called");
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        if handles.is_empty() {
            debug!("RequestScheduler::stop: not running");
            return;
        }

        self.shutdown.send_replace(true);
        for mut handle in handles {
            if tokio::time::timeout(self.config.shutdown_timeout(), &mut handle)
                .await
                .is_err()
            {
                warn!("Scheduler worker did not stop in time, aborting");
                handle.abort();
            }
        }

        let drained: Vec<WorkItem> = {
            let mut queue = self.queue.lock().await;
            queue.heap.drain().map(|queued| queued.item).collect()
        };
        let mut results = self.results.lock().await;
        for item in &drained {
            if let Some(slot) = results.slots.get(&item.id) {
                debug!(id = %item.id, "RequestScheduler::stop: finalizing undispatched item");
                slot.send_replace(Some(RequestResult::failed(
                    &item.id,
                    Failure::Stopped,
                    Duration::ZERO,
                    item.retry_count,
                )));
                results.retain_terminal(item.id.clone(), self.config.result_retention);
            }
        }
        let before = results.slots.len();
        results.slots.retain(|_, slot| slot.borrow().is_some());
        info!(
            drained = drained.len(),
            abandoned = before - results.slots.len(),
            "RequestScheduler stopped"
        );
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "RequestScheduler::worker_loop: started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(worker_id, "RequestScheduler::worker_loop: shutdown observed");
                    break;
                }
                _ = self.work_once(worker_id) => {}
            }
        }
        debug!(worker_id, "RequestScheduler::worker_loop: exited");
    }

    async fn work_once(&self, worker_id: usize) {
        let Some(item) = self.next_item().await else {
            return;
        };
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(id = %item.id, "In-flight semaphore closed, dropping item");
                return;
            }
        };
        self.dispatch(worker_id, item, permit).await;
    }

    /// Pop the next item, or wait up to one poll interval for a submission
    async fn next_item(&self) -> Option<WorkItem> {
        let notified = self.notify.notified();
        if let Some(queued) = self.queue.lock().await.heap.pop() {
            return Some(queued.item);
        }
        let _ = tokio::time::timeout(self.config.poll_interval(), notified).await;
        None
    }

    async fn dispatch(&self, worker_id: usize, mut item: WorkItem, permit: OwnedSemaphorePermit) {
        debug!(worker_id, id = %item.id, priority = %item.priority, retry = item.retry_count, "RequestScheduler::dispatch: called");

        if let Some(class) = item.rate_limit_class.clone() {
            let wait = self.admission.wait_until_allowed(&class).await;
            if !wait.waited.is_zero() {
                self.stats.lock().await.rate_limit_waits += 1;
            }
            if !wait.admitted {
                match self.admission.exhausted_policy() {
                    ExhaustedPolicy::Proceed => {
                        warn!(id = %item.id, %class, waited = ?wait.waited, "Rate limit still exhausted, proceeding anyway");
                    }
                    ExhaustedPolicy::Fail => {
                        warn!(id = %item.id, %class, waited = ?wait.waited, "Rate limit still exhausted, failing item");
                        let failure = Failure::RateLimitExhausted {
                            class,
                            waited: wait.waited,
                        };
                        self.finalize(RequestResult::failed(&item.id, failure, Duration::ZERO, item.retry_count))
                            .await;
                        return;
                    }
                }
            }
        }

        let started = Instant::now();
        let outcome = self.execute(&item, self.enter_flight(permit)).await;
        let duration = started.elapsed();

        match outcome {
            Ok(output) => {
                if let Some(class) = &item.rate_limit_class {
                    self.admission.record(class, output.quota.as_ref()).await;
                }
                debug!(id = %item.id, ?duration, "RequestScheduler::dispatch: succeeded");
                self.finalize(RequestResult::succeeded(&item.id, output.value, duration, item.retry_count))
                    .await;
            }
            Err(failure) => {
                if let Some(class) = &item.rate_limit_class {
                    self.admission.record(class, None).await;
                }
                if item.can_retry() {
                    item.retry_count += 1;
                    let delay = backoff_delay(item.retry_count, self.config.backoff_base(), self.config.backoff_cap());
                    warn!(id = %item.id, retry = item.retry_count, max_retries = item.max_retries, ?delay, %failure, "Work item failed, retrying");
                    self.stats.lock().await.total_retried += 1;
                    tokio::time::sleep(delay).await;
                    self.requeue(item).await;
                } else {
                    warn!(id = %item.id, retries = item.retry_count, %failure, "Work item failed permanently");
                    self.finalize(RequestResult::failed(&item.id, failure, duration, item.retry_count))
                        .await;
                }
            }
        }
    }

    fn enter_flight(&self, permit: OwnedSemaphorePermit) -> FlightSlot {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        FlightSlot {
            _permit: permit,
            gauge: Arc::clone(&self.in_flight),
        }
    }

    /// Run one attempt under the item's timeout
    ///
    /// The slot is released when the attempt ends, not when the timeout fires.
    async fn execute(&self, item: &WorkItem, slot: FlightSlot) -> Result<WorkOutput, Failure> {
        match &item.work {
            Work::Async(f) => {
                // Building the future happens inside the guarded poll so a
                // callable that panics before returning one is caught too
                let attempt = AssertUnwindSafe(async move {
                    let _slot = slot;
                    f().await
                })
                .catch_unwind();
                match tokio::time::timeout(item.timeout, attempt).await {
                    Ok(Ok(Ok(output))) => Ok(output),
                    Ok(Ok(Err(e))) => Err(Failure::Error(format!("{:#}", e))),
                    Ok(Err(_)) => Err(Failure::Error("work panicked".to_string())),
                    Err(_) => Err(Failure::TimedOut(item.timeout)),
                }
            }
            Work::Blocking(f) => {
                let permit = Arc::clone(&self.blocking)
                    .acquire_owned()
                    .await
                    .map_err(|_| Failure::Error("blocking executor closed".to_string()))?;
                let f = Arc::clone(f);
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let _slot = slot;
                    f()
                });
                match tokio::time::timeout(item.timeout, handle).await {
                    Ok(Ok(Ok(output))) => Ok(output),
                    Ok(Ok(Err(e))) => Err(Failure::Error(format!("{:#}", e))),
                    Ok(Err(join_err)) => Err(Failure::Error(format!("blocking work panicked: {}", join_err))),
                    Err(_) => Err(Failure::TimedOut(item.timeout)),
                }
            }
        }
    }

    /// Put a retried item back in its tier behind anything already queued
    async fn requeue(&self, item: WorkItem) {
        debug!(id = %item.id, retry = item.retry_count, "RequestScheduler::requeue: called");
        self.queue.lock().await.push(item);
        self.notify.notify_one();
    }

    async fn finalize(&self, result: RequestResult) {
        self.stats.lock().await.record_result(&result);
        let mut results = self.results.lock().await;
        let id = result.request_id.clone();
        match results.slots.get(&id) {
            Some(slot) => {
                slot.send_replace(Some(result));
                results.retain_terminal(id, self.config.result_retention);
            }
            None => debug!(%id, "RequestScheduler::finalize: slot gone, discarding"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::ratelimit::{AdmissionConfig, QuotaMetadata};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn fast_config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_requests: max_concurrent,
            backoff_base_ms: 1,
            backoff_cap_ms: 20,
            poll_interval_ms: 10,
            default_timeout_ms: 1_000,
            shutdown_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn scheduler(config: SchedulerConfig) -> Arc<RequestScheduler> {
        let admission = Arc::new(RateLimitAdmissionController::new(AdmissionConfig::default()));
        Arc::new(RequestScheduler::new(config, admission))
    }

    fn ok_work(value: serde_json::Value) -> Work {
        Work::from_async(move || {
            let value = value.clone();
            async move { Ok(WorkOutput::new(value)) }
        })
    }

    /// Fails `failures` times, then succeeds; logs each call into `calls`
    fn flaky_work(name: &'static str, failures: u32, calls: Arc<std::sync::Mutex<Vec<&'static str>>>) -> Work {
        let attempts = Arc::new(AtomicU32::new(0));
        Work::from_async(move || {
            let attempts = attempts.clone();
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(name);
                if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(eyre::eyre!("{} attempt failed", name))
                } else {
                    Ok(WorkOutput::new(json!(name)))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_submit_and_wait_success() {
        let sched = scheduler(fast_config(2));
        sched.start().await;

        let result = sched
            .submit_and_wait(WorkRequest::new("a", ok_work(json!({"n": 1}))), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.value, Some(json!({"n": 1})));
        assert_eq!(result.retry_count, 0);
        assert!(sched.result("a").await.is_none());

        sched.stop().await;
    }

    #[tokio::test]
    async fn test_queue_full_before_dispatch() {
        let sched = scheduler(SchedulerConfig {
            max_queue_size: 2,
            ..fast_config(1)
        });

        sched.submit(WorkRequest::new("a", ok_work(json!(1)))).await.unwrap();
        sched.submit(WorkRequest::new("b", ok_work(json!(2)))).await.unwrap();
        let err = sched.submit(WorkRequest::new("c", ok_work(json!(3)))).await.unwrap_err();
        assert_eq!(err, SchedulerError::QueueFull { capacity: 2 });

        let stats = sched.stats().await;
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.total_succeeded, 0);
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let sched = scheduler(fast_config(1));
        sched.submit(WorkRequest::new("same", ok_work(json!(1)))).await.unwrap();
        let err = sched.submit(WorkRequest::new("same", ok_work(json!(2)))).await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_retries_exhausted_records_failure() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let request = WorkRequest::new("bad", flaky_work("bad", u32::MAX, calls.clone())).max_retries(3);
        let result = sched.submit_and_wait(request, Some(Duration::from_secs(5))).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.retry_count, 3);
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert!(matches!(result.failure, Some(Failure::Error(ref m)) if m.contains("attempt failed")));

        let stats = sched.stats().await;
        assert_eq!(stats.total_retried, 3);
        assert_eq!(stats.total_failed, 1);
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fails() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let slow = Work::from_async(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(WorkOutput::default())
        });
        let request = WorkRequest::new("slow", slow)
            .timeout(Duration::from_millis(20))
            .max_retries(1);
        let result = sched.submit_and_wait(request, Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(result.retry_count, 1);
        assert_eq!(result.failure, Some(Failure::TimedOut(Duration::from_millis(20))));
        assert!(result.into_result().unwrap_err().is_timeout());
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_blocking_work_runs_off_runtime() {
        let sched = scheduler(fast_config(2));
        sched.start().await;

        let work = Work::blocking(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(WorkOutput::new(json!("done")))
        });
        let result = sched
            .submit_and_wait(WorkRequest::new("cpu", work), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.value, Some(json!("done")));
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_work_is_a_failure() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let work = Work::from_async(|| async {
            if true {
                panic!("bug in work item");
            }
            Ok(WorkOutput::default())
        });
        let result = sched
            .submit_and_wait(WorkRequest::new("panics", work).max_retries(0), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(sched.is_running().await);
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_panic_while_building_future_is_a_failure() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let work = Work::from_async(|| {
            if true {
                panic!("bug before the future exists");
            }
            async { Ok(WorkOutput::default()) }
        });
        let result = sched
            .submit_and_wait(WorkRequest::new("bad", work).max_retries(0), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(Failure::Error("work panicked".to_string())));

        // The only worker survived
        let result = sched
            .submit_and_wait(WorkRequest::new("good", ok_work(json!("ok"))), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(sched.stats().await.in_flight, 0);
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_timed_out_blocking_work_keeps_its_slot() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let running = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicU32::new(0));
        let work = {
            let running = running.clone();
            let observed_max = observed_max.clone();
            let attempts = attempts.clone();
            Work::blocking(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(WorkOutput::default())
            })
        };
        let request = WorkRequest::new("stuck", work)
            .timeout(Duration::from_millis(20))
            .max_retries(2);
        let result = sched.submit_and_wait(request, Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(result.retry_count, 2);
        assert_eq!(result.failure, Some(Failure::TimedOut(Duration::from_millis(20))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(observed_max.load(Ordering::SeqCst), 1);
        assert!(sched.stats().await.peak_in_flight <= 1);
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_result_retention_is_bounded() {
        let sched = scheduler(SchedulerConfig {
            result_retention: 2,
            ..fast_config(1)
        });
        sched.start().await;

        for id in ["first", "second", "third"] {
            sched.submit(WorkRequest::new(id, ok_work(json!(id)))).await.unwrap();
            sched.await_result(id, Some(Duration::from_secs(5))).await.unwrap();
        }

        assert!(sched.result("first").await.is_none());
        assert!(sched.result("second").await.is_some());
        assert!(sched.result("third").await.is_some());
        assert_eq!(
            sched.await_result("first", None).await.unwrap_err(),
            SchedulerError::RequestNotFound {
                request_id: "first".to_string()
            }
        );
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_bound() {
        let sched = scheduler(fast_config(3));
        let current = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));

        let requests: Vec<_> = (0..30)
            .map(|i| {
                let current = current.clone();
                let observed_max = observed_max.clone();
                let work = Work::from_async(move || {
                    let current = current.clone();
                    let observed_max = observed_max.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        observed_max.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(WorkOutput::default())
                    }
                });
                WorkRequest::new(format!("load-{}", i), work)
            })
            .collect();

        sched.start().await;
        let results = sched.submit_batch(requests, Some(Duration::from_secs(10))).await;
        assert_eq!(results.len(), 30);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.success)));
        assert!(observed_max.load(Ordering::SeqCst) <= 3);
        assert!(sched.stats().await.peak_in_flight <= 3);
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_priority_dispatch_and_retry_outcomes() {
        let sched = scheduler(fast_config(1));
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let a = Work::from_async({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push("A");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(WorkOutput::new(json!("A")))
                }
            }
        });
        let b = flaky_work("B", 2, calls.clone());
        let c = flaky_work("C", u32::MAX, calls.clone());

        sched
            .submit(WorkRequest::new("A", a).priority(Priority::Normal).max_retries(2))
            .await
            .unwrap();
        sched
            .submit(WorkRequest::new("B", b).priority(Priority::High).max_retries(2))
            .await
            .unwrap();
        sched
            .submit(WorkRequest::new("C", c).priority(Priority::Critical).max_retries(2))
            .await
            .unwrap();
        sched.start().await;

        let wait = Some(Duration::from_secs(5));
        let ra = sched.await_result("A", wait).await.unwrap();
        let rb = sched.await_result("B", wait).await.unwrap();
        let rc = sched.await_result("C", wait).await.unwrap();

        let mut first_dispatch = Vec::new();
        for name in calls.lock().unwrap().iter() {
            if !first_dispatch.contains(name) {
                first_dispatch.push(*name);
            }
        }
        assert_eq!(first_dispatch, vec!["C", "B", "A"]);

        assert!(ra.success);
        assert_eq!(ra.retry_count, 0);
        assert!(rb.success);
        assert_eq!(rb.retry_count, 2);
        assert!(!rc.success);
        assert_eq!(rc.retry_count, 2);
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_await_result_timeout_and_unknown() {
        let sched = scheduler(fast_config(1));
        sched.submit(WorkRequest::new("parked", ok_work(json!(1)))).await.unwrap();

        let err = sched
            .await_result("parked", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let err = sched.await_result("ghost", None).await.unwrap_err();
        assert_eq!(
            err,
            SchedulerError::RequestNotFound {
                request_id: "ghost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let hang = Work::from_async(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(WorkOutput::default())
        });
        sched.submit(WorkRequest::new("hang", hang)).await.unwrap();
        sched.submit(WorkRequest::new("queued", ok_work(json!(1)))).await.unwrap();

        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.await_result("hang", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        sched.stop().await;
        assert!(!sched.is_running().await);
        assert_eq!(waiter.await.unwrap().unwrap_err(), SchedulerError::Stopped);
        assert_eq!(sched.stats().await.queued, 0);
        assert_eq!(sched.stats().await.in_flight, 0);
        assert!(sched.result("hang").await.is_none());

        // The undispatched item has a terminal result instead of vanishing
        let queued = sched.await_result("queued", Some(Duration::from_secs(1))).await.unwrap();
        assert!(!queued.success);
        assert_eq!(queued.failure, Some(Failure::Stopped));
        assert_eq!(queued.into_result().unwrap_err(), SchedulerError::Stopped);

        // and keeps it across a restart
        sched.start().await;
        let queued = sched.await_result("queued", Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(queued.failure, Some(Failure::Stopped));
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let sched = scheduler(fast_config(2));
        sched.stop().await;
        sched.start().await;
        sched.start().await;
        assert_eq!(sched.workers.lock().await.len(), 2);
        sched.stop().await;
        sched.stop().await;
        assert!(!sched.is_running().await);
    }

    #[tokio::test]
    async fn test_quota_metadata_feeds_admission() {
        let sched = scheduler(fast_config(1));
        sched.start().await;

        let reset = chrono::Utc::now().timestamp() + 3600;
        let work = Work::from_async(move || async move {
            Ok(WorkOutput::new(json!("ok")).with_quota(QuotaMetadata::new(4_321, reset)))
        });
        let request = WorkRequest::new("q", work).rate_limit_class("core");
        sched.submit_and_wait(request, Some(Duration::from_secs(5))).await.unwrap();

        let state = sched.admission().snapshot("core").await.unwrap();
        assert_eq!(state.remaining, Some(4_321));
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_policy_fail() {
        let admission = Arc::new(RateLimitAdmissionController::new(AdmissionConfig {
            check_interval_ms: 5,
            max_wait_secs: 0,
            on_exhausted: ExhaustedPolicy::Fail,
            ..Default::default()
        }));
        let reset = chrono::Utc::now().timestamp() + 3600;
        admission.record("core", Some(&QuotaMetadata::new(0, reset))).await;

        let sched = Arc::new(RequestScheduler::new(fast_config(1), admission));
        sched.start().await;
        let request = WorkRequest::new("blocked", ok_work(json!(1))).rate_limit_class("core");
        let result = sched.submit_and_wait(request, Some(Duration::from_secs(5))).await.unwrap();

        assert!(!result.success);
        assert!(matches!(
            result.into_result(),
            Err(SchedulerError::RateLimitExhausted { ref class, .. }) if class == "core"
        ));
        sched.stop().await;
    }
}

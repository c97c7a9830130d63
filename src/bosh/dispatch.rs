//! HTTP Dispatcher: the per-session worker pool.
//!
//! Bodies are stamped and queued under the session lock, so the queue is in
//! RID order. A fixed number of worker tasks pop from the shared queue and
//! hold it until their POST is under way, so requests also go out in RID
//! order. Each worker then waits for its response and routes the bodies
//! back through [`SessionState::absorb`]. When the last queued or in-flight
//! request completes, an empty body is queued after a short pacing delay to
//! keep a request parked at the connection manager.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ack::SentRequest;
use super::body::Body;
use super::compression::response_codec;
use super::condition::Condition;
use super::config::BoshConfig;
use super::error::BoshError;
use super::framing::BodyCodec;
use super::http::{HttpClient, HttpRequest};
use super::keys::KeySequence;
use super::state::{Phase, SessionEnd, SessionState, CLIENT_HOLD};
use super::{Delivery, SessionListener};

/// Worker count: covers `hold + 1` simultaneous requests.
pub const POOL_SIZE: usize = CLIENT_HOLD as usize + 1;

/// Delay before re-arming the long poll, so that a concurrent `send()` can
/// ride on the new request.
pub const PACING: Duration = Duration::from_millis(100);

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// One queued HTTP exchange.
pub(crate) struct Job {
    rid: u64,
    wire: Arc<[u8]>,
    /// Signalled once the exchange finished (or was abandoned).
    done: Option<oneshot::Sender<()>>,
}

impl Job {
    fn new(sent: &SentRequest, rid: u64, done: Option<oneshot::Sender<()>>) -> Self {
        Self {
            rid,
            wire: Arc::clone(&sent.wire),
            done,
        }
    }
}

/// Handle to a running worker pool.
pub(crate) struct PoolControl {
    jobs: mpsc::UnboundedSender<Job>,
    shutdown: broadcast::Sender<()>,
}

impl PoolControl {
    fn submit(&self, job: Job) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Signal all workers to stop. In-flight exchanges are abandoned.
    pub(crate) fn stop(self) {
        let _ = self.shutdown.send(());
    }
}

/// State behind the session lock.
pub(crate) struct Locked {
    pub(crate) state: SessionState,
    pub(crate) pool: Option<PoolControl>,
}

/// Everything shared between the [`Session`](super::Session) handle and its workers.
pub(crate) struct Shared {
    pub(crate) config: BoshConfig,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) codec: Arc<dyn BodyCodec>,
    pub(crate) listener: Arc<dyn SessionListener>,
    locked: Mutex<Locked>,
    /// Taken after the session lock, never before it.
    keys: Mutex<Option<KeySequence>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(
        config: BoshConfig,
        http: Arc<dyn HttpClient>,
        codec: Arc<dyn BodyCodec>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        let state = SessionState::new(config.wait);
        Self {
            config,
            http,
            codec,
            listener,
            locked: Mutex::new(Locked { state, pool: None }),
            keys: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Locked> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_keys(&self, keys: Option<KeySequence>) {
        *self.keys.lock().unwrap_or_else(PoisonError::into_inner) = keys;
    }

    /// Stamp `body` without queueing it. Used for the session-creation
    /// request, which `connect` runs inline.
    pub(crate) fn stamp(&self, locked: &mut Locked, body: Body) -> Result<SentRequest, BoshError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(locked.state.stamp(body, self.codec.as_ref(), keys.as_mut())?)
    }

    /// Stamp `body` and queue it for the workers. Returns its RID.
    pub(crate) fn enqueue(&self, body: Body, done: Option<oneshot::Sender<()>>) -> Result<u64, BoshError> {
        let mut locked = self.lock();
        self.enqueue_locked(&mut locked, body, done)
    }

    pub(crate) fn enqueue_locked(
        &self,
        locked: &mut Locked,
        body: Body,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<u64, BoshError> {
        if locked.pool.is_none() || !locked.state.phase().is_active() || locked.state.sid().is_none() {
            return Err(BoshError::NotConnected);
        }
        let sent = self.stamp(locked, body)?;
        let rid = sent.rid().unwrap_or_default();
        let submitted = locked
            .pool
            .as_ref()
            .is_some_and(|pool| pool.submit(Job::new(&sent, rid, done)));
        if !submitted {
            locked.state.finish_request();
            return Err(BoshError::NotConnected);
        }
        debug!(rid, pending = locked.state.request_count(), "Queued BOSH request");
        Ok(rid)
    }

    /// Spin up the worker pool. Replaces nothing: the caller checks that no
    /// pool is running.
    pub(crate) fn start_pool(self: &Arc<Self>, locked: &mut Locked) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));

        let handles: Vec<JoinHandle<()>> = (0..POOL_SIZE)
            .map(|worker| {
                let shared = Arc::clone(self);
                let jobs = Arc::clone(&jobs_rx);
                let shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move { shared.worker_loop(worker, jobs, shutdown).await })
            })
            .collect();

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for stale in workers.drain(..) {
            stale.abort();
        }
        workers.extend(handles);

        locked.pool = Some(PoolControl {
            jobs: jobs_tx,
            shutdown: shutdown_tx,
        });
        debug!(workers = POOL_SIZE, "BOSH worker pool started");
    }

    /// Abort every worker task. Safe to call from outside the pool only.
    pub(crate) fn abort_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in workers.drain(..) {
            handle.abort();
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        jobs: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let mut queue = tokio::select! {
                _ = shutdown.recv() => break,
                queue = jobs.lock() => queue,
            };
            let job = tokio::select! {
                _ = shutdown.recv() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // The POST is issued before the queue is released, so requests
            // leave in RID order.
            let rid = job.rid;
            let mut exchange = Box::pin(self.exchange(rid, &job.wire));
            let first = futures_util::poll!(exchange.as_mut());
            drop(queue);

            let result = match first {
                Poll::Ready(result) => result,
                Poll::Pending => tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(worker, rid, "Worker stopped with request in flight");
                        break;
                    }
                    result = &mut exchange => result,
                },
            };
            drop(exchange);
            if let Some(done) = job.done {
                let _ = done.send(());
            }

            match result {
                Ok(bodies) => {
                    if let Err(e) = self.process(rid, bodies) {
                        self.fail(e);
                        break;
                    }
                }
                Err(e) => {
                    if self.lock().state.phase().is_active() {
                        error!(worker, rid, error = %e, "BOSH request failed");
                    }
                    self.fail(e);
                    break;
                }
            }
            self.request_finished();
        }
        debug!(worker, "BOSH worker exited");
    }

    /// One HTTP round trip: compress, POST, check status, decompress, decode.
    pub(crate) async fn exchange(&self, rid: u64, wire: &[u8]) -> Result<Vec<Body>, BoshError> {
        let (url, headers, timeout, request_codec) = {
            let locked = self.lock();
            let url = locked
                .state
                .endpoint()
                .map(|e| e.url())
                .ok_or(BoshError::NotConnected)?;
            (
                url,
                locked.state.request_headers(&self.config.compression),
                locked.state.read_timeout(),
                locked.state.request_codec(),
            )
        };

        debug!(rid, xml = %String::from_utf8_lossy(wire), "BOSH send");
        let body = match request_codec {
            Some(codec) => codec.compress(wire)?,
            None => wire.to_vec(),
        };

        let started = Instant::now();
        let response = self
            .http
            .post(HttpRequest {
                url,
                headers,
                body,
                timeout,
            })
            .await?;

        if response.status != 200 {
            let condition = Condition::from_http_status(response.status);
            warn!(
                rid,
                status = response.status,
                condition = %condition,
                elapsed_ms = elapsed_ms(started),
                "Connection manager answered with HTTP error"
            );
            return Err(BoshError::Terminated {
                condition,
                status: Some(response.status),
                uri: None,
            });
        }

        let raw = match response_codec(response.header("content-encoding"))? {
            Some(codec) => codec.decompress(&response.body)?,
            None => response.body,
        };
        debug!(
            rid,
            elapsed_ms = elapsed_ms(started),
            xml = %String::from_utf8_lossy(&raw),
            "BOSH receive"
        );
        Ok(self.codec.decode(&raw)?)
    }

    /// Route the bodies of one response through the session state.
    ///
    /// Fatal conditions are returned, not surfaced: the caller decides
    /// whether they fail the session or the `connect` call.
    pub(crate) fn process(self: &Arc<Self>, rid: u64, bodies: Vec<Body>) -> Result<(), BoshError> {
        for body in bodies {
            let unpacked = {
                let mut guard = self.lock();
                let locked = &mut *guard;
                if !locked.state.phase().is_active() {
                    debug!(rid, "Ignoring response for inactive session");
                    return Ok(());
                }
                let unpacked = locked.state.absorb(rid, body, &self.config.compression);
                if !unpacked.resend.is_empty() {
                    let pool = locked.pool.as_ref();
                    for sent in &unpacked.resend {
                        let resent = sent
                            .rid()
                            .is_some_and(|r| pool.is_some_and(|p| p.submit(Job::new(sent, r, None))));
                        if !resent {
                            locked.state.finish_request();
                        }
                    }
                }
                unpacked
            };

            if let Some(domain) = &unpacked.opened {
                self.listener.stream_opened(domain);
            }
            if let Some(SessionEnd::Fatal(e)) = unpacked.end {
                return Err(e);
            }
            let mut restart = false;
            for element in &unpacked.payload {
                if self.listener.deliver(element) == Delivery::RestartStream {
                    restart = true;
                }
            }
            if restart {
                if let Err(e) = self.restart_stream() {
                    warn!(error = %e, "Stream restart could not be queued");
                }
            }
            if let Some(SessionEnd::Graceful) = unpacked.end {
                self.end_gracefully();
                return Ok(());
            }
        }
        Ok(())
    }

    /// Queue an `xmpp:restart='true'` body (XEP-0206 §5).
    pub(crate) fn restart_stream(&self) -> Result<u64, BoshError> {
        let mut locked = self.lock();
        let body = Body::restart(locked.state.domain(), locked.state.lang());
        let rid = self.enqueue_locked(&mut locked, body, None)?;
        info!(rid, "Stream restart requested");
        Ok(rid)
    }

    /// An exchange completed: re-arm the long poll if nothing is left.
    pub(crate) fn request_finished(self: &Arc<Self>) {
        let remaining = self.lock().state.finish_request();
        if remaining == 0 {
            self.schedule_rearm();
        }
    }

    fn schedule_rearm(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(PACING).await;
            shared.arm_if_idle();
        });
    }

    /// Queue an empty body if the session is up and nothing is in flight.
    pub(crate) fn arm_if_idle(&self) {
        let mut locked = self.lock();
        if locked.state.request_count() != 0 || locked.pool.is_none() || !locked.state.phase().is_active() {
            return;
        }
        match self.enqueue_locked(&mut locked, Body::empty(), None) {
            Ok(rid) => debug!(rid, "Long poll re-armed"),
            Err(e) => debug!(error = %e, "Long poll not re-armed"),
        }
    }

    /// Fatal error: stop the pool and surface `err` once.
    pub(crate) fn fail(&self, err: BoshError) {
        {
            let mut locked = self.lock();
            if !locked.state.phase().is_active() {
                return;
            }
            locked.state.set_phase(Phase::Terminated);
            if let Some(pool) = locked.pool.take() {
                pool.stop();
            }
        }
        error!(
            error = %err,
            condition = ?err.condition().map(Condition::as_str),
            status = ?err.http_status(),
            "BOSH session failed"
        );
        self.listener.session_failed(&err);
    }

    /// The connection manager ended the session without an error.
    fn end_gracefully(&self) {
        {
            let mut locked = self.lock();
            if !locked.state.phase().is_active() {
                return;
            }
            locked.state.set_phase(Phase::Terminated);
            if let Some(pool) = locked.pool.take() {
                pool.stop();
            }
        }
        info!("BOSH session terminated by connection manager");
        self.listener.session_terminated();
    }
}

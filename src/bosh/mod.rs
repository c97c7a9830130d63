//! BOSH session engine (XEP-0124 / XEP-0206).
//!
//! A [`Session`] emulates a bidirectional XMPP stream over a sequence of
//! long-polled HTTP requests:
//!
//! 1. `connect` resolves the connection manager, probes it over TCP and runs
//!    the session-creation exchange
//! 2. `send` stamps payload into a body and queues it for the worker pool;
//!    it never waits for I/O
//! 3. Responses are unpacked by the workers: acknowledgments reconciled,
//!    recoverable errors resent, payload handed to the [`SessionListener`]
//! 4. Whenever nothing is in flight, an empty body is parked at the
//!    connection manager so it can push data at any time
//!
//! `close` terminates the session. `detach` and `pause` stop local activity
//! but keep the session resumable through `attach`.

pub mod ack;
pub mod body;
pub mod compression;
pub mod condition;
pub mod config;
mod dispatch;
pub mod dns;
pub mod error;
pub mod framing;
pub mod http;
pub mod keys;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use self::ack::{RequestIds, RID_LIMIT};
use self::body::Body;
use self::config::BoshConfig;
use self::dispatch::Shared;
use self::dns::BoshEndpoint;
use self::error::{BoshError, ConfigError};
use self::framing::{BodyCodec, XmlCodec};
use self::http::{HttpClient, ReqwestHttpClient};
use self::keys::KeySequence;
use self::state::{Phase, ServerParams, CLIENT_HOLD};

/// How long `close` and `pause` wait for their request to go out.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What the session should do after an element was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    /// The element requires a fresh stream (e.g. SASL `<success/>`).
    RestartStream,
}

/// Callbacks from the session to its owner.
///
/// Called from worker tasks, never while the session lock is held.
pub trait SessionListener: Send + Sync + 'static {
    /// The session-creation response arrived.
    fn stream_opened(&self, _domain: &str) {}

    /// One wrapped element, in document order.
    fn deliver(&self, element: &str) -> Delivery;

    /// The session ended with an error. Called at most once per session.
    fn session_failed(&self, _error: &BoshError) {}

    /// The connection manager ended the session without an error.
    fn session_terminated(&self) {}
}

/// A BOSH client session. Clones share the session.
///
/// The worker pool keeps the session alive until `close`, `detach` or
/// `pause` stops it, or the session fails.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Session over HTTP(S) via reqwest, with the default XML codec.
    pub fn new(config: BoshConfig, listener: Arc<dyn SessionListener>) -> Result<Self, BoshError> {
        let http = ReqwestHttpClient::from_config(&config)?;
        Ok(Self::with_transport(config, Arc::new(http), Arc::new(XmlCodec), listener))
    }

    pub fn with_transport(
        config: BoshConfig,
        http: Arc<dyn HttpClient>,
        codec: Arc<dyn BodyCodec>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, http, codec, listener)),
        }
    }

    pub fn config(&self) -> &BoshConfig {
        &self.shared.config
    }

    pub fn state(&self) -> Phase {
        self.shared.lock().state.phase()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().state.sid().map(str::to_string)
    }

    pub fn auth_id(&self) -> Option<String> {
        self.shared.lock().state.authid().map(str::to_string)
    }

    /// Last RID handed out.
    pub fn last_rid(&self) -> Option<u64> {
        self.shared.lock().state.last_rid()
    }

    pub fn endpoint(&self) -> Option<BoshEndpoint> {
        self.shared.lock().state.endpoint().cloned()
    }

    /// Parameters the connection manager announced at session creation.
    pub fn server_params(&self) -> ServerParams {
        self.shared.lock().state.params().clone()
    }

    /// Open the session. A no-op while a session is active.
    pub async fn connect(&self) -> Result<(), BoshError> {
        let shared = &self.shared;
        if shared.lock().state.phase().is_active() {
            debug!("connect() called on an active session");
            return Ok(());
        }
        shared.config.validate()?;

        let endpoint = dns::resolve_endpoint(&shared.config).await?;
        shared
            .http
            .probe(endpoint.bare_host(), endpoint.port, shared.config.connect_timeout())
            .await
            .map_err(|e| BoshError::Connection {
                endpoint: endpoint.url(),
                reason: e.to_string(),
            })?;

        let domain = shared
            .config
            .service_domain()
            .unwrap_or(endpoint.bare_host())
            .to_string();

        let creation = {
            let mut locked = shared.lock();
            if locked.state.phase().is_active() {
                return Ok(());
            }
            shared.set_keys(shared.config.use_key_sequence.then(KeySequence::generate));
            locked.state.begin(
                endpoint.clone(),
                domain.clone(),
                shared.config.lang.clone(),
                RequestIds::random(),
            );
            let body = Body::creation(
                &domain,
                &shared.config.lang,
                CLIENT_HOLD,
                shared.config.wait,
                shared.config.route.as_deref(),
            );
            match shared.stamp(&mut locked, body) {
                Ok(sent) => sent,
                Err(e) => {
                    locked.state.reset();
                    return Err(e);
                }
            }
        };
        let rid = creation.rid().unwrap_or_default();
        info!(url = %endpoint, domain = %domain, rid, "Opening BOSH session");

        let bodies = match shared.exchange(rid, &creation.wire).await {
            Ok(bodies) => bodies,
            Err(e) => {
                shared.lock().state.reset();
                return Err(match e {
                    BoshError::Terminated { .. } => e,
                    other => BoshError::Connection {
                        endpoint: endpoint.url(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        shared.start_pool(&mut shared.lock());
        let opened = shared.process(rid, bodies).and_then(|()| {
            match shared.lock().state.sid() {
                Some(_) => Ok(()),
                None => Err(BoshError::Connection {
                    endpoint: endpoint.url(),
                    reason: "session-creation response carried no sid".to_string(),
                }),
            }
        });
        if let Err(e) = opened {
            warn!(url = %endpoint, error = %e, "BOSH session creation rejected");
            self.stop_pool();
            shared.lock().state.reset();
            return Err(e);
        }

        {
            let mut locked = shared.lock();
            if locked.state.phase() == Phase::Connecting {
                locked.state.set_phase(Phase::Connected);
            }
        }
        shared.request_finished();
        Ok(())
    }

    /// Resume a session that was detached or paused, possibly by another
    /// process. RIDs continue after `last_rid`.
    ///
    /// Key sequencing is not resumed: the previous holder's keys are unknown.
    pub async fn attach(
        &self,
        endpoint: BoshEndpoint,
        sid: impl Into<String>,
        last_rid: u64,
    ) -> Result<(), BoshError> {
        let shared = &self.shared;
        let sid = sid.into();
        if last_rid >= RID_LIMIT - 1 {
            return Err(ConfigError::RidOutOfRange(last_rid).into());
        }
        {
            let mut locked = shared.lock();
            if locked.state.phase().is_active() {
                return Ok(());
            }
            let domain = shared
                .config
                .service_domain()
                .unwrap_or(endpoint.bare_host())
                .to_string();
            info!(url = %endpoint, sid = %sid, last_rid, "Attaching to BOSH session");
            locked
                .state
                .resume(endpoint, domain, shared.config.lang.clone(), sid, last_rid);
            shared.set_keys(None);
            shared.start_pool(&mut locked);
        }
        shared.arm_if_idle();
        Ok(())
    }

    /// Queue `payload` (raw XML elements) for delivery. Returns the RID.
    pub fn send(&self, payload: Vec<String>) -> Result<u64, BoshError> {
        self.shared.enqueue(Body::with_payload(payload), None)
    }

    /// Request a fresh XMPP stream, e.g. after SASL succeeded.
    pub fn restart_stream(&self) -> Result<u64, BoshError> {
        self.shared.restart_stream()
    }

    /// Terminate the session. Best-effort and idempotent: waits up to
    /// [`CLOSE_GRACE`] for the terminate request, then stops the pool.
    pub async fn close(&self) {
        let pending = {
            let mut guard = self.shared.lock();
            let locked = &mut *guard;
            if locked.pool.is_none() && !locked.state.phase().is_active() {
                if locked.state.phase() == Phase::Terminated {
                    locked.state.reset();
                }
                return;
            }
            let pending = if locked.state.phase().is_active() && locked.state.sid().is_some() {
                let (done_tx, done_rx) = oneshot::channel();
                match self
                    .shared
                    .enqueue_locked(locked, Body::terminate(Vec::new()), Some(done_tx))
                {
                    Ok(rid) => Some((rid, done_rx)),
                    Err(e) => {
                        warn!(error = %e, "Could not queue terminate request");
                        None
                    }
                }
            } else {
                None
            };
            // Responses from here on are ignored
            locked.state.suspend();
            pending
        };

        if let Some((rid, done)) = pending {
            info!(rid, "Closing BOSH session");
            self.wait_for_flush(rid, done).await;
        }
        self.stop_pool();
        self.shared.lock().state.reset();
    }

    /// Stop the worker pool without terminating the session and return the
    /// last RID, so the session can be resumed with [`Session::attach`].
    pub fn detach(&self) -> Option<u64> {
        let (last_rid, sid) = {
            let mut locked = self.shared.lock();
            if locked.state.phase().is_active() {
                locked.state.suspend();
            }
            (locked.state.last_rid(), locked.state.sid().map(str::to_string))
        };
        if self.stop_pool() {
            info!(sid = ?sid, last_rid = ?last_rid, "Detached from BOSH session");
        }
        last_rid
    }

    /// Ask the connection manager to keep the session for up to `seconds`
    /// (capped at its `maxpause`) and stop the worker pool (XEP-0124 §10).
    /// Returns the last RID for a later [`Session::attach`].
    pub async fn pause(&self, seconds: u32) -> Result<u64, BoshError> {
        let (rid, done) = {
            let mut guard = self.shared.lock();
            let locked = &mut *guard;
            if !locked.state.phase().is_active() || locked.state.sid().is_none() {
                return Err(BoshError::NotConnected);
            }
            let maxpause = locked.state.params().maxpause.ok_or(BoshError::PauseUnsupported)?;
            let (done_tx, done_rx) = oneshot::channel();
            let rid = self
                .shared
                .enqueue_locked(locked, Body::pause(seconds.min(maxpause)), Some(done_tx))?;
            locked.state.suspend();
            (rid, done_rx)
        };

        info!(rid, seconds, "Pausing BOSH session");
        self.wait_for_flush(rid, done).await;
        self.stop_pool();
        Ok(rid)
    }

    async fn wait_for_flush(&self, rid: u64, done: oneshot::Receiver<()>) {
        match tokio::time::timeout(CLOSE_GRACE, done).await {
            Ok(_) => debug!(rid, "Request flushed"),
            Err(_) => warn!(
                rid,
                grace_ms = CLOSE_GRACE.as_millis() as u64,
                "Request not flushed within grace period, abandoning"
            ),
        }
    }

    /// Returns whether a pool was running.
    fn stop_pool(&self) -> bool {
        let pool = self.shared.lock().pool.take();
        let stopped = pool.is_some();
        if let Some(pool) = pool {
            pool.stop();
        }
        self.shared.abort_workers();
        stopped
    }
}

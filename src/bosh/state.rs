//! Session State: everything the session lock protects.
//!
//! [`SessionState`] does no I/O. The dispatcher stamps outgoing bodies
//! through [`SessionState::stamp`] and feeds every response body through
//! [`SessionState::absorb`], acting on the returned [`Unpacked`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::ack::{AckRegistry, RequestIds, SentRequest};
use super::body::{Body, BodyType, CONTENT_TYPE};
use super::compression::{accept_encoding, negotiate, ContentCodec};
use super::condition::Condition;
use super::dns::BoshEndpoint;
use super::error::{BoshError, CodecError};
use super::framing::BodyCodec;
use super::keys::KeySequence;

/// Added to the negotiated `wait` to get the HTTP read timeout.
pub const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// `hold` requested in the session-creation body.
pub const CLIENT_HOLD: u32 = 1;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    /// A stream restart was sent and its response has not arrived yet.
    Restarting,
    /// Ended by the connection manager or by a fatal transport error.
    Terminated,
}

impl Phase {
    /// Whether requests may be dispatched in this phase.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Connecting | Phase::Connected | Phase::Restarting)
    }
}

/// Session parameters announced by the connection manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerParams {
    pub requests: Option<u32>,
    pub hold: Option<u32>,
    pub wait: Option<u32>,
    pub polling: Option<u32>,
    pub inactivity: Option<u32>,
    pub maxpause: Option<u32>,
}

/// How the session ends after a response, if it does.
#[derive(Debug)]
pub enum SessionEnd {
    /// `type='terminate'` without a condition.
    Graceful,
    Fatal(BoshError),
}

/// What the dispatcher has to do after one response body was absorbed.
#[derive(Debug, Default)]
pub struct Unpacked {
    /// Set for the session-creation response: the domain the stream opened to.
    pub opened: Option<String>,
    /// Requests to retransmit verbatim, ascending by RID.
    pub resend: Vec<SentRequest>,
    /// Wrapped elements to deliver, in document order.
    pub payload: Vec<String>,
    pub end: Option<SessionEnd>,
}

#[derive(Debug)]
pub struct SessionState {
    phase: Phase,
    endpoint: Option<BoshEndpoint>,
    domain: String,
    lang: String,
    ids: RequestIds,
    sid: Option<String>,
    authid: Option<String>,
    highest_received: Option<u64>,
    /// Requests queued or in flight.
    request_count: usize,
    using_acks: bool,
    registry: AckRegistry,
    request_codec: Option<ContentCodec>,
    params: ServerParams,
    configured_wait: u32,
    restart_rid: Option<u64>,
}

impl SessionState {
    pub fn new(configured_wait: u32) -> Self {
        Self {
            phase: Phase::Disconnected,
            endpoint: None,
            domain: String::new(),
            lang: String::new(),
            ids: RequestIds::random(),
            sid: None,
            authid: None,
            highest_received: None,
            request_count: 0,
            using_acks: false,
            registry: AckRegistry::default(),
            request_codec: None,
            params: ServerParams::default(),
            configured_wait,
            restart_rid: None,
        }
    }

    /// Prepare for a new session: fresh RIDs, no SID, nothing in flight.
    pub fn begin(&mut self, endpoint: BoshEndpoint, domain: String, lang: String, ids: RequestIds) {
        let configured_wait = self.configured_wait;
        *self = Self::new(configured_wait);
        self.phase = Phase::Connecting;
        self.endpoint = Some(endpoint);
        self.domain = domain;
        self.lang = lang;
        self.ids = ids;
    }

    /// Continue an existing session out of band. RIDs resume after `last_rid`.
    pub fn resume(&mut self, endpoint: BoshEndpoint, domain: String, lang: String, sid: String, last_rid: u64) {
        self.begin(endpoint, domain, lang, RequestIds::starting_at(last_rid.saturating_add(1)));
        self.sid = Some(sid);
        self.highest_received = Some(last_rid);
        self.phase = Phase::Connected;
    }

    /// Forget the session entirely (after `close`).
    pub fn reset(&mut self) {
        let configured_wait = self.configured_wait;
        *self = Self::new(configured_wait);
    }

    /// Stop dispatching but keep SID and RID so the session can be resumed.
    pub fn suspend(&mut self) {
        self.phase = Phase::Disconnected;
        self.request_count = 0;
        self.restart_rid = None;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn endpoint(&self) -> Option<&BoshEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn authid(&self) -> Option<&str> {
        self.authid.as_deref()
    }

    pub fn last_rid(&self) -> Option<u64> {
        self.ids.last()
    }

    pub fn highest_received(&self) -> Option<u64> {
        self.highest_received
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn using_acks(&self) -> bool {
        self.using_acks
    }

    pub fn registry(&self) -> &AckRegistry {
        &self.registry
    }

    pub fn request_codec(&self) -> Option<ContentCodec> {
        self.request_codec
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    /// HTTP read timeout: the negotiated `wait` plus a margin.
    pub fn read_timeout(&self) -> Duration {
        let wait = self.params.wait.unwrap_or(self.configured_wait);
        Duration::from_secs(u64::from(wait)) + READ_TIMEOUT_MARGIN
    }

    /// Headers of every request: content type, what we can decompress, and
    /// the codec the request body is compressed with.
    pub fn request_headers(&self, supported: &[ContentCodec]) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Content-Type", CONTENT_TYPE.to_string())];
        if let Some(accept) = accept_encoding(supported) {
            headers.push(("Accept-Encoding", accept));
        }
        if let Some(codec) = self.request_codec {
            headers.push(("Content-Encoding", codec.token().to_string()));
        }
        headers
    }

    /// Stamp `body` with RID, SID, `ack` and key fields, encode it and
    /// account for it as queued.
    ///
    /// Must be called in transmission order: the RID, the key and the
    /// registry entry are taken here.
    pub fn stamp(
        &mut self,
        mut body: Body,
        codec: &dyn BodyCodec,
        keys: Option<&mut KeySequence>,
    ) -> Result<SentRequest, CodecError> {
        let creating = self.sid.is_none();

        // The creation body announces ack support with ack='1'
        if body.ack.is_none() && !self.registry.is_empty() {
            body.ack = self.highest_received;
        }
        if let Some(keys) = keys {
            let fields = if creating { keys.initial() } else { keys.advance() };
            body.key = fields.key;
            body.newkey = fields.newkey;
        }
        body.sid = self.sid.clone();
        let rid = self.ids.allocate();
        body.rid = Some(rid);
        if body.restart {
            self.restart_rid = Some(rid);
            if self.phase == Phase::Connected {
                self.phase = Phase::Restarting;
            }
        }

        let wire: Arc<[u8]> = Arc::from(codec.encode(&body)?);
        let sent = SentRequest {
            body: Arc::new(body),
            wire,
        };
        if self.using_acks {
            self.registry.insert(rid, sent.clone());
        }
        self.request_count += 1;
        Ok(sent)
    }

    /// One exchange finished. Returns the number still queued or in flight.
    pub fn finish_request(&mut self) -> usize {
        self.request_count = self.request_count.saturating_sub(1);
        self.request_count
    }

    /// Fold one response body to request `rid` into the state.
    pub fn absorb(&mut self, rid: u64, body: Body, supported: &[ContentCodec]) -> Unpacked {
        let mut unpacked = Unpacked::default();

        if self.sid.is_none() {
            if let Some(sid) = &body.sid {
                self.sid = Some(sid.clone());
                self.authid = body.authid.clone();
                self.using_acks = body.ack.is_some();
                self.params = ServerParams {
                    requests: body.requests,
                    hold: body.hold,
                    wait: body.wait,
                    polling: body.polling,
                    inactivity: body.inactivity,
                    maxpause: body.maxpause,
                };
                self.request_codec = body
                    .accept
                    .as_deref()
                    .and_then(|offered| negotiate(offered, supported));
                info!(
                    sid = %sid,
                    rid,
                    acks = self.using_acks,
                    requests = ?body.requests,
                    wait = ?body.wait,
                    compression = ?self.request_codec.map(ContentCodec::token),
                    "BOSH session created"
                );
                unpacked.opened = Some(self.domain.clone());
            }
        }

        // An error response is no proof of receipt: its request gets resent
        if body.kind != BodyType::Error {
            self.registry.received(rid);
            self.highest_received = Some(self.highest_received.map_or(rid, |h| h.max(rid)));
        }
        if let Some(ack) = body.ack {
            let released = self.registry.acknowledge(ack);
            if released > 0 {
                debug!(ack, released, pending = self.registry.len(), "Requests acknowledged");
            }
        }
        if self.restart_rid == Some(rid) {
            self.restart_rid = None;
            if self.phase == Phase::Restarting {
                self.phase = Phase::Connected;
            }
        }

        match body.kind {
            BodyType::Terminate => match &body.condition {
                Some(condition) if condition.is_fatal() => {
                    let uri = if *condition == Condition::SeeOtherUri {
                        body.redirect_uri()
                    } else {
                        None
                    };
                    unpacked.end = Some(SessionEnd::Fatal(BoshError::Terminated {
                        condition: condition.clone(),
                        status: None,
                        uri,
                    }));
                    return unpacked;
                }
                Some(_) => {
                    warn!(rid, "Connection manager reported remote-stream-error");
                }
                None => unpacked.end = Some(SessionEnd::Graceful),
            },
            BodyType::Error => {
                unpacked.resend = self.registry.unacknowledged();
                self.request_count += unpacked.resend.len();
                warn!(
                    rid,
                    resend = ?self.registry.rids(),
                    "Recoverable binding error, resending unacknowledged requests"
                );
            }
            BodyType::Normal => {}
        }

        unpacked.payload = body.payload;
        unpacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bosh::ack::RID_SEED_BOUND;
    use crate::bosh::framing::XmlCodec;
    use std::sync::Mutex;

    fn endpoint() -> BoshEndpoint {
        BoshEndpoint {
            secure: false,
            host: "bosh.example.com".into(),
            port: 5280,
            path: "/bosh".into(),
        }
    }

    fn connecting(first_rid: u64) -> SessionState {
        let mut state = SessionState::new(60);
        state.begin(endpoint(), "example.com".into(), "en".into(), RequestIds::starting_at(first_rid));
        state
    }

    fn creation_response(sid: &str, ack: Option<u64>) -> Body {
        Body {
            sid: Some(sid.into()),
            authid: Some("auth-1".into()),
            ack,
            requests: Some(2),
            wait: Some(60),
            hold: Some(1),
            ..Body::default()
        }
    }

    /// Connected state with acks in use and `first_rid` used by the creation request.
    fn connected(first_rid: u64) -> SessionState {
        let mut state = connecting(first_rid);
        let creation = state
            .stamp(Body::creation("example.com", "en", 1, 60, None), &XmlCodec, None)
            .unwrap();
        state.absorb(creation.rid().unwrap(), creation_response("abc123", Some(first_rid)), &[]);
        state.finish_request();
        state.set_phase(Phase::Connected);
        state
    }

    #[test]
    fn test_creation_request_and_response() {
        let mut state = SessionState::new(60);
        state.begin(endpoint(), "example.com".into(), "en".into(), RequestIds::random());

        let creation = state
            .stamp(Body::creation("example.com", "en", CLIENT_HOLD, 60, None), &XmlCodec, None)
            .unwrap();
        let rid = creation.rid().unwrap();
        assert!(rid < RID_SEED_BOUND);
        assert_eq!(creation.body.sid, None);
        assert_eq!(creation.body.hold, Some(1));
        assert_eq!(creation.body.ack, Some(1));
        // Acks are unknown until the response: nothing registered yet
        assert!(state.registry().is_empty());

        let unpacked = state.absorb(rid, creation_response("abc123", Some(rid)), &[]);
        assert_eq!(unpacked.opened.as_deref(), Some("example.com"));
        assert_eq!(state.sid(), Some("abc123"));
        assert_eq!(state.authid(), Some("auth-1"));
        assert!(state.using_acks());
        assert_eq!(state.highest_received(), Some(rid));
        assert_eq!(state.params().requests, Some(2));
    }

    #[test]
    fn test_creation_response_without_ack_disables_registry() {
        let mut state = connecting(10);
        state
            .stamp(Body::creation("example.com", "en", 1, 60, None), &XmlCodec, None)
            .unwrap();
        state.absorb(10, creation_response("s", None), &[]);
        assert!(!state.using_acks());

        state.stamp(Body::with_payload(vec!["<presence/>".into()]), &XmlCodec, None).unwrap();
        assert!(state.registry().is_empty());
    }

    #[test]
    fn test_every_body_after_the_first_carries_sid() {
        let mut state = connected(100);
        let sent = state.stamp(Body::empty(), &XmlCodec, None).unwrap();
        assert_eq!(sent.body.sid.as_deref(), Some("abc123"));
        assert_eq!(sent.rid(), Some(101));
    }

    #[test]
    fn test_ack_attached_only_while_registry_non_empty() {
        let mut state = connected(100);
        assert_eq!(state.highest_received(), Some(100));

        // Registry empty: everything sent so far has been answered
        let first = state.stamp(Body::empty(), &XmlCodec, None).unwrap();
        assert_eq!(first.body.ack, None);

        // 101 is still outstanding
        let second = state.stamp(Body::with_payload(vec!["<message/>".into()]), &XmlCodec, None).unwrap();
        assert_eq!(second.body.ack, Some(100));
        assert_eq!(state.registry().rids(), vec![101, 102]);
    }

    #[test]
    fn test_response_removes_entry_and_ack_releases_prefix() {
        let mut state = connected(100);
        for _ in 0..3 {
            state.stamp(Body::empty(), &XmlCodec, None).unwrap();
        }
        assert_eq!(state.registry().rids(), vec![101, 102, 103]);

        state.absorb(103, Body::default(), &[]);
        assert_eq!(state.registry().rids(), vec![101, 102]);
        assert_eq!(state.highest_received(), Some(103));

        state.absorb(
            101,
            Body {
                ack: Some(102),
                ..Body::default()
            },
            &[],
        );
        assert!(state.registry().is_empty());
        // Out-of-order arrival never lowers the high-water mark
        assert_eq!(state.highest_received(), Some(103));
    }

    #[test]
    fn test_error_response_resends_unacknowledged_in_order() {
        let mut state = connected(4);
        let five = state.stamp(Body::with_payload(vec!["<a/>".into()]), &XmlCodec, None).unwrap();
        let six = state.stamp(Body::with_payload(vec!["<b/>".into()]), &XmlCodec, None).unwrap();
        assert_eq!((five.rid(), six.rid()), (Some(5), Some(6)));
        let queued = state.request_count();

        let unpacked = state.absorb(
            6,
            Body {
                kind: BodyType::Error,
                ..Body::default()
            },
            &[],
        );
        assert!(unpacked.end.is_none());
        assert_eq!(unpacked.resend.len(), 2);
        assert_eq!(unpacked.resend[0].rid(), Some(5));
        assert_eq!(unpacked.resend[0].wire, five.wire);
        assert_eq!(unpacked.resend[1].rid(), Some(6));
        assert_eq!(unpacked.resend[1].wire, six.wire);
        assert_eq!(state.request_count(), queued + 2);
    }

    #[test]
    fn test_see_other_uri_is_fatal_with_redirect() {
        let mut state = connected(1);
        let unpacked = state.absorb(
            2,
            Body {
                kind: BodyType::Terminate,
                condition: Some(Condition::SeeOtherUri),
                uri: Some("https://cm2.example/bind".into()),
                ..Body::default()
            },
            &[],
        );
        let Some(SessionEnd::Fatal(err)) = unpacked.end else {
            panic!("expected a fatal end");
        };
        assert_eq!(err.condition(), Some(&Condition::SeeOtherUri));
        assert_eq!(err.redirect_uri(), Some("https://cm2.example/bind"));
        assert!(unpacked.payload.is_empty());
    }

    #[test]
    fn test_remote_stream_error_is_delivered_not_fatal() {
        let mut state = connected(1);
        let unpacked = state.absorb(
            2,
            Body {
                kind: BodyType::Terminate,
                condition: Some(Condition::RemoteStreamError),
                payload: vec!["<stream:error><conflict/></stream:error>".into()],
                ..Body::default()
            },
            &[],
        );
        assert!(unpacked.end.is_none());
        assert_eq!(unpacked.payload.len(), 1);
    }

    #[test]
    fn test_terminate_without_condition_is_graceful() {
        let mut state = connected(1);
        let unpacked = state.absorb(2, Body::terminate(vec![]), &[]);
        assert!(matches!(unpacked.end, Some(SessionEnd::Graceful)));
    }

    #[test]
    fn test_compression_negotiated_from_creation_response() {
        let mut state = connecting(1);
        state.stamp(Body::creation("example.com", "en", 1, 60, None), &XmlCodec, None).unwrap();
        let response = Body {
            accept: Some("gzip,deflate".into()),
            ..creation_response("s", Some(1))
        };
        state.absorb(1, response, &[ContentCodec::Deflate]);
        assert_eq!(state.request_codec(), Some(ContentCodec::Deflate));

        let headers = state.request_headers(&[ContentCodec::Deflate]);
        assert!(headers.contains(&("Accept-Encoding", "deflate".to_string())));
        assert!(headers.contains(&("Content-Encoding", "deflate".to_string())));
    }

    #[test]
    fn test_key_fields_stamped_in_rid_order() {
        let mut keys = KeySequence::with_seed("seed", 8);
        let mut state = connecting(1);
        let creation = state
            .stamp(Body::creation("example.com", "en", 1, 60, None), &XmlCodec, Some(&mut keys))
            .unwrap();
        assert!(creation.body.key.is_none());
        let announced = creation.body.newkey.clone().unwrap();
        state.absorb(1, creation_response("s", Some(1)), &[]);

        let next = state.stamp(Body::empty(), &XmlCodec, Some(&mut keys)).unwrap();
        assert_eq!(crate::bosh::keys::hash_key(next.body.key.as_ref().unwrap()), announced);
    }

    #[test]
    fn test_restart_moves_through_restarting_phase() {
        let mut state = connected(1);
        let restart = state.stamp(Body::restart("example.com", "en"), &XmlCodec, None).unwrap();
        assert_eq!(state.phase(), Phase::Restarting);
        assert!(restart.body.payload.is_empty());

        state.absorb(restart.rid().unwrap(), Body::default(), &[]);
        assert_eq!(state.phase(), Phase::Connected);
    }

    #[test]
    fn test_read_timeout_follows_negotiated_wait() {
        let mut state = connecting(1);
        assert_eq!(state.read_timeout(), Duration::from_secs(70));
        state.stamp(Body::creation("example.com", "en", 1, 60, None), &XmlCodec, None).unwrap();
        let response = Body {
            wait: Some(30),
            ..creation_response("s", None)
        };
        state.absorb(1, response, &[]);
        assert_eq!(state.read_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn test_resume_continues_after_last_rid() {
        let mut state = SessionState::new(60);
        state.resume(endpoint(), "example.com".into(), "en".into(), "abc".into(), 41);
        let sent = state.stamp(Body::empty(), &XmlCodec, None).unwrap();
        assert_eq!(sent.rid(), Some(42));
        assert_eq!(sent.body.sid.as_deref(), Some("abc"));
        assert_eq!(state.phase(), Phase::Connected);
    }

    #[test]
    fn test_rids_strictly_increase_under_concurrent_callers() {
        let state = Arc::new(Mutex::new(connected(1000)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            let mut guard = state.lock().unwrap();
                            guard.stamp(Body::empty(), &XmlCodec, None).unwrap().rid().unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut rids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        rids.sort_unstable();
        let expected: Vec<u64> = (1001..1401).collect();
        assert_eq!(rids, expected);
    }
}

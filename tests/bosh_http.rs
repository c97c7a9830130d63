//! End-to-end tests of the reqwest transport and a full session against a
//! mock connection manager.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fluux_bosh::bosh::body::HTTPBIND_NS;
use fluux_bosh::bosh::framing::decode_bodies;
use fluux_bosh::bosh::http::{HttpClient, HttpRequest, ReqwestHttpClient};
use fluux_bosh::{Body, BoshConfig, BoshError, Condition, ContentCodec, Delivery, Phase, Session, SessionListener};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

#[derive(Default)]
struct Collector {
    delivered: Mutex<Vec<String>>,
}

impl SessionListener for Collector {
    fn deliver(&self, element: &str) -> Delivery {
        self.delivered.lock().unwrap().push(element.to_string());
        Delivery::Continue
    }
}

/// Decode a request the way a connection manager would.
fn request_body(request: &Request) -> Body {
    let raw = match request.headers.get("content-encoding") {
        Some(value) => ContentCodec::from_token(value.to_str().unwrap())
            .unwrap()
            .decompress(&request.body)
            .unwrap(),
        None => request.body.clone(),
    };
    decode_bodies(&raw).unwrap().remove(0)
}

/// Connection manager that compresses its creation response, offers
/// `deflate`, echoes messages and parks empty polls.
fn connection_manager(request: &Request) -> ResponseTemplate {
    let body = request_body(request);
    if body.sid.is_none() {
        let xml = format!(
            "<body xmlns='{}' sid='wm-1' authid='wm-auth' ack='{}' wait='60' requests='2' hold='1' accept='deflate'/>",
            HTTPBIND_NS,
            body.rid.unwrap()
        );
        return ResponseTemplate::new(200)
            .insert_header("Content-Type", "text/xml; charset=utf-8")
            .insert_header("Content-Encoding", "gzip")
            .set_body_bytes(ContentCodec::Gzip.compress(xml.as_bytes()).unwrap());
    }
    if body.is_terminate() {
        return ResponseTemplate::new(200)
            .set_body_string(format!("<body xmlns='{}' type='terminate'/>", HTTPBIND_NS));
    }
    if let Some(message) = body.payload.first() {
        return ResponseTemplate::new(200).set_body_string(format!(
            "<body xmlns='{}'>{}</body>",
            HTTPBIND_NS,
            message.replace("to='echo'", "from='echo'")
        ));
    }
    ResponseTemplate::new(200)
        .set_body_string(format!("<body xmlns='{}'/>", HTTPBIND_NS))
        .set_delay(Duration::from_secs(30))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_reqwest_client_posts_xml_and_returns_raw_response() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bosh"))
        .and(header("Content-Type", "text/xml; charset=utf-8"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "identity")
                .set_body_string("<body xmlns='http://jabber.org/protocol/httpbind'/>"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ReqwestHttpClient::from_config(&BoshConfig::default()).unwrap();
    let response = client
        .post(HttpRequest {
            url: format!("{}/bosh", mock_server.uri()),
            headers: vec![("Content-Type", "text/xml; charset=utf-8".to_string())],
            body: b"<body rid='1' xmlns='http://jabber.org/protocol/httpbind'/>".to_vec(),
            timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Encoding"), Some("identity"));
    assert_eq!(response.body, b"<body xmlns='http://jabber.org/protocol/httpbind'/>".to_vec());
}

#[tokio::test]
async fn test_session_against_mock_connection_manager() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bosh"))
        .respond_with(connection_manager)
        .mount(&mock_server)
        .await;

    let config = BoshConfig::for_domain("example.com")
        .with_host(mock_server.uri(), None)
        .with_compression(vec![ContentCodec::Deflate]);
    let collector = Arc::new(Collector::default());
    let session = Session::new(config, collector.clone()).unwrap();

    session.connect().await.unwrap();
    assert_eq!(session.state(), Phase::Connected);
    assert_eq!(session.session_id().as_deref(), Some("wm-1"));
    assert_eq!(session.auth_id().as_deref(), Some("wm-auth"));

    session
        .send(vec!["<message to='echo'>hi</message>".to_string()])
        .unwrap();
    wait_until("echo", || !collector.delivered.lock().unwrap().is_empty()).await;
    assert_eq!(
        collector.delivered.lock().unwrap()[0],
        "<message from='echo'>hi</message>"
    );

    session.close().await;
    assert_eq!(session.state(), Phase::Disconnected);

    let requests = mock_server.received_requests().await.unwrap();
    let creation = &requests[0];
    assert!(creation.headers.get("content-encoding").is_none());
    assert_eq!(
        creation.headers.get("accept-encoding").unwrap().to_str().unwrap(),
        "deflate"
    );
    // After negotiation every request body is deflated
    assert!(requests[1..].iter().all(|r| {
        r.headers.get("content-encoding").map(|v| v.to_str().unwrap()) == Some("deflate")
    }));
    let bodies: Vec<Body> = requests.iter().map(request_body).collect();
    assert!(bodies.last().unwrap().is_terminate());
    let rids: Vec<u64> = bodies.iter().map(|b| b.rid.unwrap()).collect();
    let mut sorted = rids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), rids.len(), "RIDs are never reused");
    assert_eq!(sorted.last().unwrap() - sorted[0], (rids.len() - 1) as u64);
}

#[tokio::test]
async fn test_http_status_at_creation_is_a_terminal_condition() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bosh"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let config = BoshConfig::for_domain("example.com").with_host(mock_server.uri(), None);
    let session = Session::new(config, Arc::new(Collector::default())).unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, BoshError::Terminated { .. }));
    assert_eq!(err.condition(), Some(&Condition::PolicyViolation));
    assert_eq!(err.http_status(), Some(403));
    assert_eq!(session.state(), Phase::Disconnected);
}

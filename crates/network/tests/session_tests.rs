use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use network::{
    CancellationToken, DispatchHooks, HeaderValue, NetError, NetworkSession, TextEncoding,
    Timeout, TimeoutPhase,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, body_string, header, header_regex, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup() -> (MockServer, NetworkSession) {
    let server = MockServer::start().await;
    let session = NetworkSession::new().expect("session");
    (server, session)
}

#[tokio::test]
async fn test_session_headers_with_request_override() {
    let (server, session) = setup().await;
    session.set_header("user-agent", "session-agent");
    session.set_header("X-Extra", "1");

    Mock::given(method("GET"))
        .and(path("/headers"))
        .and(header("user-agent", "request-agent"))
        .and(header("x-extra", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .get(format!("{}/headers", server.uri()))
        .header("User-Agent", "request-agent")
        .send()
        .await
        .unwrap();

    assert_eq!(response.code(), 200);
    assert!(response.ok());
}

#[tokio::test]
async fn test_params_merge_with_url_query() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .get(format!("{}/search?q=rust&page=1", server.uri()))
        .param("page", "3")
        .send()
        .await
        .unwrap();

    assert_eq!(response.code(), 200);
}

#[tokio::test]
async fn test_form_and_json_bodies() {
    let (server, session) = setup().await;

    Mock::given(method("POST"))
        .and(path("/form"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("a=1&b=two+words"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/json"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"action": "next"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let form = session
        .post(format!("{}/form", server.uri()))
        .form([("a", "1"), ("b", "two words")])
        .send()
        .await
        .unwrap();
    assert_eq!(form.code(), 204);

    let json = session
        .post(format!("{}/json", server.uri()))
        .json(&json!({"action": "next"}))
        .send()
        .await
        .unwrap();
    assert_eq!(json.code(), 204);
}

#[tokio::test]
async fn test_explicit_content_type_is_kept() {
    let (server, session) = setup().await;

    Mock::given(method("POST"))
        .and(path("/custom"))
        .and(header("content-type", "application/vnd.custom+json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    session
        .post(format!("{}/custom", server.uri()))
        .header("Content-Type", "application/vnd.custom+json")
        .json(&json!({"x": 1}))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_conflicting_body_is_rejected() {
    let (server, session) = setup().await;

    let result = session
        .post(format!("{}/both", server.uri()))
        .body("raw")
        .json(&json!({}))
        .send()
        .await;

    assert!(matches!(result, Err(NetError::ConflictingBody)));
}

#[tokio::test]
async fn test_get_with_body_still_sends() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/odd"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .get(format!("{}/odd", server.uri()))
        .json(&json!({"ignored": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.code(), 200);
}

#[tokio::test]
async fn test_cookies_round_trip_through_jar() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("Set-Cookie", "session=xyz; Path=/")
                .append_header("Set-Cookie", "theme=dark; Path=/"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header_regex("cookie", "session=xyz"))
        .and(header_regex("cookie", "extra=1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    session
        .get(format!("{}/login", server.uri()))
        .send()
        .await
        .unwrap();

    let cookies = session.cookies();
    assert_eq!(cookies.get("session").map(String::as_str), Some("xyz"));
    assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));

    let response = session
        .get(format!("{}/me", server.uri()))
        .cookie("extra", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.code(), 200);
}

#[tokio::test]
async fn test_redirect_policy_per_request() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("{}/landing", server.uri())),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
        .mount(&server)
        .await;

    let mut followed = session
        .get(format!("{}/start", server.uri()))
        .send()
        .await
        .unwrap();
    assert_eq!(followed.code(), 200);
    assert_eq!(followed.url().path(), "/landing");
    assert_eq!(followed.text().await.unwrap(), "landed");

    let held = session
        .get(format!("{}/start", server.uri()))
        .allow_redirects(false)
        .send()
        .await
        .unwrap();
    assert_eq!(held.code(), 302);
    assert!(held.header("location").unwrap().ends_with("/landing"));
}

#[tokio::test]
async fn test_connect_timeout() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let result = session
        .get(format!("{}/slow", server.uri()))
        .timeout(Timeout::Split {
            connect: Duration::from_millis(50),
            transfer: Duration::ZERO,
        })
        .send()
        .await;

    assert!(matches!(
        result,
        Err(NetError::Timeout {
            phase: TimeoutPhase::Connect,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancellation() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/never"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = session
        .get(format!("{}/never", server.uri()))
        .cancellation(token)
        .send()
        .await;

    assert!(matches!(result, Err(NetError::Cancelled)));
}

#[tokio::test]
async fn test_text_and_json_decoding() {
    let (server, session) = setup().await;

    let utf16: Vec<u8> = "{\"reply\":\"héllo\"}"
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();

    Mock::given(method("GET"))
        .and(path("/utf16"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(utf16, "application/json"))
        .mount(&server)
        .await;

    let mut response = session
        .get(format!("{}/utf16", server.uri()))
        .send_and_wait()
        .await
        .unwrap();

    assert!(response.finished());
    assert_eq!(response.encoding().await.unwrap(), TextEncoding::Utf16Le);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reply"], "héllo");
}

#[tokio::test]
async fn test_error_for_status_describes() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let response = session
        .get(format!("{}/missing", server.uri()))
        .send()
        .await
        .unwrap();
    assert!(!response.ok());

    match response.error_for_status() {
        Err(NetError::Status {
            status,
            description,
            ..
        }) => {
            assert_eq!(status, 404);
            assert_eq!(description, "No resource found at the given location.");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_basic_auth() {
    let (server, session) = setup().await;

    // base64("user:pass")
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    session
        .get(format!("{}/private", server.uri()))
        .basic_auth("user", "pass")
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dispatch_reports_progress_and_finish() {
    let (server, session) = setup().await;
    let payload = "x".repeat(64 * 1024);

    Mock::given(method("GET"))
        .and(path("/download"))
        .respond_with(ResponseTemplate::new(200).set_body_string(payload.clone()))
        .mount(&server)
        .await;

    let received = Arc::new(AtomicU64::new(0));
    let progress_seen = Arc::clone(&received);
    let (tx, rx) = tokio::sync::oneshot::channel();

    let handle = session.get(format!("{}/download", server.uri())).dispatch(
        DispatchHooks::new()
            .on_progress(move |so_far, _total| {
                progress_seen.store(so_far, Ordering::SeqCst);
            })
            .on_finished(move |result| {
                let _ = tx.send(result.map(|r| (r.code(), r.finished())));
            }),
    );

    handle.await.unwrap();
    let (code, finished) = rx.await.unwrap().unwrap();
    assert_eq!(code, 200);
    assert!(finished);
    assert_eq!(received.load(Ordering::SeqCst), payload.len() as u64);
}

#[tokio::test]
async fn test_typed_header_values() {
    let (server, session) = setup().await;

    Mock::given(method("GET"))
        .and(path("/cached"))
        .and(header("if-none-match", "\"abc\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let response = session
        .get(format!("{}/cached", server.uri()))
        .header("If-None-Match", HeaderValue::List(vec!["\"abc\"".to_string()]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.code(), 304);
    assert!(response.ok());
}

use std::sync::Arc;

use chatgpt_client::{
    AuthState, Client, ClientConfig, ClientError, MemoryTokenStore, TokenStore, SESSION_COOKIE,
};
use chatgpt_core::{timestamp, Conversation, CoreError, Role, Session};
use chrono::Duration;
use events::{Event, EventBus, Subscription};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use uuid::Uuid;
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONVERSATION_ID: &str = "5ce1a2a4-4b7c-4b8b-9d54-2b8c9a7a8c01";
const REPLY_ID: &str = "0b4b27b1-4a51-4bf6-8a0c-31cbaf0e3b6d";

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        chat_url: server.uri(),
        auth_url: server.uri(),
        session_token: None,
        ..Default::default()
    }
}

fn stored_session() -> Session {
    Session {
        session_token: Some("session-token-value".to_string()),
        ..Session::new()
    }
}

fn session_body() -> Value {
    json!({
        "user": {
            "id": "user-1",
            "name": "Ada",
            "email": "ada@example.com",
            "image": "",
            "picture": "",
            "groups": [],
            "features": []
        },
        "expires": "2099-01-01T00:00:00.000Z",
        "accessToken": "access-123"
    })
}

fn reply_frame(text: &str) -> String {
    format!(
        "data: {}",
        json!({
            "message": {
                "id": REPLY_ID,
                "author": {"role": "assistant"},
                "content": {"content_type": "text", "parts": [text]}
            },
            "conversation_id": CONVERSATION_ID,
            "error": null
        })
    )
}

fn event_stream_body() -> String {
    format!(
        "{}\n\n{}\n\ndata: [DONE]\n\n",
        reply_frame("Hi"),
        reply_frame("Hi there")
    )
}

async fn mount_session(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
        .mount(server)
        .await;
}

async fn mount_models(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/backend-api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"slug": "text-davinci-002-render-sha"}, {"slug": "gpt-4"}]
        })))
        .mount(server)
        .await;
}

async fn client_with(server: &MockServer, store: Arc<MemoryTokenStore>) -> (Client, Subscription) {
    let events = EventBus::new();
    let rx = events.subscribe();
    let client = Client::new(config(server), events, store).await.expect("client");
    (client, rx)
}

#[tokio::test]
async fn test_send_without_token_requires_authentication() {
    let server = MockServer::start().await;
    let (client, mut rx) = client_with(&server, Arc::new(MemoryTokenStore::new())).await;

    let mut conversation = Conversation::new();
    let err = client
        .send_message("hello", &mut conversation)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::NotSignedIn));
    assert!(conversation.is_empty());
    assert!(rx.drain()
        .iter()
        .any(|event| matches!(event, Event::AuthenticationRequired)));
    assert_eq!(client.auth_state().await, AuthState::SignedOut);

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|request| request.method.as_str() != "POST"));
}

#[tokio::test]
async fn test_send_message_first_in_conversation() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    mount_models(&server).await;

    Mock::given(method("POST"))
        .and(path("/backend-api/conversation"))
        .and(header("accept", "text/event-stream"))
        .and(header("authorization", "Bearer access-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(event_stream_body()),
        )
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, mut rx) = client_with(&server, store).await;

    let mut conversation = Conversation::new();
    let reply = client.send_message("hello", &mut conversation).await.unwrap();

    assert_eq!(reply.text.as_deref(), Some("Hi there"));
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(conversation.id.unwrap().to_string(), CONVERSATION_ID);
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.messages[0].text.as_deref(), Some("hello"));
    assert_eq!(conversation.messages[1].id, reply.id);

    let posts: Vec<Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.method.as_str() == "POST")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect();
    let first = &posts[0];
    assert_eq!(first["action"], "next");
    assert_eq!(first["model"], "text-davinci-002-render-sha");
    assert!(first.get("conversation_id").is_none());
    assert_eq!(first["messages"][0]["content"]["parts"], json!(["hello"]));
    assert_eq!(first["messages"][0]["role"], "user");
    assert_ne!(
        first["parent_message_id"].as_str().unwrap(),
        conversation.messages[0].id.to_string()
    );

    // A second send continues from the reply
    client.send_message("more", &mut conversation).await.unwrap();
    assert_eq!(conversation.len(), 4);
    assert_eq!(conversation.id.unwrap().to_string(), CONVERSATION_ID);

    let posts: Vec<Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.method.as_str() == "POST")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect();
    assert_eq!(posts[1]["conversation_id"], CONVERSATION_ID);
    assert_eq!(posts[1]["parent_message_id"], REPLY_ID);

    let registered = client.conversation(conversation.id.unwrap()).await.unwrap();
    assert_eq!(registered, conversation);

    let events = rx.drain();
    let progress = events
        .iter()
        .filter(|event| matches!(event, Event::MessageProgress { .. }))
        .count();
    assert_eq!(progress, 4);
    let received: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::MessageReceived { conversation, .. } => Some(conversation.len()),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![2, 4]);
}

#[tokio::test]
async fn test_unauthorized_get_retries_once() {
    let server = MockServer::start().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/backend-api/models"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store).await;

    let err = client.get_models().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized));

    let session_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/api/auth/session")
        .count();
    assert_eq!(session_calls, 2);
}

#[tokio::test]
async fn test_models_are_cached() {
    let server = MockServer::start().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/backend-api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"slug": "text-davinci-002-render-sha"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store).await;

    let first = client.get_models().await.unwrap();
    let second = client.get_models().await.unwrap();
    assert_eq!(first, vec!["text-davinci-002-render-sha".to_string()]);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_empty_model_list() {
    let server = MockServer::start().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/backend-api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store).await;

    assert!(matches!(client.get_models().await, Err(ClientError::NoModels)));
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let server = MockServer::start().await;
    mount_session(&server).await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store.clone()).await;

    assert!(client.refresh_auth().await.unwrap());
    let after_first = (client.session().await, client.access_token().await);
    assert!(client.refresh_auth().await.unwrap());
    let after_second = (client.session().await, client.access_token().await);

    assert_eq!(after_first, after_second);
    assert_eq!(client.auth_state().await, AuthState::Authenticated);
    assert_eq!(client.access_token().await.as_deref(), Some("access-123"));
    assert_eq!(client.user().await.unwrap().email, "ada@example.com");
    assert_eq!(
        client
            .network()
            .header("Authorization")
            .map(|value| value.to_string()),
        Some("Bearer access-123".to_string())
    );

    let persisted = store.load().await.unwrap().unwrap();
    assert_eq!(persisted, client.session().await);
}

#[tokio::test]
async fn test_etag_makes_refresh_conditional() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_json(session_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store).await;

    assert!(client.refresh_auth().await.unwrap());
    assert!(client.refresh_auth().await.unwrap());
    assert_eq!(client.auth_state().await, AuthState::Authenticated);
}

#[tokio::test]
async fn test_rejected_session_requires_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, mut rx) = client_with(&server, store).await;

    assert!(!client.refresh_auth().await.unwrap());
    assert_eq!(client.auth_state().await, AuthState::HasSessionToken);
    assert!(client.access_token().await.is_none());
    assert!(rx.drain()
        .iter()
        .any(|event| matches!(event, Event::AuthenticationRequired)));
}

#[tokio::test]
async fn test_expired_token_is_deleted() {
    let server = MockServer::start().await;
    let expired = Session {
        session_expires: Some(timestamp::now() - Duration::hours(1)),
        ..stored_session()
    };
    let store = Arc::new(MemoryTokenStore::with_session(expired));
    let (client, mut rx) = client_with(&server, store.clone()).await;

    assert!(!client.refresh_auth().await.unwrap());
    assert_eq!(client.auth_state().await, AuthState::SignedOut);
    assert!(client.session_token().await.is_none());
    assert!(store.load().await.unwrap().is_none());

    let events = rx.drain();
    assert!(matches!(events.as_slice(), [Event::SignedOut, Event::AuthenticationRequired]));

    let session_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/api/auth/session")
        .count();
    assert_eq!(session_calls, 0);
}

#[tokio::test]
async fn test_sign_out_clears_everything() {
    let server = MockServer::start().await;
    mount_session(&server).await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, mut rx) = client_with(&server, store.clone()).await;
    assert!(client.refresh_auth().await.unwrap());

    client.sign_out().await.unwrap();

    assert_eq!(client.auth_state().await, AuthState::SignedOut);
    assert!(client.access_token().await.is_none());
    assert!(client.user().await.is_none());
    assert!(client.network().header("Authorization").is_none());
    assert_eq!(client.hidden_token().await, "None");
    assert!(store.load().await.unwrap().is_none());
    assert!(rx.drain()
        .iter()
        .any(|event| matches!(event, Event::SignedOut)));
}

#[tokio::test]
async fn test_rotated_session_cookie_is_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "set-cookie",
                    "__Secure-next-auth.session-token=rotated-token-value; Path=/; HttpOnly",
                )
                .set_body_json(session_body()),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store.clone()).await;

    assert!(client.refresh_auth().await.unwrap());
    assert_eq!(
        client.session_token().await.as_deref(),
        Some("rotated-token-value")
    );
    assert_eq!(
        store.load().await.unwrap().unwrap().session_token.as_deref(),
        Some("rotated-token-value")
    );
}

#[tokio::test]
async fn test_session_cookie_without_path_is_rotated_and_forgotten() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "set-cookie",
                    "__Secure-next-auth.session-token=rotated-token-value; HttpOnly",
                )
                .set_body_json(session_body()),
        )
        .mount(&server)
        .await;
    mount_models(&server).await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, _rx) = client_with(&server, store.clone()).await;

    assert!(client.refresh_auth().await.unwrap());
    assert_eq!(
        client.session_token().await.as_deref(),
        Some("rotated-token-value")
    );

    client.sign_out().await.unwrap();
    assert!(client.network().cookie_jar().get(SESSION_COOKIE).is_none());

    client.get("backend-api/models").await.unwrap();
    assert!(client.session_token().await.is_none());
    assert_eq!(client.auth_state().await, AuthState::SignedOut);
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_percent_encoded_tokens_are_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "expires": "2099-01-01T00:00:00.000Z",
            "accessToken": "access%2E123"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    let (client, _rx) = client_with(&server, store.clone()).await;

    client.set_session_token("eyJhbGci%2EeyJzdWIi%2Esig").await.unwrap();
    assert_eq!(
        client.session_token().await.as_deref(),
        Some("eyJhbGci.eyJzdWIi.sig")
    );
    assert_eq!(
        client.network().cookie_jar().get(SESSION_COOKIE).as_deref(),
        Some("eyJhbGci.eyJzdWIi.sig")
    );
    assert_eq!(
        store.load().await.unwrap().unwrap().session_token.as_deref(),
        Some("eyJhbGci.eyJzdWIi.sig")
    );

    assert!(client.refresh_auth().await.unwrap());
    assert_eq!(client.access_token().await.as_deref(), Some("access.123"));

    let requests = server.received_requests().await.unwrap();
    let session_request = requests
        .iter()
        .find(|request| request.url.path() == "/api/auth/session")
        .unwrap();
    let cookie = session_request.headers.get("cookie").unwrap().to_str().unwrap();
    assert!(cookie.contains("__Secure-next-auth.session-token=eyJhbGci.eyJzdWIi.sig"));
}

#[tokio::test]
async fn test_reply_for_another_conversation_keeps_exchange() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    mount_models(&server).await;
    Mock::given(method("POST"))
        .and(path("/backend-api/conversation"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(event_stream_body()),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::with_session(stored_session()));
    let (client, mut rx) = client_with(&server, store).await;

    let existing = Uuid::new_v4();
    let mut conversation = Conversation {
        id: Some(existing),
        messages: Vec::new(),
    };
    let err = client
        .send_message("hello", &mut conversation)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Core(CoreError::ConversationIdImmutable { .. })
    ));
    assert_eq!(conversation.id, Some(existing));
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.messages[0].text.as_deref(), Some("hello"));
    assert_eq!(conversation.messages[1].text.as_deref(), Some("Hi there"));
    assert!(!rx
        .drain()
        .iter()
        .any(|event| matches!(event, Event::MessageReceived { .. })));
}

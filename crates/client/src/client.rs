//! The chat service client.
//!
//! Owns the network session, keeps the session token and the derived access
//! token fresh, and sends messages. Sign-in is delegated to the
//! [`Authenticator`]; every outcome a front-end cares about is published on
//! the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chatgpt_core::{timestamp, Action, Conversation, Message, Session, User};
use eventsource_stream::{EventStreamError, Eventsource};
use events::{Event, EventBus};
use futures::StreamExt;
use network::{NetworkSession, Response};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::clearance::{Clearance, ClearanceProvider, StaticClearance};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::state::{AuthState, AuthStateMachine};
use crate::stream::{self, DONE};
use crate::token_store::TokenStore;
use crate::SESSION_COOKIE;

const SESSION_PATH: &str = "api/auth/session";
const MODELS_PATH: &str = "backend-api/models";
const CONVERSATION_PATH: &str = "backend-api/conversation";

#[derive(Debug, Deserialize)]
struct SessionEndpoint {
    user: Option<User>,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    expires: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    slug: String,
}

#[derive(Debug, Default)]
struct ClientState {
    auth: AuthState,
    session: Session,
    access_token: Option<String>,
    models: Option<Vec<String>>,
    conversations: HashMap<Uuid, Conversation>,
}

impl ClientState {
    fn move_to(&mut self, to: AuthState) -> Result<()> {
        AuthStateMachine::validate_transition(&self.auth, &to)?;
        if self.auth != to {
            debug!(from = %self.auth, to = %to, "Auth state changed");
        }
        self.auth = to;
        Ok(())
    }

    /// Leave `Refreshing` for whatever the tokens on hand allow.
    fn settle(&mut self) -> Result<()> {
        let to = if self.access_token.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::HasSessionToken
        };
        self.move_to(to)
    }
}

pub struct Client {
    config: ClientConfig,
    http: NetworkSession,
    authenticator: Authenticator,
    events: EventBus,
    store: Arc<dyn TokenStore>,
    state: RwLock<ClientState>,
    first_request: AtomicBool,
}

impl Client {
    /// Build a client whose sign-in uses the clearance values from `config`.
    pub async fn new(
        config: ClientConfig,
        events: EventBus,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        let clearance = StaticClearance::new(Clearance {
            bm: config.cf_bm.clone(),
            clearance: config.cf_clearance.clone(),
            user_agent: None,
        });
        Self::with_clearance(config, events, store, Arc::new(clearance)).await
    }

    pub async fn with_clearance(
        config: ClientConfig,
        events: EventBus,
        store: Arc<dyn TokenStore>,
        clearance: Arc<dyn ClearanceProvider>,
    ) -> Result<Self> {
        let stored = match store.load().await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting without one");
                Session::new()
            }
        };

        let session = match config.token_override() {
            Some(token) => {
                debug!("Using session token from config or environment");
                Session {
                    session_token: Some(token),
                    cloudflare: stored.cloudflare.clone(),
                    user_agent: stored.user_agent.clone(),
                    ..Session::new()
                }
            }
            None => stored,
        };

        let http = NetworkSession::with_proxy(config.proxy_config()?)?;
        let origin = config.chat_url.trim_end_matches('/').to_string();
        for (name, value) in [
            ("Accept", "*/*".to_string()),
            ("Accept-Language", "en-US,en;q=0.5".to_string()),
            ("DNT", "1".to_string()),
            ("Origin", origin),
            ("Referer", config.chat_endpoint("chat")),
            ("Sec-Fetch-Dest", "empty".to_string()),
            ("Sec-Fetch-Mode", "cors".to_string()),
            ("Sec-Fetch-Site", "same-site".to_string()),
            ("Sec-GPC", "1".to_string()),
            ("User-Agent", config.user_agent.clone()),
            ("X-OpenAI-Assistant-App-Id", String::new()),
        ] {
            http.set_header(name, value);
        }

        let host = config.chat_host();
        if let Some(token) = &session.session_token {
            http.set_cookie(SESSION_COOKIE, token, &host, None);
        }
        if let Some(bm) = &session.cloudflare.bm {
            http.set_cookie("__cf_bm", bm, &host, None);
        }
        if let Some(clearance) = &session.cloudflare.clearance {
            http.set_cookie("cf_clearance", clearance, &host, None);
        }

        let authenticator = Authenticator::new(config.clone(), events.clone(), clearance);
        authenticator.restore(&session).await;

        let auth = if session.session_token.is_some() {
            AuthState::HasSessionToken
        } else {
            AuthState::NoToken
        };
        info!(state = %auth, "Client ready");

        Ok(Self {
            config,
            http,
            authenticator,
            events,
            store,
            state: RwLock::new(ClientState {
                auth,
                session,
                ..Default::default()
            }),
            first_request: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// The underlying network session, shared with every request.
    pub fn network(&self) -> &NetworkSession {
        &self.http
    }

    pub async fn auth_state(&self) -> AuthState {
        self.state.read().await.auth
    }

    pub async fn user(&self) -> Option<User> {
        self.state.read().await.session.user.clone()
    }

    pub async fn session(&self) -> Session {
        self.state.read().await.session.clone()
    }

    pub async fn session_token(&self) -> Option<String> {
        self.state.read().await.session.session_token.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state.read().await.access_token.clone()
    }

    /// First and last three characters of the session token, for display.
    pub async fn hidden_token(&self) -> String {
        let state = self.state.read().await;
        mask_token(state.session.session_token.as_deref())
    }

    /// Snapshot of a conversation this client has sent to.
    pub async fn conversation(&self, id: Uuid) -> Option<Conversation> {
        self.state.read().await.conversations.get(&id).cloned()
    }

    /// Adopt `token` as the session token and persist it.
    pub async fn set_session_token(&self, token: &str) -> Result<()> {
        let token = decode_token(token);
        if token.is_empty() {
            return self.delete_session_token().await;
        }

        let mut state = self.state.write().await;
        self.http
            .set_cookie(SESSION_COOKIE, &token, &self.config.chat_host(), None);
        state.session.session_token = Some(token);
        self.store.save(&state.session).await?;

        if matches!(state.auth, AuthState::NoToken | AuthState::SignedOut) {
            state.move_to(AuthState::HasSessionToken)?;
        }
        Ok(())
    }

    /// Forget the session token everywhere: memory, cookie jar and store.
    pub async fn delete_session_token(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.session.session_token = None;
            state.session.session_expires = None;
            state.session.user = None;
            state.access_token = None;
            self.http.remove_header("Authorization");
            self.http.remove_cookies_named(SESSION_COOKIE);
            self.store.clear().await?;
            state.move_to(AuthState::SignedOut)?;
        }

        info!("Session token deleted");
        self.events.emit(Event::SignedOut);
        Ok(())
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.delete_session_token().await
    }

    /// Run the sign-in handshake. On success the new session token is
    /// adopted and the access token refreshed.
    ///
    /// The outcome is also published on the event bus.
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<bool> {
        let Some(session) = self.authenticator.authenticate(username, password).await else {
            return Ok(false);
        };

        {
            let mut state = self.state.write().await;
            state.session.user = session.user.clone();
            state.session.session_expires = session.session_expires;
            state.session.cloudflare = session.cloudflare.clone();
            state.session.user_agent = session.user_agent.clone();
        }
        if let Some(agent) = &session.user_agent {
            self.http.set_header("User-Agent", agent.as_str());
        }

        match &session.session_token {
            Some(token) => self.set_session_token(token).await?,
            None => return Ok(false),
        }
        self.refresh_auth().await
    }

    /// Refresh the access token from the session endpoint.
    ///
    /// Without a usable session token this publishes
    /// [`Event::AuthenticationRequired`] and returns `Ok(false)`. An expired
    /// token is deleted first.
    pub async fn refresh_auth(&self) -> Result<bool> {
        if self.first_request.swap(false, Ordering::SeqCst) {
            self.warm_up().await;
        }

        let (has_token, expired) = {
            let state = self.state.read().await;
            (
                state.session.session_token.is_some(),
                state.session.is_expired_at(timestamp::now()),
            )
        };

        if has_token && expired {
            info!("Session token expired");
            self.delete_session_token().await?;
            self.events.emit(Event::AuthenticationRequired);
            return Ok(false);
        }
        if !has_token {
            self.state.write().await.move_to(AuthState::SignedOut)?;
            self.events.emit(Event::AuthenticationRequired);
            return Ok(false);
        }

        self.state.write().await.move_to(AuthState::Refreshing)?;

        let mut response = match self.raw_get(&self.config.chat_endpoint(SESSION_PATH)).await {
            Ok(response) => response,
            Err(e) => {
                self.state.write().await.settle()?;
                return Err(e.into());
            }
        };

        if response.code() == 304 {
            debug!("Session unchanged");
            let mut state = self.state.write().await;
            state.settle()?;
            return Ok(state.access_token.is_some());
        }
        if response.code() == 401 {
            return self.require_authentication().await;
        }
        if !response.ok() {
            self.state.write().await.settle()?;
            response.error_for_status()?;
            return Ok(false);
        }

        if let Some(etag) = response.header("ETag") {
            self.http.set_header("If-None-Match", etag);
        }

        let body = match response.json::<SessionEndpoint>().await {
            Ok(body) => body,
            Err(e) => {
                self.state.write().await.settle()?;
                return Err(e.into());
            }
        };
        let Some(access_token) = body
            .access_token
            .map(|token| decode_token(&token))
            .filter(|token| !token.is_empty())
        else {
            return self.require_authentication().await;
        };

        let mut state = self.state.write().await;
        if let Some(user) = body.user {
            state.session.user = Some(user);
        }
        if let Some(expires) = body.expires.as_deref() {
            match timestamp::parse(expires) {
                Ok(expires) => state.session.session_expires = Some(expires),
                Err(e) => warn!(error = %e, "Ignoring unparsable session expiry"),
            }
        }
        self.http
            .set_header("Authorization", format!("Bearer {access_token}"));
        state.access_token = Some(access_token);
        self.sync_session_token(&mut state);
        self.store.save(&state.session).await?;
        state.move_to(AuthState::Authenticated)?;

        info!(token = %mask_token(state.session.session_token.as_deref()), "Authentication refreshed");
        Ok(true)
    }

    async fn require_authentication(&self) -> Result<bool> {
        warn!("Session endpoint rejected the session token");
        {
            let mut state = self.state.write().await;
            state.access_token = None;
            self.http.remove_header("Authorization");
            state.move_to(AuthState::HasSessionToken)?;
        }
        self.events.emit(Event::AuthenticationRequired);
        Ok(false)
    }

    /// Unauthenticated GET of the chat page that primes the cookie jar.
    async fn warm_up(&self) {
        if let Err(e) = self.raw_get(&self.config.chat_endpoint("chat")).await {
            debug!(error = %e, "Warm-up request failed");
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        if self.first_request.swap(false, Ordering::SeqCst) {
            self.warm_up().await;
            self.refresh_auth().await?;
        }
        Ok(())
    }

    async fn raw_get(&self, url: &str) -> network::Result<Response> {
        self.http
            .get(url)
            .timeout(self.config.request_timeout())
            .send_and_wait()
            .await
    }

    /// Adopt a session token the server rotated through `Set-Cookie`. A
    /// signed-out client never picks a token back up from the jar.
    fn sync_session_token(&self, state: &mut ClientState) -> bool {
        if state.session.session_token.is_none() {
            return false;
        }
        match self.http.cookie_jar().get(SESSION_COOKIE) {
            Some(token) if state.session.session_token.as_ref() != Some(&token) => {
                debug!("Session token rotated by the server");
                self.http
                    .set_cookie(SESSION_COOKIE, &token, &self.config.chat_host(), None);
                state.session.session_token = Some(token);
                true
            }
            _ => false,
        }
    }

    /// GET `path` under the chat root. A 401 triggers one refresh and one
    /// retry; a second 401 is [`ClientError::Unauthorized`].
    pub async fn get(&self, path: &str) -> Result<Response> {
        self.bootstrap().await?;
        let url = self.config.chat_endpoint(path);

        let response = self.raw_get(&url).await?;
        self.after_request().await?;
        if response.code() != 401 {
            return Ok(response);
        }

        debug!(path, "Unauthorized, refreshing session");
        if !self.refresh_auth().await? {
            return Err(ClientError::Unauthorized);
        }

        let response = self.raw_get(&url).await?;
        self.after_request().await?;
        if response.code() == 401 {
            return Err(ClientError::Unauthorized);
        }
        Ok(response)
    }

    async fn after_request(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if self.sync_session_token(&mut state) {
            self.store.save(&state.session).await?;
        }
        Ok(())
    }

    /// Model slugs the account can use, fetched once per client.
    pub async fn get_models(&self) -> Result<Vec<String>> {
        if let Some(models) = &self.state.read().await.models {
            return Ok(models.clone());
        }

        let mut response = self.get(MODELS_PATH).await?.error_for_status()?;
        let list: ModelList = response.json().await?;
        let models: Vec<String> = list.models.into_iter().map(|m| m.slug).collect();
        if models.is_empty() {
            return Err(ClientError::NoModels);
        }

        debug!(count = models.len(), "Fetched models");
        self.state.write().await.models = Some(models.clone());
        Ok(models)
    }

    fn pick_model(&self, models: &[String]) -> Result<String> {
        let preferred = self
            .config
            .model
            .as_deref()
            .and_then(|wanted| models.iter().find(|m| m.as_str() == wanted));

        preferred
            .or_else(|| models.first())
            .cloned()
            .ok_or(ClientError::NoModels)
    }

    /// Send `text` in `conversation` and wait for the complete reply.
    ///
    /// On success the conversation gains its id (if it had none), the sent
    /// message and the reply, and [`Event::MessageReceived`] is published.
    pub async fn send_message(&self, text: &str, conversation: &mut Conversation) -> Result<Message> {
        self.bootstrap().await?;
        if self.state.read().await.session.session_token.is_none() {
            return Err(ClientError::NotSignedIn);
        }

        let models = self.get_models().await?;
        let model = self.pick_model(&models)?;
        let action = Action::next(model, conversation, Message::new(text));
        debug!(model = %action.model, parent = %action.parent_id, "Sending message");

        let mut response = self.post_action(&action).await?;
        if response.code() == 401 {
            debug!("Unauthorized, refreshing session");
            if !self.refresh_auth().await? {
                return Err(ClientError::Unauthorized);
            }
            response = self.post_action(&action).await?;
            if response.code() == 401 {
                return Err(ClientError::Unauthorized);
            }
        }
        let response = response.error_for_status()?;

        let body = self.read_stream(response, conversation.id).await?;
        let frame = stream::parse_reply(&body)?;

        conversation.messages.extend(action.messages);
        conversation.push(frame.message.clone());
        if let Err(e) = conversation.assign_id(frame.conversation_id) {
            warn!(reply = %frame.message.id, error = %e, "Reply belongs to another conversation");
            return Err(e.into());
        }

        self.state
            .write()
            .await
            .conversations
            .insert(frame.conversation_id, conversation.clone());

        info!(conversation = %frame.conversation_id, "Reply received");
        self.events.emit(Event::MessageReceived {
            message: frame.message.clone(),
            conversation: conversation.clone(),
        });
        Ok(frame.message)
    }

    async fn post_action(&self, action: &Action) -> Result<Response> {
        Ok(self
            .http
            .post(self.config.chat_endpoint(CONVERSATION_PATH))
            .header("Accept", "text/event-stream")
            .json(action)
            .timeout(self.config.message_timeout())
            .send()
            .await?)
    }

    /// Read the whole event stream, publishing progress frames on the way.
    async fn read_stream(&self, response: Response, conversation_id: Option<Uuid>) -> Result<String> {
        let mut raw = Vec::new();
        {
            let chunks = response.into_stream().inspect(|chunk| {
                if let Ok(bytes) = chunk {
                    raw.extend_from_slice(bytes);
                }
            });
            let mut frames = std::pin::pin!(chunks.eventsource());

            while let Some(frame) = frames.next().await {
                let frame = frame.map_err(stream_error)?;
                if frame.data.is_empty() || frame.data == DONE {
                    continue;
                }
                if let Some(reply) = stream::parse_frame(&frame.data) {
                    if let Some(text) = reply.message.text {
                        self.events.emit(Event::MessageProgress {
                            conversation_id: conversation_id.or(Some(reply.conversation_id)),
                            message_id: reply.message.id,
                            text,
                        });
                    }
                }
            }
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("chat_url", &self.config.chat_url)
            .field("first_request", &self.first_request.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Timeouts and cancellation stay network errors; only undecodable frames
/// make the stream malformed.
fn stream_error(error: EventStreamError<network::NetError>) -> ClientError {
    match error {
        EventStreamError::Transport(e) => ClientError::Network(e),
        other => ClientError::MalformedStream(other.to_string()),
    }
}

/// Tokens copied out of a browser may still be percent-encoded.
fn decode_token(raw: &str) -> String {
    let raw = raw.trim();
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.trim().to_string(),
        Err(_) => raw.to_string(),
    }
}

fn mask_token(token: Option<&str>) -> String {
    match token {
        Some(token) if token.chars().count() > 6 => {
            let chars: Vec<char> = token.chars().collect();
            let head: String = chars[..3].iter().collect();
            let tail: String = chars[chars.len() - 3..].iter().collect();
            format!("{head}{}{tail}", ".".repeat(50))
        }
        _ => "None".to_string(),
    }
}

//! Interactive sign-in against the identity provider.
//!
//! The handshake is a strict sequence of requests. Any failing step ends the
//! attempt, and the next [`Authenticator::authenticate`] call starts over.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chatgpt_core::{timestamp, Session, User};
use chrono::Duration;
use events::{Event, EventBus};
use network::{NetworkSession, Response};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::clearance::ClearanceProvider;
use crate::config::ClientConfig;
use crate::error::AuthError;
use crate::SESSION_COOKIE;

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// How long harvested clearance is trusted.
const CLEARANCE_LIFETIME_HOURS: i64 = 1;

fn state_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"state=([^"&\s<>]+)"#).expect("valid state pattern"))
}

fn img_tag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid img pattern"))
}

fn captcha_alt() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"(?i)\balt\s*=\s*"captcha""#).expect("valid alt pattern"))
}

fn img_src() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"(?i)\bsrc\s*=\s*"([^"]*)""#).expect("valid src pattern"))
}

/// A captcha image lifted from the login page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captcha {
    pub mime: String,
    pub image: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct CsrfResponse {
    #[serde(rename = "csrfToken")]
    csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    user: Option<User>,
    expires: Option<String>,
}

/// Runs the sign-in handshake and reports the outcome on the event bus.
pub struct Authenticator {
    config: ClientConfig,
    events: EventBus,
    clearance: Arc<dyn ClearanceProvider>,
    session_data: Mutex<Session>,
    pending_captcha: StdMutex<Option<oneshot::Sender<String>>>,
    running: Mutex<()>,
}

impl Authenticator {
    pub fn new(
        config: ClientConfig,
        events: EventBus,
        clearance: Arc<dyn ClearanceProvider>,
    ) -> Self {
        Self {
            config,
            events,
            clearance,
            session_data: Mutex::new(Session::new()),
            pending_captcha: StdMutex::new(None),
            running: Mutex::new(()),
        }
    }

    /// Seed clearance and user agent from a stored session.
    pub async fn restore(&self, session: &Session) {
        let mut data = self.session_data.lock().await;
        data.cloudflare = session.cloudflare.clone();
        data.user_agent = session.user_agent.clone();
    }

    /// Snapshot of what the last attempt collected.
    pub async fn session_data(&self) -> Session {
        self.session_data.lock().await.clone()
    }

    /// Sign in with `username` and `password`.
    ///
    /// Never fails: the outcome is published as
    /// [`Event::AuthenticationSuccessful`] or [`Event::AuthenticationFailed`],
    /// and the new session is returned on success.
    pub async fn authenticate(&self, username: &str, password: &str) -> Option<Session> {
        let Ok(_guard) = self.running.try_lock() else {
            self.fail(username, AuthError::InProgress);
            return None;
        };

        match self.run(username, password).await {
            Ok(session) => {
                info!(username, "Sign-in succeeded");
                self.events.emit(Event::AuthenticationSuccessful {
                    session: session.clone(),
                });
                Some(session)
            }
            Err(e) => {
                self.fail(username, e);
                None
            }
        }
    }

    fn fail(&self, username: &str, error: AuthError) {
        warn!(username, error = %error, "Sign-in failed");
        self.events.emit(Event::AuthenticationFailed {
            username: username.to_string(),
            error: error.to_string(),
        });
    }

    /// Answer the captcha the running handshake is waiting on. Returns
    /// whether a handshake was waiting.
    pub fn solve_captcha(&self, text: impl Into<String>) -> bool {
        let sender = self
            .pending_captcha
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match sender {
            Some(sender) => sender.send(text.into()).is_ok(),
            None => {
                debug!("No captcha is pending");
                false
            }
        }
    }

    /// Give up on the pending captcha; the waiting handshake fails.
    pub fn cancel_captcha(&self) -> bool {
        self.pending_captcha
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    /// Whether a handshake is suspended on a captcha.
    pub fn captcha_pending(&self) -> bool {
        self.pending_captcha
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    fn new_network_session(&self, user_agent: &str) -> Result<NetworkSession, AuthError> {
        let session = NetworkSession::with_proxy(self.config.proxy_config()?)?;
        session.set_header("User-Agent", user_agent);
        session.set_header("Accept-Language", ACCEPT_LANGUAGE);
        Ok(session)
    }

    async fn run(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        // Step 1: credentials
        if username.trim().is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        // Step 2: bot-challenge clearance
        self.ensure_clearance().await?;
        let data = self.session_data.lock().await.clone();
        let user_agent = data
            .user_agent
            .clone()
            .unwrap_or_else(|| self.config.user_agent.clone());

        let http = self.new_network_session(&user_agent)?;
        let chat_host = self.config.chat_host();
        if let Some(bm) = &data.cloudflare.bm {
            http.set_cookie("__cf_bm", bm, &chat_host, None);
        }
        if let Some(clearance) = &data.cloudflare.clearance {
            http.set_cookie("cf_clearance", clearance, &chat_host, None);
        }

        // Step 3: CSRF token
        let login_page = self.config.chat_endpoint("auth/login");
        let mut response = http
            .get(self.config.chat_endpoint("api/auth/csrf"))
            .header("Accept", "*/*")
            .header("Referer", login_page.as_str())
            .send_and_wait()
            .await?;

        if !is_json(&response) {
            return Err(AuthError::MissingCsrfToken);
        }
        let csrf = response
            .json::<CsrfResponse>()
            .await
            .ok()
            .and_then(|body| body.csrf_token)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingCsrfToken)?;
        debug!("Got CSRF token");

        // Step 4: start the sign-in flow
        let mut response = http
            .post(self.config.chat_endpoint("api/auth/signin/auth0"))
            .param("prompt", "login")
            .header("Accept", "*/*")
            .header("Origin", self.config.chat_url.as_str())
            .header("Referer", login_page.as_str())
            .form([
                ("callbackUrl", "/"),
                ("csrfToken", csrf.as_str()),
                ("json", "true"),
            ])
            .send_and_wait()
            .await?;

        if response.code() != 200 || !is_json(&response) {
            return Err(AuthError::SignInRejected {
                status: response.code(),
            });
        }
        let authorize_url = response
            .json::<SignInResponse>()
            .await
            .ok()
            .and_then(|body| body.url)
            .ok_or(AuthError::MissingRedirectUrl)?;

        // Step 5: follow it to obtain the login state
        let mut response = http
            .get(authorize_url.as_str())
            .header("Accept", HTML_ACCEPT)
            .header("Referer", self.config.chat_endpoint(""))
            .allow_redirects(false)
            .send_and_wait()
            .await?;

        if response.code() != 302 {
            return Err(AuthError::RedirectFailed {
                url: authorize_url,
                status: response.code(),
            });
        }
        let state = extract_state(&mut response)
            .await
            .ok_or_else(|| AuthError::StateNotFound {
                url: authorize_url.clone(),
            })?;
        debug!("Got login state");

        // Step 6: login page, possibly with a captcha
        let identifier_url = self.config.auth_endpoint("u/login/identifier");
        let mut response = http
            .get(identifier_url.as_str())
            .param("state", state.as_str())
            .header("Accept", HTML_ACCEPT)
            .header("Referer", self.config.chat_endpoint(""))
            .send_and_wait()
            .await?;

        if response.code() != 200 {
            return Err(AuthError::LoginPageFailed {
                status: response.code(),
            });
        }
        let page = response.text().await.unwrap_or_default();
        let solved = match find_captcha(&page)? {
            Some(captcha) => Some(self.wait_for_captcha(captcha).await?),
            None => None,
        };

        // Step 7: the account must exist
        let mut form: Vec<(&str, &str)> = vec![("state", state.as_str()), ("username", username)];
        match &solved {
            Some(text) => form.extend([("captcha", text.as_str()), ("js-available", "true")]),
            None => form.push(("js-available", "false")),
        }
        form.extend([
            ("webauthn-available", "true"),
            ("is-brave", "false"),
            ("webauthn-platform-available", "true"),
            ("action", "default"),
        ]);

        let referer = format!("{identifier_url}?state={state}");
        let response = http
            .post(identifier_url.as_str())
            .param("state", state.as_str())
            .header("Accept", HTML_ACCEPT)
            .header("Origin", self.config.auth_url.as_str())
            .header("Referer", referer.as_str())
            .form(form)
            .allow_redirects(false)
            .send_and_wait()
            .await?;

        if response.code() != 302 {
            return Err(AuthError::InvalidAccount);
        }

        // Step 8: password, which yields the final state
        let password_url = self.config.auth_endpoint("u/login/password");
        let password_referer = format!("{password_url}?state={state}");
        let mut response = http
            .post(password_url.as_str())
            .param("state", state.as_str())
            .header("Accept", HTML_ACCEPT)
            .header("Origin", self.config.auth_url.as_str())
            .header("Referer", password_referer.as_str())
            .form([
                ("state", state.as_str()),
                ("username", username),
                ("password", password),
                ("action", "default"),
            ])
            .allow_redirects(false)
            .send_and_wait()
            .await?;

        if response.code() != 302 {
            return Err(AuthError::WrongCredentials);
        }
        let final_state = extract_state(&mut response)
            .await
            .ok_or(AuthError::FinalStateNotFound)?;

        // Step 9: resume to mint the session cookie
        let response = http
            .get(self.config.auth_endpoint("authorize/resume"))
            .param("state", final_state.as_str())
            .header("Accept", HTML_ACCEPT)
            .header("Referer", password_referer.as_str())
            .send_and_wait()
            .await?;

        if response.code() != 200 {
            return Err(AuthError::ResumeFailed {
                status: response.code(),
            });
        }
        let session_token = http
            .cookie_jar()
            .get(SESSION_COOKIE)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::TokenNotIssued)?;

        // Step 10: confirm through the session endpoint
        let mut response = http
            .get(self.config.chat_endpoint("api/auth/session"))
            .header("Accept", "*/*")
            .send_and_wait()
            .await?;

        if !response.ok() {
            return Err(AuthError::SessionCheck(format!(
                "status {}",
                response.code()
            )));
        }
        let body: SessionResponse = response
            .json()
            .await
            .map_err(|e| AuthError::SessionCheck(e.to_string()))?;

        let mut data = self.session_data.lock().await;
        data.user = body.user;
        data.session_expires = body
            .expires
            .as_deref()
            .map(timestamp::parse)
            .transpose()
            .map_err(|e| AuthError::SessionCheck(e.to_string()))?;
        let jar = http.cookie_jar();
        if let Some(bm) = jar.get("__cf_bm") {
            data.cloudflare.bm = Some(bm);
        }
        if let Some(clearance) = jar.get("cf_clearance") {
            data.cloudflare.clearance = Some(clearance);
        }
        data.cloudflare.expires =
            Some(timestamp::now() + Duration::hours(CLEARANCE_LIFETIME_HOURS));
        data.user_agent = Some(user_agent);
        data.session_token = Some(session_token);

        Ok(data.clone())
    }

    async fn ensure_clearance(&self) -> Result<(), AuthError> {
        let (valid, user_agent) = {
            let data = self.session_data.lock().await;
            (data.is_valid_clearance(), data.user_agent.clone())
        };
        if valid {
            return Ok(());
        }

        let known_agent = user_agent.or_else(|| Some(self.config.user_agent.clone()));
        let clearance = self
            .clearance
            .obtain(&self.config.chat_endpoint("chat"), known_agent.as_deref())
            .await?;

        let cookies = clearance.cookies();
        if !cookies.is_empty() {
            self.events.emit(Event::ClearanceUpdated {
                cookies: cookies
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect(),
            });
        }

        let mut data = self.session_data.lock().await;
        if let Some(agent) = &clearance.user_agent {
            if data.user_agent.as_ref() != Some(agent) {
                self.events.emit(Event::UserAgentUpdated {
                    user_agent: agent.clone(),
                });
            }
            data.user_agent = Some(agent.clone());
        }
        data.cloudflare.bm = clearance.bm.or(data.cloudflare.bm.take());
        if clearance.clearance.is_some() {
            data.cloudflare.clearance = clearance.clearance;
            data.cloudflare.expires =
                Some(timestamp::now() + Duration::hours(CLEARANCE_LIFETIME_HOURS));
        }
        Ok(())
    }

    async fn wait_for_captcha(&self, captcha: Captcha) -> Result<String, AuthError> {
        let (tx, rx) = oneshot::channel();
        *self
            .pending_captcha
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        info!(mime = %captcha.mime, "Captcha encountered, waiting for the answer");
        self.events.emit(Event::CaptchaEncountered {
            image: captcha.image,
            mime: captcha.mime,
        });

        rx.await
            .map(|text| text.trim().to_string())
            .map_err(|_| AuthError::CaptchaAbandoned)
    }
}

fn is_json(response: &Response) -> bool {
    response
        .header("Content-Type")
        .is_some_and(|value| value.contains("json"))
}

/// The `state` value from a redirect body, falling back to `Location`.
async fn extract_state(response: &mut Response) -> Option<String> {
    let location = response.header("Location").map(str::to_owned);
    let body = response.text().await.unwrap_or_default();

    [Some(body), location]
        .into_iter()
        .flatten()
        .find_map(|text| {
            state_pattern()
                .captures(&text)
                .map(|caps| caps[1].to_string())
        })
}

/// Find an `<img alt="captcha" src="data:<mime>;base64,<payload>">` tag.
pub fn find_captcha(html: &str) -> Result<Option<Captcha>, AuthError> {
    let Some(tag) = img_tag()
        .find_iter(html)
        .map(|m| m.as_str())
        .find(|tag| captcha_alt().is_match(tag))
    else {
        return Ok(None);
    };

    let src = img_src()
        .captures(tag)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| AuthError::CaptchaRender("captcha image has no source".to_string()))?;

    let (header, payload) = src
        .split_once(',')
        .ok_or_else(|| AuthError::CaptchaRender("captcha source is not a data URI".to_string()))?;

    let mime = header
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|mime| !mime.is_empty())
        .unwrap_or("image/svg+xml")
        .to_string();

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let image = STANDARD
        .decode(compact)
        .map_err(|e| AuthError::CaptchaRender(e.to_string()))?;

    Ok(Some(Captcha { mime, image }))
}

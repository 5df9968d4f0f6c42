//! Lazily read HTTP responses.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::encoding::{self, TextEncoding};
use crate::error::{NetError, Result, TimeoutPhase};
use crate::headers::CaseInsensitiveMap;
use crate::request::guarded_phase;
use crate::status;

enum BodyState {
    /// Body still on the wire.
    Pending(reqwest::Response),
    Ready(Bytes),
    Released,
}

/// One network reply.
///
/// Status, headers and the final URL are available as soon as the head has
/// arrived. The body is read on first access and cached. Dropping the
/// response (or calling [`Response::release`]) closes the underlying
/// connection if the body was not consumed.
pub struct Response {
    status: StatusCode,
    headers: CaseInsensitiveMap<String>,
    raw_headers: HeaderMap,
    url: Url,
    content_length: Option<u64>,
    body: BodyState,
    transfer_timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl Response {
    pub(crate) fn new(
        inner: reqwest::Response,
        transfer_timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            status: inner.status(),
            headers: CaseInsensitiveMap::from(inner.headers()),
            raw_headers: inner.headers().clone(),
            url: inner.url().clone(),
            content_length: inner.content_length(),
            body: BodyState::Pending(inner),
            transfer_timeout,
            cancellation,
        }
    }

    /// Numeric status code.
    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Canonical reason phrase, e.g. `Not Found`.
    pub fn reason(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("Unknown")
    }

    /// False for 4xx and 5xx statuses.
    pub fn ok(&self) -> bool {
        !status::is_error_status(self.code())
    }

    pub fn headers(&self) -> &CaseInsensitiveMap<String> {
        &self.headers
    }

    pub fn raw_headers(&self) -> &HeaderMap {
        &self.raw_headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// URL of the final hop after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the body has been read completely.
    pub fn finished(&self) -> bool {
        matches!(self.body, BodyState::Ready(_))
    }

    /// Read the remaining body, if any.
    pub async fn finish(&mut self) -> Result<()> {
        self.data().await.map(|_| ())
    }

    pub async fn data(&mut self) -> Result<&Bytes> {
        self.data_with_progress(|_, _| {}).await
    }

    /// Like [`Response::data`], reporting `(received, total)` after each chunk.
    pub async fn data_with_progress(
        &mut self,
        mut progress: impl FnMut(u64, Option<u64>),
    ) -> Result<&Bytes> {
        if let BodyState::Pending(inner) = &mut self.body {
            let mut buffer = BytesMut::new();
            loop {
                let next = guarded_phase(
                    inner.chunk(),
                    self.transfer_timeout,
                    TimeoutPhase::Transfer,
                    self.cancellation.as_ref(),
                )
                .await;

                match next {
                    Ok(Some(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        progress(buffer.len() as u64, self.content_length);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.body = BodyState::Released;
                        return Err(e);
                    }
                }
            }

            debug!(url = %self.url, bytes = buffer.len(), "Response body read");
            self.body = BodyState::Ready(buffer.freeze());
        }

        match &self.body {
            BodyState::Ready(bytes) => Ok(bytes),
            _ => Err(NetError::BodyReleased),
        }
    }

    /// Encoding of the body: the declared charset, otherwise a guess from
    /// the body's first bytes.
    pub async fn encoding(&mut self) -> Result<TextEncoding> {
        let content_type = self.header("Content-Type").map(str::to_owned);
        let data = self.data().await?;
        Ok(encoding::detect(content_type.as_deref(), data))
    }

    pub async fn text(&mut self) -> Result<String> {
        let encoding = self.encoding().await?;
        let data = self.data().await?;
        encoding.decode(data).ok_or(NetError::Decode {
            encoding: encoding.name(),
        })
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let text = self.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The body as a stream of chunks, for incremental consumers.
    pub fn into_stream(mut self) -> BoxStream<'static, Result<Bytes>> {
        let transfer_timeout = self.transfer_timeout;
        let cancellation = self.cancellation.take();

        match std::mem::replace(&mut self.body, BodyState::Released) {
            BodyState::Ready(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            BodyState::Released => stream::empty().boxed(),
            BodyState::Pending(inner) => {
                stream::unfold(Some((inner, cancellation)), move |state| async move {
                    let (mut inner, cancellation) = state?;
                    let next = guarded_phase(
                        inner.chunk(),
                        transfer_timeout,
                        TimeoutPhase::Transfer,
                        cancellation.as_ref(),
                    )
                    .await;
                    match next {
                        Ok(Some(chunk)) => Some((Ok(chunk), Some((inner, cancellation)))),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), None)),
                    }
                })
                .boxed()
            }
        }
    }

    /// Drop the body and close the connection if it is still open.
    pub fn release(&mut self) {
        self.body = BodyState::Released;
    }

    /// Turn 4xx and 5xx responses into [`NetError::Status`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.ok() {
            return Ok(self);
        }
        Err(NetError::Status {
            status: self.code(),
            url: self.url.to_string(),
            description: status::describe(self.status),
        })
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("finished", &self.finished())
            .finish_non_exhaustive()
    }
}

//! Connection lifecycle management for the automation session.
//!
//! The manager owns at most one live automation session. Tool handlers never
//! hold a session across calls; they go through [`ConnectionManager::with_page`]
//! and receive a page handle scoped to one callback. Concurrent callers that
//! arrive while a connect is in flight join the shared attempt instead of
//! racing to establish duplicate sessions.
//!
//! State machine: Disconnected -> Connecting -> Connected -> Disconnected.
//! Connecting -> Connecting is collapsed into the pending-attempt slot;
//! `reconnect: true` forces Connected -> Connecting even when a session is
//! live. A failure detected mid-callback only invalidates the cached handle;
//! the next call pays the reconnect cost, so failures stay visible to the
//! caller that hit them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::driver::{Driver, Page, Session, DEFAULT_PORT, PORT_ENV_VAR};
use crate::error::{Error, Result};

/// Per-call connection overrides, parsed fresh from tool arguments.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Full WebSocket endpoint, e.g. `ws://127.0.0.1:9420`.
    pub ws_endpoint: Option<String>,
    /// Automation port on localhost. Ignored when `ws_endpoint` is set.
    pub port: Option<u16>,
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Discard any live session and connect from scratch.
    pub reconnect: bool,
}

/// Server-level connection defaults that per-call overrides merge into.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Default automation endpoint.
    pub ws_endpoint: String,
    /// Default timeout for connection establishment and automation calls.
    pub timeout: Duration,
}

impl ConnectConfig {
    /// Create a config with an explicit endpoint and timeout.
    pub fn new(ws_endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ws_endpoint: ws_endpoint.into(),
            timeout,
        }
    }

    /// Resolve defaults from CLI flags and the environment. Flags win over
    /// the `WECHAT_DEVTOOLS_WS_PORT` environment variable, which wins over
    /// the built-in port.
    pub fn from_flags(ws_endpoint: Option<String>, port: Option<u16>, timeout: Duration) -> Self {
        let endpoint = ws_endpoint.unwrap_or_else(|| {
            let port = port
                .or_else(|| {
                    std::env::var(PORT_ENV_VAR)
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(DEFAULT_PORT);
            format!("ws://127.0.0.1:{port}")
        });
        Self::new(endpoint, timeout)
    }

    fn resolve(&self, overrides: &ConnectOptions) -> (String, Duration) {
        let endpoint = match (&overrides.ws_endpoint, overrides.port) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(port)) => format!("ws://127.0.0.1:{port}"),
            (None, None) => self.ws_endpoint.clone(),
        };
        let timeout = overrides
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        (endpoint, timeout)
    }
}

type SharedSession = Arc<dyn Session>;

/// A connect attempt shared between all callers that joined it. The error
/// side is an `Arc` because [`Error`] is not `Clone`.
type ConnectAttempt = Shared<BoxFuture<'static, std::result::Result<SharedSession, Arc<Error>>>>;

#[derive(Default)]
struct Inner {
    session: Option<SharedSession>,
    /// In-flight connect attempt, tagged with the epoch that started it.
    pending: Option<(u64, ConnectAttempt)>,
    /// Bumped whenever an attempt starts or the manager is reset, so a
    /// superseded attempt can tell it must not cache its session.
    epoch: u64,
}

/// Owns the single shared automation session.
pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    config: ConnectConfig,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionManager {
    /// Create a manager over the given driver. No connection is made until
    /// first use.
    pub fn new(driver: Arc<dyn Driver>, config: ConnectConfig) -> Self {
        Self {
            driver,
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// The configured default timeout.
    pub fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Return the live session, establishing one if needed.
    ///
    /// With no overrides (or `reconnect: false`) a cached live session is
    /// reused. With `reconnect: true` any cached session and any in-flight
    /// attempt are discarded and a fresh connect is issued unconditionally.
    pub async fn ensure_connection(
        &self,
        overrides: Option<ConnectOptions>,
    ) -> Result<SharedSession> {
        let overrides = overrides.unwrap_or_default();

        // The lock is held only to inspect and update the slots; the actual
        // connect happens after it is released.
        let attempt = {
            let mut inner = self.inner.lock().await;

            if overrides.reconnect {
                if let Some(old) = inner.session.take() {
                    tracing::info!("reconnect requested, discarding live session");
                    tokio::spawn(async move { old.close().await });
                }
                inner.pending = None;
            } else if let Some(session) = &inner.session {
                if session.is_alive() {
                    tracing::debug!("reusing cached automation session");
                    return Ok(session.clone());
                }
                tracing::info!("cached session is dead, reconnecting");
                inner.session = None;
            }

            match &inner.pending {
                Some((_, attempt)) => {
                    tracing::debug!("joining in-flight connect attempt");
                    attempt.clone()
                }
                None => self.start_attempt(&mut inner, &overrides),
            }
        };

        attempt.await.map_err(shared_error)
    }

    /// Start a connect attempt and park it in the pending slot. The attempt
    /// settles the manager state itself so every caller that joined it
    /// observes the same outcome.
    fn start_attempt(&self, inner: &mut Inner, overrides: &ConnectOptions) -> ConnectAttempt {
        let (endpoint, timeout) = self.config.resolve(overrides);
        inner.epoch += 1;
        let epoch = inner.epoch;
        let driver = self.driver.clone();
        let shared = Arc::clone(&self.inner);

        let attempt = async move {
            let result = driver.connect(&endpoint, timeout).await.map_err(Arc::new);

            let mut inner = shared.lock().await;
            let current = inner.pending.as_ref().map(|(id, _)| *id) == Some(epoch);
            if current {
                inner.pending = None;
            }
            match &result {
                Ok(session) if current => inner.session = Some(session.clone()),
                Ok(session) => {
                    // Superseded by a forced reconnect or close while we
                    // were connecting; don't cache a stale session.
                    let session = session.clone();
                    tokio::spawn(async move { session.close().await });
                }
                Err(_) => {}
            }
            result
        }
        .boxed()
        .shared();

        inner.pending = Some((epoch, attempt.clone()));
        attempt
    }

    /// Scoped page access: resolve a session, fetch the current page, run
    /// the callback, return its result.
    ///
    /// If the page fetch or the callback fails with an error that indicates
    /// the session is dead, the cached handle is invalidated so the next
    /// call reconnects. The error is rethrown unchanged; the callback is
    /// never retried here.
    pub async fn with_page<F, Fut, T>(&self, overrides: Option<ConnectOptions>, f: F) -> Result<T>
    where
        F: FnOnce(Page) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.ensure_connection(overrides).await?;
        let page = match Page::current(session.clone()).await {
            Ok(page) => page,
            Err(e) => return Err(self.fail(&session, e).await),
        };
        match f(page).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(&session, e).await),
        }
    }

    async fn fail(&self, session: &SharedSession, error: Error) -> Error {
        if error.is_session_lost() {
            self.invalidate(session).await;
        }
        error
    }

    /// Drop the cached handle if it is still the one the caller was using.
    /// A newer session established in the meantime is left alone.
    async fn invalidate(&self, session: &SharedSession) {
        let mut inner = self.inner.lock().await;
        if let Some(current) = &inner.session {
            if Arc::ptr_eq(current, session) {
                tracing::warn!("automation session lost, next call will reconnect");
                inner.session = None;
            }
        }
    }

    /// Release any live session and reset to disconnected. Idempotent.
    pub async fn close(&self) {
        let session = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1; // orphan any in-flight attempt
            inner.pending = None;
            inner.session.take()
        };
        if let Some(session) = session {
            tracing::info!("closing automation session");
            session.close().await;
        }
    }
}

fn shared_error(error: Arc<Error>) -> Error {
    match &*error {
        Error::ConnectTimeout(timeout) => Error::ConnectTimeout(*timeout),
        Error::Connection(msg) => Error::Connection(msg.clone()),
        other => Error::Connection(other.to_string()),
    }
}

//! Client for the DevTools automation endpoint.
//!
//! WeChat DevTools exposes Mini Program automation as a WebSocket service
//! speaking JSON messages of the form `{id, method, params}` answered by
//! `{id, result}` or `{id, error}`. This module provides a small trait seam
//! (`Driver` / `Session`) so the connection manager and the tools never
//! depend on the wire transport directly, plus the production `WsDriver`
//! built on tokio-tungstenite with oneshot-based request correlation.
//!
//! Automation logic itself (rendering, selector semantics, method dispatch)
//! lives entirely on the DevTools side; this client only ferries calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

/// Port the DevTools automation service listens on by default.
pub const DEFAULT_PORT: u16 = 9420;

/// Environment variable overriding the automation port (used by test rigs).
pub const PORT_ENV_VAR: &str = "WECHAT_DEVTOOLS_WS_PORT";

/// Interval between selector polls in [`Page::wait_for`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Establishes automation sessions.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Connect to the automation endpoint, bounded by `timeout`.
    async fn connect(&self, ws_endpoint: &str, timeout: Duration) -> Result<Arc<dyn Session>>;
}

/// A live automation session.
///
/// Sessions are owned by the connection manager and handed to callers only
/// for the duration of one scoped callback.
#[async_trait]
pub trait Session: Send + Sync {
    /// Issue one automation call and await its result.
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Whether the underlying link is still up.
    fn is_alive(&self) -> bool;

    /// Tear the session down. Best effort; never fails.
    async fn close(&self);
}

// ============================================================================
// Page and element handles
// ============================================================================

/// Handle to the currently active page. Valid for one tool call.
pub struct Page {
    session: Arc<dyn Session>,
    page_id: Value,
    /// Route of the page, e.g. `pages/index/index`.
    pub path: String,
    /// Query parameters the page was opened with.
    pub query: Value,
}

impl Page {
    /// Fetch the current page from the session.
    pub async fn current(session: Arc<dyn Session>) -> Result<Self> {
        let result = session.call("App.getCurrentPage", json!({})).await?;
        let page_id = result
            .get("pageId")
            .cloned()
            .ok_or_else(|| Error::Automation("App.getCurrentPage returned no pageId".into()))?;
        let path = result
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let query = result.get("query").cloned().unwrap_or(Value::Null);
        Ok(Self {
            session,
            page_id,
            path,
            query,
        })
    }

    /// Read page data, optionally narrowed to a dotted `path` within it.
    pub async fn data(&self, path: Option<&str>) -> Result<Value> {
        let mut params = json!({ "pageId": self.page_id });
        if let Some(path) = path {
            params["path"] = json!(path);
        }
        let result = self.session.call("Page.getData", params).await?;
        Ok(result.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Merge a JSON object into the page's data.
    pub async fn set_data(&self, data: Value) -> Result<()> {
        self.session
            .call(
                "Page.setData",
                json!({ "pageId": self.page_id, "data": data }),
            )
            .await?;
        Ok(())
    }

    /// Invoke a method defined on the page instance.
    pub async fn call_method(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let result = self
            .session
            .call(
                "Page.callMethod",
                json!({ "pageId": self.page_id, "method": method, "args": args }),
            )
            .await
            .map_err(|e| match e {
                Error::Automation(msg) => {
                    Error::Automation(format!("method {method:?} failed: {msg}"))
                }
                other => other,
            })?;
        Ok(result.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Query a single element. `None` when the selector matches nothing.
    pub async fn element(&self, selector: &str) -> Result<Option<Element>> {
        let result = self
            .session
            .call(
                "Page.getElement",
                json!({ "pageId": self.page_id, "selector": selector }),
            )
            .await
            .map_err(|e| match e {
                Error::Automation(msg) => {
                    Error::Automation(format!("selector {selector:?}: {msg}"))
                }
                other => other,
            })?;
        match result.get("elementId") {
            Some(id) if !id.is_null() => Ok(Some(Element::new(
                self.session.clone(),
                id.clone(),
                &result,
            ))),
            _ => Ok(None),
        }
    }

    /// Query all elements matching a selector.
    pub async fn elements(&self, selector: &str) -> Result<Vec<Element>> {
        let result = self
            .session
            .call(
                "Page.getElements",
                json!({ "pageId": self.page_id, "selector": selector }),
            )
            .await
            .map_err(|e| match e {
                Error::Automation(msg) => {
                    Error::Automation(format!("selector {selector:?}: {msg}"))
                }
                other => other,
            })?;
        let entries = result
            .get("elements")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let id = entry.get("elementId")?;
                Some(Element::new(self.session.clone(), id.clone(), entry))
            })
            .collect())
    }

    /// Poll until a selector matches, up to `timeout`.
    pub async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Element> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(element) = self.element(selector).await? {
                return Ok(element);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Automation(format!(
                    "timed out after {timeout:?} waiting for selector {selector:?}"
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

/// Handle to a single element on the current page. Valid for one tool call.
pub struct Element {
    session: Arc<dyn Session>,
    element_id: Value,
    /// Tag name as reported by DevTools, e.g. `view` or `button`.
    pub tag_name: String,
}

impl Element {
    fn new(session: Arc<dyn Session>, element_id: Value, entry: &Value) -> Self {
        let tag_name = entry
            .get("tagName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            session,
            element_id,
            tag_name,
        }
    }

    /// The element's rendered text content.
    pub async fn text(&self) -> Result<String> {
        let result = self
            .session
            .call("Element.getText", json!({ "elementId": self.element_id }))
            .await?;
        Ok(result
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Raw outer WXML markup of the element.
    pub async fn outer_wxml(&self) -> Result<String> {
        let result = self
            .session
            .call("Element.getWXML", json!({ "elementId": self.element_id }))
            .await?;
        Ok(result
            .get("wxml")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Read a single attribute. `None` when the attribute is absent.
    pub async fn attribute(&self, name: &str) -> Result<Option<String>> {
        let result = self
            .session
            .call(
                "Element.getAttributes",
                json!({ "elementId": self.element_id, "names": [name] }),
            )
            .await?;
        Ok(result
            .get("attributes")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

// ============================================================================
// WebSocket driver
// ============================================================================

/// Production driver speaking the DevTools automation protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDriver;

#[async_trait]
impl Driver for WsDriver {
    async fn connect(&self, ws_endpoint: &str, timeout: Duration) -> Result<Arc<dyn Session>> {
        tracing::debug!(endpoint = ws_endpoint, "connecting to automation endpoint");
        let (stream, _) = tokio::time::timeout(timeout, connect_async(ws_endpoint))
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))?
            .map_err(|e| Error::Connection(format!("{ws_endpoint}: {e}")))?;
        tracing::info!(endpoint = ws_endpoint, "automation session established");
        Ok(Arc::new(WsSession::spawn(stream, timeout)))
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// One WebSocket automation session. Requests are correlated to responses
/// by id through oneshot channels; a reader task owns the receive half.
pub struct WsSession {
    outbound: mpsc::Sender<Message>,
    pending: PendingCalls,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl WsSession {
    fn spawn(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, call_timeout: Duration) -> Self {
        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(32);
        let pending: PendingCalls = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task: a closed socket fails everything still pending so no
        // caller is left hanging on a dead session.
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let response: WireResponse = match serde_json::from_str(&text) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!("unparseable automation message: {e}");
                        continue;
                    }
                };
                if let Some(tx) = reader_pending.lock().await.remove(&response.id) {
                    let result = match response.error {
                        Some(err) => Err(Error::Automation(err.message)),
                        None => Ok(response.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            let mut pending = reader_pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(Error::SessionLost(
                    "automation endpoint closed the connection".into(),
                )));
            }
            tracing::info!("automation session closed");
        });

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            call_timeout,
        }
    }
}

#[async_trait]
impl Session for WsSession {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::SessionLost("automation session is closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::to_string(&WireRequest { id, method, params })?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        tracing::debug!(method, id, "automation call");
        if self.outbound.send(Message::Text(payload)).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::SessionLost("automation session is closed".into()));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SessionLost(
                "automation session dropped the call".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Automation(format!(
                    "automation call {method:?} timed out after {:?}",
                    self.call_timeout
                )))
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubSession;
    use super::*;

    /// Session answering each method from a fixed script, null otherwise.
    struct ScriptedSession {
        responses: HashMap<&'static str, Value>,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn call(&self, method: &str, _params: Value) -> Result<Value> {
            Ok(self.responses.get(method).cloned().unwrap_or(Value::Null))
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn scripted(responses: Vec<(&'static str, Value)>) -> Arc<dyn Session> {
        Arc::new(ScriptedSession {
            responses: responses.into_iter().collect(),
        })
    }

    #[tokio::test]
    async fn current_page_parses_path_and_query() {
        let session = scripted(vec![(
            "App.getCurrentPage",
            json!({ "pageId": 7, "path": "pages/cart/cart", "query": { "id": "3" } }),
        )]);
        let page = Page::current(session).await.unwrap();
        assert_eq!(page.path, "pages/cart/cart");
        assert_eq!(page.query["id"], "3");
    }

    #[tokio::test]
    async fn current_page_requires_page_id() {
        let session = scripted(vec![("App.getCurrentPage", json!({}))]);
        let result = Page::current(session).await;
        assert!(matches!(result, Err(Error::Automation(_))));
    }

    #[tokio::test]
    async fn element_lookup_is_none_without_match() {
        let page = Page::current(Arc::new(StubSession::new())).await.unwrap();
        // StubSession answers Page.getElement with null.
        assert!(page.element(".missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn element_lookup_parses_match() {
        let session = scripted(vec![
            (
                "App.getCurrentPage",
                json!({ "pageId": 1, "path": "pages/index/index" }),
            ),
            (
                "Page.getElement",
                json!({ "elementId": "el-1", "tagName": "button" }),
            ),
            ("Element.getText", json!({ "text": "Buy now" })),
            ("Element.getWXML", json!({ "wxml": "<button>Buy now</button>" })),
        ]);
        let page = Page::current(session).await.unwrap();

        let element = page.element(".buy").await.unwrap().expect("should match");
        assert_eq!(element.tag_name, "button");
        assert_eq!(element.text().await.unwrap(), "Buy now");
        assert_eq!(element.outer_wxml().await.unwrap(), "<button>Buy now</button>");
    }

    #[tokio::test]
    async fn attribute_parses_value() {
        let session = scripted(vec![
            (
                "App.getCurrentPage",
                json!({ "pageId": 1, "path": "pages/index/index" }),
            ),
            (
                "Page.getElement",
                json!({ "elementId": "el-1", "tagName": "input" }),
            ),
            ("Element.getAttributes", json!({ "attributes": ["disabled"] })),
        ]);
        let page = Page::current(session).await.unwrap();

        let element = page.element("input").await.unwrap().expect("should match");
        assert_eq!(
            element.attribute("class").await.unwrap(),
            Some("disabled".to_string())
        );
    }

    #[tokio::test]
    async fn attribute_is_none_when_absent() {
        let session = scripted(vec![
            (
                "App.getCurrentPage",
                json!({ "pageId": 1, "path": "pages/index/index" }),
            ),
            (
                "Page.getElement",
                json!({ "elementId": "el-1", "tagName": "view" }),
            ),
            ("Element.getAttributes", json!({ "attributes": [null] })),
        ]);
        let page = Page::current(session).await.unwrap();

        let element = page.element("view").await.unwrap().expect("should match");
        assert_eq!(element.attribute("data-id").await.unwrap(), None);
    }

    #[tokio::test]
    async fn elements_parses_entries() {
        let session = scripted(vec![
            (
                "App.getCurrentPage",
                json!({ "pageId": 1, "path": "pages/index/index" }),
            ),
            (
                "Page.getElements",
                json!({ "elements": [
                    { "elementId": "el-1", "tagName": "view" },
                    { "elementId": "el-2", "tagName": "text" }
                ]}),
            ),
        ]);
        let page = Page::current(session).await.unwrap();

        let elements = page.elements(".item").await.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].tag_name, "view");
        assert_eq!(elements[1].tag_name, "text");
    }

    #[tokio::test]
    async fn wait_for_times_out_with_selector_in_message() {
        let page = Page::current(Arc::new(StubSession::new())).await.unwrap();
        let result = page
            .wait_for(".never", Duration::from_millis(150))
            .await;
        match result {
            Err(Error::Automation(msg)) => assert!(msg.contains(".never"), "got: {msg}"),
            Err(other) => panic!("expected a timeout, got {other}"),
            Ok(_) => panic!("expected a timeout, got an element"),
        }
    }
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    //! Counting driver and stub session shared by unit tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Session that answers page lookups with a fixed page and everything
    /// else with null. Can be flipped dead or made to fail calls.
    pub(crate) struct StubSession {
        pub(crate) alive: AtomicBool,
        pub(crate) fail_calls: AtomicBool,
    }

    impl StubSession {
        pub(crate) fn new() -> Self {
            Self {
                alive: AtomicBool::new(true),
                fail_calls: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Session for StubSession {
        async fn call(&self, method: &str, _params: Value) -> Result<Value> {
            if self.fail_calls.load(Ordering::SeqCst) {
                return Err(Error::SessionLost("stub session went away".into()));
            }
            match method {
                "App.getCurrentPage" => Ok(json!({
                    "pageId": "page-1",
                    "path": "pages/index/index",
                    "query": {}
                })),
                _ => Ok(Value::Null),
            }
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Driver that counts connect attempts and optionally delays or fails.
    #[derive(Default)]
    pub(crate) struct CountingDriver {
        pub(crate) connects: AtomicUsize,
        pub(crate) delay: Option<Duration>,
        pub(crate) fail: AtomicBool,
        last: std::sync::Mutex<Option<Arc<StubSession>>>,
    }

    impl CountingDriver {
        /// Driver whose connect attempts take `delay` to settle.
        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub(crate) fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// The most recently handed-out session.
        pub(crate) fn last_session(&self) -> Arc<StubSession> {
            self.last
                .lock()
                .unwrap()
                .clone()
                .expect("no session connected yet")
        }
    }

    #[async_trait]
    impl Driver for CountingDriver {
        async fn connect(&self, _ws_endpoint: &str, _timeout: Duration) -> Result<Arc<dyn Session>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Connection("stub endpoint refused".into()));
            }
            let session = Arc::new(StubSession::new());
            *self.last.lock().unwrap() = Some(session.clone());
            Ok(session)
        }
    }
}

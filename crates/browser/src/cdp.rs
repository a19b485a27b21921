//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! One client per WebSocket endpoint: either the browser-level connection
//! (target/context management) or a per-page connection (navigation, script
//! evaluation, network interception, binding events).

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use tubetap_core::{Error, Result};

/// Response wait bound for a single CDP command.
const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A CDP WebSocket client that can send commands and receive responses/events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channels).
    event_listeners: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
    /// Handle to the reader task so we can abort on drop.
    _reader_handle: tokio::task::JoinHandle<()>,
    /// Handle to the writer task.
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Cdp(format!("connect to {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        // Channel for outgoing messages
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        // Pending responses
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        // Event listeners
        let event_listeners: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        // Writer task: owns the sink, forwards messages from the channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: reads from the WebSocket, dispatches responses and events
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Ok(val) = serde_json::from_str::<Value>(&text) {
                            if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                                // Command response
                                let mut pending = pending_clone.lock().await;
                                if let Some(tx) = pending.remove(&id) {
                                    let _ = tx.send(val);
                                }
                            } else if let Some(method) = val.get("method").and_then(|v| v.as_str())
                            {
                                // Event
                                let listeners = events_clone.lock().await;
                                if let Some(senders) = listeners.get(method) {
                                    let params =
                                        val.get("params").cloned().unwrap_or(Value::Null);
                                    for tx in senders {
                                        if tx.try_send(params.clone()).is_err() {
                                            warn!(method, "CDP event listener lagging, event dropped");
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| Error::Cdp(format!("send {}: {}", method, e)))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(Error::Cdp(format!("{}: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(Error::Cdp(format!("{}: response channel closed", method))),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                Err(Error::Cdp(format!(
                    "{} timed out after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Subscribe to a CDP event. Returns a receiver that will get event params.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        self.subscribe_event_with_capacity(method, 64).await
    }

    /// Subscribe with an explicit buffer size. High-rate subscriptions (chunk
    /// relay) use a deeper buffer so a briefly stalled consumer drops nothing.
    pub async fn subscribe_event_with_capacity(
        &self,
        method: &str,
        capacity: usize,
    ) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut listeners = self.event_listeners.lock().await;
        listeners.entry(method.to_string()).or_default().push(tx);
        rx
    }

    /// Enable a CDP domain (e.g. "Page", "Runtime", "Network").
    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    /// Start navigation to a URL. Completion is signalled separately by
    /// `Page.loadEventFired`; a failed navigation carries `errorText`.
    pub async fn navigate(&self, url: &str) -> Result<Value> {
        let result = self
            .send_command("Page.navigate", json!({"url": url}))
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            if !error_text.is_empty() {
                return Err(Error::Browser(format!(
                    "navigation to {} failed: {}",
                    url, error_text
                )));
            }
        }
        Ok(result)
    }

    /// Evaluate JavaScript in the page context and return the result value.
    /// Promises are awaited; a thrown exception becomes an error here.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|v| v.as_str())
                .or_else(|| exception.get("text").and_then(|v| v.as_str()))
                .unwrap_or("unknown exception");
            return Err(Error::Cdp(format!("evaluate threw: {}", text)));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Expose a page-to-host binding callable from page script as
    /// `window.<name>(payload)`. Calls surface as `Runtime.bindingCalled`.
    pub async fn add_binding(&self, name: &str) -> Result<()> {
        self.send_command("Runtime.addBinding", json!({"name": name}))
            .await?;
        Ok(())
    }

    // ─── Target / context management (browser-level connection) ──────────

    /// Create an isolated browsing context shared by this extractor's pages.
    pub async fn create_browser_context(&self) -> Result<String> {
        let result = self
            .send_command("Target.createBrowserContext", json!({}))
            .await?;
        result
            .get("browserContextId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Cdp("no browserContextId returned".into()))
    }

    /// Dispose a browsing context and every page inside it.
    pub async fn dispose_browser_context(&self, context_id: &str) -> Result<()> {
        self.send_command(
            "Target.disposeBrowserContext",
            json!({"browserContextId": context_id}),
        )
        .await?;
        Ok(())
    }

    /// Create a new page target (tab) inside a browsing context.
    pub async fn create_target(&self, url: &str, context_id: &str) -> Result<String> {
        let result = self
            .send_command(
                "Target.createTarget",
                json!({"url": url, "browserContextId": context_id}),
            )
            .await?;
        result
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Cdp("no targetId returned from createTarget".into()))
    }

    /// Close a target by its targetId.
    pub async fn close_target(&self, target_id: &str) -> Result<()> {
        self.send_command("Target.closeTarget", json!({"targetId": target_id}))
            .await?;
        Ok(())
    }

    // ─── Network interception (Fetch domain) ──────────────────────────────

    /// Enable the Fetch domain for network interception.
    /// `patterns` is an array of RequestPattern objects.
    pub async fn enable_fetch(&self, patterns: Vec<Value>) -> Result<()> {
        self.send_command(
            "Fetch.enable",
            json!({"patterns": patterns, "handleAuthRequests": false}),
        )
        .await?;
        Ok(())
    }

    /// Fail a paused request with a specific error reason.
    pub async fn fetch_fail(&self, request_id: &str, reason: &str) -> Result<()> {
        self.send_command(
            "Fetch.failRequest",
            json!({"requestId": request_id, "errorReason": reason}),
        )
        .await?;
        Ok(())
    }

    /// Continue a paused request unmodified.
    pub async fn fetch_continue(&self, request_id: &str) -> Result<()> {
        self.send_command("Fetch.continueRequest", json!({"requestId": request_id}))
            .await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    /// Minimal loopback CDP endpoint: answers every command with a canned
    /// result echoing the method name, and pushes one event after the first
    /// command arrives.
    async fn spawn_fake_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();

            while let Some(Ok(Message::Text(text))) = source.next().await {
                let msg: Value = serde_json::from_str(&text).unwrap();
                let id = msg["id"].as_u64().unwrap();
                let method = msg["method"].as_str().unwrap().to_string();

                let response = json!({
                    "id": id,
                    "result": {"echo": method},
                });
                sink.send(Message::Text(response.to_string())).await.unwrap();

                let event = json!({
                    "method": "Test.ping",
                    "params": {"seq": id},
                });
                sink.send(Message::Text(event.to_string())).await.unwrap();
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn routes_responses_by_id() {
        let url = spawn_fake_endpoint().await;
        let client = CdpClient::connect(&url).await.unwrap();

        let first = client.send_command("First.call", json!({})).await.unwrap();
        let second = client.send_command("Second.call", json!({})).await.unwrap();

        assert_eq!(first["echo"], "First.call");
        assert_eq!(second["echo"], "Second.call");
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let url = spawn_fake_endpoint().await;
        let client = CdpClient::connect(&url).await.unwrap();

        let mut rx = client.subscribe_event("Test.ping").await;
        client.send_command("Any.call", json!({})).await.unwrap();

        let params = rx.recv().await.unwrap();
        assert_eq!(params["seq"], 1);
    }

    #[tokio::test]
    async fn connect_to_dead_endpoint_is_an_error() {
        let err = CdpClient::connect("ws://127.0.0.1:1/devtools").await;
        assert!(matches!(err, Err(Error::Cdp(_))));
    }
}

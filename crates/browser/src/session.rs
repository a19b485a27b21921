//! Shared browser session management.
//!
//! One Chromium process and one browsing context serve the whole extractor.
//! The session is launched lazily on first use; launching is serialized
//! behind a mutex so concurrent first-callers observe a single launch.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tubetap_core::config::BrowserConfig;
use tubetap_core::{Error, Result};

use crate::cdp::CdpClient;
use crate::page::Page;

/// The shared browser process with its browser-level CDP connection and the
/// one browsing context all pages live in.
pub struct BrowserSession {
    /// Remote debugging port, used to discover per-target WebSocket URLs.
    pub debug_port: u16,
    /// Browsing context shared by every page this extractor opens.
    context_id: String,
    /// Browser-level CDP client (target/context management).
    pub(crate) cdp: CdpClient,
    /// Browser child process.
    process: Mutex<Child>,
}

impl BrowserSession {
    pub(crate) fn context_id(&self) -> &str {
        &self.context_id
    }

    async fn shutdown(&self) {
        if let Err(e) = self.cdp.dispose_browser_context(&self.context_id).await {
            debug!("dispose context failed (may already be gone): {}", e);
        }
        if let Err(e) = self.cdp.send_command("Browser.close", json!({})).await {
            debug!("Browser.close failed (may already be closed): {}", e);
        }
        let _ = self.process.lock().await.kill().await;
    }
}

/// Owns the shared browser session behind lazy, serialized launch.
pub struct BrowserManager {
    config: BrowserConfig,
    ad_domains: Vec<String>,
    inner: Mutex<Option<Arc<BrowserSession>>>,
}

impl BrowserManager {
    pub fn new(config: BrowserConfig, ad_domains: Vec<String>) -> Self {
        Self {
            config,
            ad_domains,
            inner: Mutex::new(None),
        }
    }

    /// The shared session, launching the browser on first call.
    ///
    /// A crashed browser is not relaunched here: the stale session keeps
    /// failing until `deactivate` clears it and a later call relaunches.
    pub async fn session(&self) -> Result<Arc<BrowserSession>> {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = Arc::new(launch_browser(&self.config).await?);
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Open a fresh page in the shared context, with the ad-domain blocking
    /// rule installed before anything navigates.
    pub async fn open_page(&self) -> Result<Page> {
        let session = self.session().await?;
        let target_id = session
            .cdp
            .create_target("about:blank", session.context_id())
            .await?;
        debug!(target_id = %target_id, "opened page");

        match Page::attach(session.clone(), target_id.clone(), &self.ad_domains).await {
            Ok(page) => Ok(page),
            Err(e) => {
                // The target exists but never became a usable handle.
                if let Err(close_err) = session.cdp.close_target(&target_id).await {
                    warn!(target_id = %target_id, "failed to close orphaned target: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Tear down the shared session: context, browser, process. Idempotent;
    /// safe to call even if the browser was never launched.
    pub async fn deactivate(&self) {
        let session = self.inner.lock().await.take();
        if let Some(session) = session {
            info!("shutting down shared browser session");
            session.shutdown().await;
        }
    }
}

/// Launch a browser instance, wait for its CDP endpoint, create the shared
/// browsing context.
async fn launch_browser(config: &BrowserConfig) -> Result<BrowserSession> {
    let binary = match &config.binary {
        Some(path) => path.clone(),
        None => find_browser_binary()
            .ok_or_else(|| Error::Browser("no Chromium/Chrome binary found".into()))?,
    };

    let user_data_dir = match &config.user_data_dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tubetap")
            .join("profile"),
    };
    std::fs::create_dir_all(&user_data_dir)
        .map_err(|e| Error::Browser(format!("create user data dir: {}", e)))?;

    let debug_port = find_free_port().await?;
    let args = build_browser_args(debug_port, &user_data_dir, config.headed);

    info!(
        port = debug_port,
        headed = config.headed,
        binary = %binary,
        "launching browser"
    );

    let child = Command::new(&binary)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Browser(format!("launch {}: {}", binary, e)))?;

    let browser_ws_url = wait_for_cdp_ready(debug_port, config.launch_timeout_secs).await?;
    let cdp = CdpClient::connect(&browser_ws_url).await?;
    let context_id = cdp.create_browser_context().await?;

    info!(port = debug_port, "CDP connection established");

    Ok(BrowserSession {
        debug_port,
        context_id,
        cdp,
        process: Mutex::new(child),
    })
}

/// Build command line arguments for a capture-ready browser: headless by
/// default, autoplay allowed without a gesture, output muted.
fn build_browser_args(debug_port: u16, user_data_dir: &std::path::Path, headed: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        "--mute-audio".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

/// Find a Chromium-family binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    };

    for candidate in candidates {
        if std::path::Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok()
        {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Find a free TCP port.
async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Browser(format!("bind to find free port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Browser(format!("local addr: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll /json/version until the browser-level WebSocket URL appears.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<String> {
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Browser(format!(
                "CDP not ready after {}s on port {}",
                timeout_secs, port
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Resolve a targetId to its WebSocket debugger URL via /json/list.
/// Retries a few times since a fresh target may not be listed immediately.
pub(crate) async fn get_target_ws_url(port: u16, target_id: &str) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }

        let resp = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let targets: Vec<Value> = match resp.json().await {
            Ok(t) => t,
            Err(_) => continue,
        };

        for target in &targets {
            if target.get("id").and_then(|v| v.as_str()) == Some(target_id)
                || target.get("targetId").and_then(|v| v.as_str()) == Some(target_id)
            {
                if let Some(ws_url) = target.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }
    }

    Err(Error::Browser(format!(
        "no WebSocket URL found for target '{}' after retries",
        target_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_args_include_capture_flags() {
        let args = build_browser_args(9222, std::path::Path::new("/tmp/profile"), false);
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--mute-audio".to_string()));
        assert!(args.contains(&"--autoplay-policy=no-user-gesture-required".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
    }

    #[test]
    fn headed_args_omit_headless() {
        let args = build_browser_args(9222, std::path::Path::new("/tmp/profile"), true);
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[tokio::test]
    async fn deactivate_without_launch_is_a_noop() {
        let manager = BrowserManager::new(BrowserConfig::default(), vec![]);
        manager.deactivate().await;
        manager.deactivate().await;
    }
}

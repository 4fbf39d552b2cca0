//! CDP-backed page driver: one Chromium process per session, driven over a
//! raw DevTools WebSocket with id-correlated request/response matching.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{Cookie, DriverFactory, FrameInfo, PageDriver, StorageEntry, VisibilityMode};
use crate::error::{BellhopError, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ENDPOINT_PROBE_ATTEMPTS: u32 = 25;
const ISOLATED_WORLD: &str = "bellhop";

/// `/json/version` response subset from the DevTools endpoint.
#[derive(Debug, serde::Deserialize)]
struct VersionInfo {
	#[serde(rename = "webSocketDebuggerUrl")]
	web_socket_debugger_url: String,
}

/// Launches Chromium processes with remote debugging enabled.
pub struct CdpDriverFactory {
	executable: Option<PathBuf>,
}

impl CdpDriverFactory {
	pub fn new() -> Self {
		Self { executable: None }
	}

	/// Overrides browser executable discovery with an explicit path.
	pub fn with_executable(executable: PathBuf) -> Self {
		Self { executable: Some(executable) }
	}

	fn resolve_executable(&self) -> Result<PathBuf> {
		if let Some(path) = &self.executable {
			return Ok(path.clone());
		}
		["chromium", "chromium-browser", "google-chrome", "google-chrome-stable", "chrome"]
			.iter()
			.find_map(|candidate| which::which(candidate).ok())
			.ok_or_else(|| BellhopError::ResourceAllocation("no Chromium/Chrome executable found on PATH".into()))
	}
}

impl Default for CdpDriverFactory {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl DriverFactory for CdpDriverFactory {
	async fn launch(&self, mode: VisibilityMode) -> Result<Box<dyn PageDriver>> {
		let executable = self.resolve_executable()?;
		let port = pick_free_port()?;
		let user_data_dir = std::env::temp_dir().join(format!("bellhop-profile-{}", uuid::Uuid::new_v4()));
		std::fs::create_dir_all(&user_data_dir).map_err(|e| BellhopError::ResourceAllocation(e.to_string()))?;

		let mut args = vec![
			format!("--remote-debugging-port={port}"),
			format!("--user-data-dir={}", user_data_dir.display()),
			"--no-first-run".to_string(),
			"--no-default-browser-check".to_string(),
			"--no-sandbox".to_string(),
		];
		if mode == VisibilityMode::Headless {
			args.push("--headless=new".to_string());
		}

		let mut child = Command::new(&executable)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn()
			.map_err(|e| BellhopError::ResourceAllocation(format!("failed to launch {}: {e}", executable.display())))?;

		let ws_url = match wait_for_endpoint(port, &mut child).await {
			Ok(url) => url,
			Err(err) => {
				let _ = child.kill();
				let _ = std::fs::remove_dir_all(&user_data_dir);
				return Err(err);
			}
		};

		debug!(target = "bellhop.driver", %ws_url, pid = child.id(), %mode, "browser launched");

		match CdpDriver::connect(&ws_url, child, user_data_dir.clone()).await {
			Ok(driver) => Ok(Box::new(driver)),
			Err(err) => {
				let _ = std::fs::remove_dir_all(&user_data_dir);
				Err(err)
			}
		}
	}
}

fn pick_free_port() -> Result<u16> {
	let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(|e| BellhopError::ResourceAllocation(e.to_string()))?;
	let port = listener.local_addr().map_err(|e| BellhopError::ResourceAllocation(e.to_string()))?.port();
	drop(listener);
	Ok(port)
}

/// Polls `/json/version` until the freshly spawned browser answers.
async fn wait_for_endpoint(port: u16, child: &mut Child) -> Result<String> {
	let client = reqwest::Client::builder()
		.timeout(Duration::from_millis(400))
		.build()
		.map_err(|e| BellhopError::ResourceAllocation(e.to_string()))?;
	let url = format!("http://127.0.0.1:{port}/json/version");
	let mut last_error = "endpoint not reachable".to_string();

	for _ in 0..ENDPOINT_PROBE_ATTEMPTS {
		tokio::time::sleep(Duration::from_millis(200)).await;

		if let Ok(Some(status)) = child.try_wait() {
			return Err(BellhopError::ResourceAllocation(format!(
				"browser exited before debugging endpoint became available (status: {status})"
			)));
		}

		match client.get(&url).send().await {
			Ok(response) if response.status().is_success() => {
				let info: VersionInfo = response
					.json()
					.await
					.map_err(|e| BellhopError::ResourceAllocation(format!("failed to parse version response: {e}")))?;
				return Ok(info.web_socket_debugger_url);
			}
			Ok(response) => last_error = format!("unexpected status {}", response.status()),
			Err(e) => last_error = e.to_string(),
		}
	}

	Err(BellhopError::ResourceAllocation(format!(
		"debugging endpoint not available on port {port}: {last_error}"
	)))
}

/// One Chromium process, one target, one attached session.
pub struct CdpDriver {
	outbound: mpsc::UnboundedSender<Message>,
	pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
	next_id: AtomicU64,
	session_id: String,
	frame_worlds: Mutex<HashMap<String, u64>>,
	child: Mutex<Option<Child>>,
	user_data_dir: PathBuf,
	reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CdpDriver {
	/// Connects to the browser WebSocket, creates a blank target, and
	/// attaches a flattened session to it.
	async fn connect(ws_url: &str, child: Child, user_data_dir: PathBuf) -> Result<Self> {
		let (stream, _) = connect_async(ws_url)
			.await
			.map_err(|e| BellhopError::ResourceAllocation(format!("failed to connect to {ws_url}: {e}")))?;
		let (mut sink, mut source) = stream.split();

		let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
		tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				if sink.send(message).await.is_err() {
					break;
				}
			}
		});

		let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> = Arc::new(Mutex::new(HashMap::new()));
		let reader = tokio::spawn({
			let pending = Arc::clone(&pending);
			async move {
				while let Some(Ok(message)) = source.next().await {
					let Ok(text) = message.to_text() else { continue };
					let Ok(value) = serde_json::from_str::<Value>(text) else { continue };
					if let Some(id) = value.get("id").and_then(Value::as_u64) {
						if let Some(tx) = pending.lock().remove(&id) {
							let _ = tx.send(value);
						}
					}
				}
			}
		});

		let driver = Self {
			outbound,
			pending,
			next_id: AtomicU64::new(1),
			session_id: String::new(),
			frame_worlds: Mutex::new(HashMap::new()),
			child: Mutex::new(Some(child)),
			user_data_dir,
			reader: Mutex::new(Some(reader)),
		};

		let target = driver.raw_command("Target.createTarget", json!({ "url": "about:blank" }), None).await?;
		let target_id = target
			.get("targetId")
			.and_then(Value::as_str)
			.ok_or_else(|| BellhopError::ResourceAllocation("createTarget returned no targetId".into()))?
			.to_string();
		let attached = driver
			.raw_command("Target.attachToTarget", json!({ "targetId": target_id, "flatten": true }), None)
			.await?;
		let session_id = attached
			.get("sessionId")
			.and_then(Value::as_str)
			.ok_or_else(|| BellhopError::ResourceAllocation("attachToTarget returned no sessionId".into()))?
			.to_string();

		Ok(Self { session_id, ..driver })
	}

	async fn raw_command(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let mut envelope = json!({ "id": id, "method": method, "params": params });
		if let Some(session) = session_id {
			envelope["sessionId"] = Value::String(session.to_string());
		}

		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		self.outbound
			.send(Message::Text(envelope.to_string()))
			.map_err(|_| BellhopError::Driver("browser connection closed".into()))?;

		let response = tokio::time::timeout(COMMAND_TIMEOUT, rx)
			.await
			.map_err(|_| {
				self.pending.lock().remove(&id);
				BellhopError::Driver(format!("{method} timed out"))
			})?
			.map_err(|_| BellhopError::Driver("browser connection closed".into()))?;

		if let Some(error) = response.get("error") {
			let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown CDP error");
			return Err(BellhopError::Driver(format!("{method}: {message}")));
		}
		Ok(response.get("result").cloned().unwrap_or(Value::Null))
	}

	async fn command(&self, method: &str, params: Value) -> Result<Value> {
		self.raw_command(method, params, Some(&self.session_id)).await
	}

	async fn eval_with_context(&self, js: &str, context_id: Option<u64>) -> Result<Value> {
		let mut params = json!({ "expression": js, "returnByValue": true, "awaitPromise": true });
		if let Some(context_id) = context_id {
			params["contextId"] = json!(context_id);
		}
		let result = self.command("Runtime.evaluate", params).await?;
		if let Some(details) = result.get("exceptionDetails") {
			let text = details.get("text").and_then(Value::as_str).unwrap_or("evaluation failed");
			return Err(BellhopError::Driver(format!("evaluate: {text}")));
		}
		Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
	}

	/// Resolves (and caches) an isolated-world execution context for a frame.
	async fn frame_context(&self, frame_id: &str) -> Result<u64> {
		if let Some(context_id) = self.frame_worlds.lock().get(frame_id) {
			return Ok(*context_id);
		}
		let result = self
			.command(
				"Page.createIsolatedWorld",
				json!({ "frameId": frame_id, "worldName": ISOLATED_WORLD }),
			)
			.await?;
		let context_id = result
			.get("executionContextId")
			.and_then(Value::as_u64)
			.ok_or_else(|| BellhopError::Driver("createIsolatedWorld returned no context".into()))?;
		self.frame_worlds.lock().insert(frame_id.to_string(), context_id);
		Ok(context_id)
	}

	async fn poll_selector(&self, selector: &str, context_id: Option<u64>, timeout: Duration) -> Result<bool> {
		let js = format!("!!document.querySelector({})", serde_json::to_string(selector)?);
		let deadline = Instant::now() + timeout;
		loop {
			if self.eval_with_context(&js, context_id).await? == Value::Bool(true) {
				return Ok(true);
			}
			if Instant::now() >= deadline {
				return Ok(false);
			}
			tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
		}
	}

	async fn fill_with_context(&self, selector: &str, text: &str, context_id: Option<u64>) -> Result<()> {
		let js = format!(
			"(() => {{ const el = document.querySelector({sel}); if (!el) return false; el.focus(); el.value = {val}; \
			 el.dispatchEvent(new Event('input', {{ bubbles: true }})); el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
			 return true; }})()",
			sel = serde_json::to_string(selector)?,
			val = serde_json::to_string(text)?,
		);
		match self.eval_with_context(&js, context_id).await? {
			Value::Bool(true) => Ok(()),
			_ => Err(BellhopError::Driver(format!("fill: no element matches {selector}"))),
		}
	}

	async fn click_with_context(&self, selector: &str, context_id: Option<u64>) -> Result<()> {
		let js = format!(
			"(() => {{ const el = document.querySelector({sel}); if (!el) return false; el.click(); return true; }})()",
			sel = serde_json::to_string(selector)?,
		);
		match self.eval_with_context(&js, context_id).await? {
			Value::Bool(true) => Ok(()),
			_ => Err(BellhopError::Driver(format!("click: no element matches {selector}"))),
		}
	}
}

#[async_trait]
impl PageDriver for CdpDriver {
	async fn navigate(&self, url: &str) -> Result<()> {
		let result = self.command("Page.navigate", json!({ "url": url })).await?;
		if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
			if !error_text.is_empty() {
				return Err(BellhopError::Driver(format!("navigate {url}: {error_text}")));
			}
		}
		self.frame_worlds.lock().clear();

		let deadline = Instant::now() + NAVIGATION_TIMEOUT;
		loop {
			match self.eval_with_context("document.readyState", None).await {
				Ok(Value::String(state)) if state == "complete" => return Ok(()),
				// Transient context loss while the navigation commits.
				Ok(_) | Err(BellhopError::Driver(_)) => {}
				Err(err) => return Err(err),
			}
			if Instant::now() >= deadline {
				return Err(BellhopError::Driver(format!("navigate {url}: load did not complete")));
			}
			tokio::time::sleep(Duration::from_millis(200)).await;
		}
	}

	async fn current_url(&self) -> Result<String> {
		match self.eval_with_context("location.href", None).await? {
			Value::String(url) => Ok(url),
			other => Err(BellhopError::Driver(format!("unexpected location.href result: {other}"))),
		}
	}

	async fn fill(&self, selector: &str, text: &str) -> Result<()> {
		self.fill_with_context(selector, text, None).await
	}

	async fn click(&self, selector: &str) -> Result<()> {
		self.click_with_context(selector, None).await
	}

	async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
		self.poll_selector(selector, None, timeout).await
	}

	async fn evaluate(&self, js: &str) -> Result<Value> {
		self.eval_with_context(js, None).await
	}

	async fn cookies(&self) -> Result<Vec<Cookie>> {
		let result = self.command("Network.getCookies", json!({})).await?;
		let raw = result.get("cookies").cloned().unwrap_or(Value::Array(Vec::new()));
		Ok(serde_json::from_value(raw)?)
	}

	async fn add_cookies(&self, cookies: &[Cookie]) -> Result<()> {
		if cookies.is_empty() {
			return Ok(());
		}
		let url = self.current_url().await.ok();
		let params: Vec<Value> = cookies
			.iter()
			.map(|cookie| {
				let mut value = serde_json::to_value(cookie).unwrap_or(Value::Null);
				// setCookies needs a URL when the record carries no domain.
				if cookie.domain.is_none() {
					if let (Some(url), Some(obj)) = (&url, value.as_object_mut()) {
						obj.insert("url".to_string(), Value::String(url.clone()));
					}
				}
				value
			})
			.collect();
		self.command("Network.setCookies", json!({ "cookies": params })).await?;
		Ok(())
	}

	async fn local_storage(&self) -> Result<Vec<StorageEntry>> {
		let value = self
			.eval_with_context(
				"Object.keys(localStorage).map(key => ({ key, value: localStorage.getItem(key) }))",
				None,
			)
			.await?;
		Ok(serde_json::from_value(value)?)
	}

	async fn seed_local_storage(&self, entries: &[StorageEntry]) -> Result<()> {
		let js = format!(
			"(() => {{ const entries = {payload}; localStorage.clear(); \
			 for (const entry of entries) localStorage.setItem(entry.key, entry.value); return true; }})()",
			payload = serde_json::to_string(entries)?,
		);
		self.eval_with_context(&js, None).await?;
		Ok(())
	}

	async fn frames(&self) -> Result<Vec<FrameInfo>> {
		let result = self.command("Page.getFrameTree", json!({})).await?;
		let mut frames = Vec::new();
		if let Some(tree) = result.get("frameTree") {
			collect_frames(tree, &mut frames);
		}
		Ok(frames)
	}

	async fn fill_in_frame(&self, frame_id: &str, selector: &str, text: &str) -> Result<()> {
		let context_id = self.frame_context(frame_id).await?;
		self.fill_with_context(selector, text, Some(context_id)).await
	}

	async fn click_in_frame(&self, frame_id: &str, selector: &str) -> Result<()> {
		let context_id = self.frame_context(frame_id).await?;
		self.click_with_context(selector, Some(context_id)).await
	}

	async fn evaluate_in_frame(&self, frame_id: &str, js: &str) -> Result<Value> {
		let context_id = self.frame_context(frame_id).await?;
		self.eval_with_context(js, Some(context_id)).await
	}

	async fn wait_for_selector_in_frame(&self, frame_id: &str, selector: &str, timeout: Duration) -> Result<bool> {
		let context_id = self.frame_context(frame_id).await?;
		self.poll_selector(selector, Some(context_id), timeout).await
	}

	async fn close(&self) -> Result<()> {
		if let Err(err) = self.raw_command("Browser.close", json!({}), None).await {
			debug!(target = "bellhop.driver", error = %err, "Browser.close failed; killing process");
		}
		if let Some(handle) = self.reader.lock().take() {
			handle.abort();
		}
		if let Some(mut child) = self.child.lock().take() {
			let _ = child.kill();
			let _ = child.wait();
		}
		if let Err(err) = std::fs::remove_dir_all(&self.user_data_dir) {
			if err.kind() != std::io::ErrorKind::NotFound {
				warn!(target = "bellhop.driver", error = %err, "failed to remove profile dir");
			}
		}
		Ok(())
	}
}

fn collect_frames(tree: &Value, out: &mut Vec<FrameInfo>) {
	if let Some(frame) = tree.get("frame") {
		let id = frame.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
		let url = frame.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
		out.push(FrameInfo { id, url });
	}
	if let Some(children) = tree.get("childFrames").and_then(Value::as_array) {
		for child in children {
			collect_frames(child, out);
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn frame_tree_flattens_nested_children() {
		let tree = json!({
			"frame": { "id": "root", "url": "https://portal.example/login" },
			"childFrames": [
				{ "frame": { "id": "a", "url": "https://challenge.example/widget" } },
				{
					"frame": { "id": "b", "url": "https://portal.example/embed" },
					"childFrames": [ { "frame": { "id": "c", "url": "about:blank" } } ]
				}
			]
		});
		let mut frames = Vec::new();
		collect_frames(&tree, &mut frames);
		let ids: Vec<&str> = frames.iter().map(|f| f.id.as_str()).collect();
		assert_eq!(ids, vec!["root", "a", "b", "c"]);
	}

	#[test]
	fn free_port_allocation_succeeds() {
		let port = pick_free_port().unwrap();
		assert!(port > 0);
	}
}

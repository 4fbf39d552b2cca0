//! Scriptable in-memory page driver for unit and integration testing.
//!
//! Mirrors the shape of the CDP driver without any browser: a
//! [`FakePageController`] scripts how navigation, clicks, and evaluations
//! behave, and records every command the subject under test issued.
//!
//! # Example
//!
//! ```ignore
//! let (page, ctl) = FakePage::scripted();
//! ctl.on_navigate("https://portal/login", "https://portal/login");
//! ctl.on_click("button[name='login']", "https://portal/home");
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Cookie, DriverFactory, FrameInfo, PageDriver, StorageEntry, VisibilityMode};
use crate::error::{BellhopError, Result};

#[derive(Default)]
struct PageState {
	url: String,
	nav_rules: HashMap<String, String>,
	click_rules: HashMap<String, String>,
	selectors: HashSet<String>,
	frames: Vec<FrameInfo>,
	frame_selectors: HashSet<(String, String)>,
	eval_rules: Vec<(String, Value)>,
	eval_once_rules: Vec<(String, Value)>,
	frame_eval_rules: Vec<(String, String, Value)>,
	cookies: Vec<Cookie>,
	storage: Vec<StorageEntry>,
	commands: Vec<String>,
	closed: bool,
	fail_commands: bool,
	fail_close: bool,
}

impl PageState {
	fn record(&mut self, command: String) {
		self.commands.push(command);
	}

	fn check_open(&self) -> Result<()> {
		if self.closed {
			return Err(BellhopError::Driver("page already closed".into()));
		}
		if self.fail_commands {
			return Err(BellhopError::Driver("injected command failure".into()));
		}
		Ok(())
	}
}

/// In-memory [`PageDriver`] whose behavior is scripted by a controller.
pub struct FakePage {
	state: Arc<Mutex<PageState>>,
}

impl FakePage {
	/// Creates a blank page together with its scripting controller.
	pub fn scripted() -> (Self, FakePageController) {
		let state = Arc::new(Mutex::new(PageState {
			url: "about:blank".to_string(),
			..PageState::default()
		}));
		let controller = FakePageController { state: Arc::clone(&state) };
		(Self { state }, controller)
	}

	/// Creates a blank page with no scripted behavior.
	pub fn blank() -> Self {
		Self::scripted().0
	}
}

#[async_trait]
impl PageDriver for FakePage {
	async fn navigate(&self, url: &str) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("navigate {url}"));
		state.url = state.nav_rules.get(url).cloned().unwrap_or_else(|| url.to_string());
		Ok(())
	}

	async fn current_url(&self) -> Result<String> {
		let state = self.state.lock();
		state.check_open()?;
		Ok(state.url.clone())
	}

	async fn fill(&self, selector: &str, text: &str) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("fill {selector}={text}"));
		Ok(())
	}

	async fn click(&self, selector: &str) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("click {selector}"));
		if let Some(url) = state.click_rules.get(selector).cloned() {
			state.url = url;
		}
		Ok(())
	}

	async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> Result<bool> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("wait {selector}"));
		Ok(state.selectors.contains(selector))
	}

	async fn evaluate(&self, js: &str) -> Result<Value> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("evaluate {js}"));
		// One-shot rules take precedence and are consumed on first match.
		if let Some(pos) = state.eval_once_rules.iter().position(|(needle, _)| js.contains(needle.as_str())) {
			let (_, value) = state.eval_once_rules.remove(pos);
			return Ok(value);
		}
		let result = state
			.eval_rules
			.iter()
			.find(|(needle, _)| js.contains(needle.as_str()))
			.map(|(_, value)| value.clone())
			.unwrap_or(Value::Null);
		Ok(result)
	}

	async fn cookies(&self) -> Result<Vec<Cookie>> {
		let state = self.state.lock();
		state.check_open()?;
		Ok(state.cookies.clone())
	}

	async fn add_cookies(&self, cookies: &[Cookie]) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("add_cookies x{}", cookies.len()));
		for cookie in cookies {
			state.cookies.retain(|c| c.name != cookie.name);
			state.cookies.push(cookie.clone());
		}
		Ok(())
	}

	async fn local_storage(&self) -> Result<Vec<StorageEntry>> {
		let state = self.state.lock();
		state.check_open()?;
		Ok(state.storage.clone())
	}

	async fn seed_local_storage(&self, entries: &[StorageEntry]) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("seed_storage x{}", entries.len()));
		state.storage = entries.to_vec();
		Ok(())
	}

	async fn frames(&self) -> Result<Vec<FrameInfo>> {
		let state = self.state.lock();
		state.check_open()?;
		Ok(state.frames.clone())
	}

	async fn fill_in_frame(&self, frame_id: &str, selector: &str, text: &str) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("fill_in_frame {frame_id} {selector}={text}"));
		Ok(())
	}

	async fn click_in_frame(&self, frame_id: &str, selector: &str) -> Result<()> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("click_in_frame {frame_id} {selector}"));
		Ok(())
	}

	async fn evaluate_in_frame(&self, frame_id: &str, js: &str) -> Result<Value> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("evaluate_in_frame {frame_id} {js}"));
		let result = state
			.frame_eval_rules
			.iter()
			.find(|(frame, needle, _)| frame == frame_id && js.contains(needle.as_str()))
			.map(|(_, _, value)| value.clone())
			.unwrap_or(Value::Null);
		Ok(result)
	}

	async fn wait_for_selector_in_frame(&self, frame_id: &str, selector: &str, _timeout: Duration) -> Result<bool> {
		let mut state = self.state.lock();
		state.check_open()?;
		state.record(format!("wait_in_frame {frame_id} {selector}"));
		Ok(state.frame_selectors.contains(&(frame_id.to_string(), selector.to_string())))
	}

	async fn close(&self) -> Result<()> {
		let mut state = self.state.lock();
		state.record("close".to_string());
		if state.fail_close {
			return Err(BellhopError::Driver("injected teardown failure".into()));
		}
		state.closed = true;
		Ok(())
	}
}

/// Scripts a [`FakePage`] and inspects what the subject under test did to it.
#[derive(Clone)]
pub struct FakePageController {
	state: Arc<Mutex<PageState>>,
}

impl FakePageController {
	/// Sets the URL the page reports after navigating to `requested`.
	pub fn on_navigate(&self, requested: &str, lands_on: &str) {
		self.state.lock().nav_rules.insert(requested.to_string(), lands_on.to_string());
	}

	/// Sets the URL the page reports after clicking `selector`.
	pub fn on_click(&self, selector: &str, lands_on: &str) {
		self.state.lock().click_rules.insert(selector.to_string(), lands_on.to_string());
	}

	/// Marks `selector` as present so selector waits succeed.
	pub fn selector_present(&self, selector: &str) {
		self.state.lock().selectors.insert(selector.to_string());
	}

	/// Marks `selector` inside `frame_id` as present.
	pub fn frame_selector_present(&self, frame_id: &str, selector: &str) {
		self.state.lock().frame_selectors.insert((frame_id.to_string(), selector.to_string()));
	}

	/// Adds a subframe to the page.
	pub fn add_frame(&self, id: &str, url: &str) {
		self.state.lock().frames.push(FrameInfo {
			id: id.to_string(),
			url: url.to_string(),
		});
	}

	/// Returns `value` from any main-frame evaluation containing `needle`.
	pub fn on_evaluate(&self, needle: &str, value: Value) {
		self.state.lock().eval_rules.push((needle.to_string(), value));
	}

	/// Like [`Self::on_evaluate`] but consumed after the first match, taking
	/// precedence over persistent rules.
	pub fn on_evaluate_once(&self, needle: &str, value: Value) {
		self.state.lock().eval_once_rules.push((needle.to_string(), value));
	}

	/// Returns `value` from any `frame_id` evaluation containing `needle`.
	pub fn on_frame_evaluate(&self, frame_id: &str, needle: &str, value: Value) {
		self.state.lock().frame_eval_rules.push((frame_id.to_string(), needle.to_string(), value));
	}

	/// Seeds cookies already present in the context.
	pub fn set_cookies(&self, cookies: Vec<Cookie>) {
		self.state.lock().cookies = cookies;
	}

	/// Seeds local-storage entries already present in the context.
	pub fn set_storage(&self, entries: Vec<StorageEntry>) {
		self.state.lock().storage = entries;
	}

	/// Sets the current URL directly.
	pub fn set_url(&self, url: &str) {
		self.state.lock().url = url.to_string();
	}

	/// Makes every subsequent command fail with a driver error.
	pub fn fail_commands(&self) {
		self.state.lock().fail_commands = true;
	}

	/// Makes teardown fail with a driver error.
	pub fn fail_close(&self) {
		self.state.lock().fail_close = true;
	}

	/// Returns `true` once the page has been closed.
	pub fn is_closed(&self) -> bool {
		self.state.lock().closed
	}

	/// Takes the recorded command log, clearing it.
	pub fn take_commands(&self) -> Vec<String> {
		std::mem::take(&mut self.state.lock().commands)
	}
}

struct FactoryState {
	scripted: VecDeque<FakePage>,
	controllers: Vec<FakePageController>,
	launched: usize,
	fail_next: bool,
}

/// [`DriverFactory`] producing fake pages; scripted pages are handed out in
/// FIFO order, after which blank pages are produced on demand.
#[derive(Clone)]
pub struct FakeDriverFactory {
	state: Arc<Mutex<FactoryState>>,
}

impl FakeDriverFactory {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(FactoryState {
				scripted: VecDeque::new(),
				controllers: Vec::new(),
				launched: 0,
				fail_next: false,
			})),
		}
	}

	/// Queues a pre-scripted page for the next launch.
	pub fn push(&self, page: FakePage) {
		self.state.lock().scripted.push_back(page);
	}

	/// Queues a fresh page and returns its controller for later scripting.
	pub fn push_scripted(&self) -> FakePageController {
		let (page, controller) = FakePage::scripted();
		let mut state = self.state.lock();
		state.scripted.push_back(page);
		state.controllers.push(controller.clone());
		controller
	}

	/// Makes the next launch fail with a resource-allocation error.
	pub fn fail_next_launch(&self) {
		self.state.lock().fail_next = true;
	}

	/// Number of successful launches so far.
	pub fn launched(&self) -> usize {
		self.state.lock().launched
	}

	/// Controllers for every page produced via [`Self::push_scripted`] plus
	/// blank launches, in launch order.
	pub fn controllers(&self) -> Vec<FakePageController> {
		self.state.lock().controllers.clone()
	}
}

impl Default for FakeDriverFactory {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
	async fn launch(&self, _mode: VisibilityMode) -> Result<Box<dyn PageDriver>> {
		let mut state = self.state.lock();
		if state.fail_next {
			state.fail_next = false;
			return Err(BellhopError::ResourceAllocation("injected launch failure".into()));
		}
		state.launched += 1;
		let page = match state.scripted.pop_front() {
			Some(page) => page,
			None => {
				let (page, controller) = FakePage::scripted();
				state.controllers.push(controller);
				page
			}
		};
		Ok(Box::new(page))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn scripted_navigation_and_click_change_url() {
		let (page, ctl) = FakePage::scripted();
		ctl.on_navigate("https://a.example/login", "https://a.example/login");
		ctl.on_click("button[name='login']", "https://a.example/home");

		page.navigate("https://a.example/login").await.unwrap();
		assert_eq!(page.current_url().await.unwrap(), "https://a.example/login");
		page.click("button[name='login']").await.unwrap();
		assert_eq!(page.current_url().await.unwrap(), "https://a.example/home");
	}

	#[tokio::test]
	async fn evaluate_matches_by_substring() {
		let (page, ctl) = FakePage::scripted();
		ctl.on_evaluate("audio-source", json!("https://challenge.example/payload.wav"));

		let value = page.evaluate("document.querySelector('#audio-source').src").await.unwrap();
		assert_eq!(value, json!("https://challenge.example/payload.wav"));
		assert_eq!(page.evaluate("unrelated").await.unwrap(), Value::Null);
	}

	#[tokio::test]
	async fn factory_fails_once_when_injected() {
		let factory = FakeDriverFactory::new();
		factory.fail_next_launch();
		let err = factory.launch(VisibilityMode::Headless).await.unwrap_err();
		assert!(matches!(err, BellhopError::ResourceAllocation(_)));
		assert!(factory.launch(VisibilityMode::Headless).await.is_ok());
		assert_eq!(factory.launched(), 1);
	}

	#[tokio::test]
	async fn closed_page_rejects_commands() {
		let page = FakePage::blank();
		page.close().await.unwrap();
		assert!(page.current_url().await.is_err());
	}
}

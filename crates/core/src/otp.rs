//! One-time-code retrieval from an out-of-band mailbox.
//!
//! The portal sends either a numeric login code or a single-use login link,
//! from two distinct sender addresses. Only deliveries younger than the
//! freshness window count; among those the most recent wins.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::MailboxConfig;
use crate::error::{BellhopError, Result};
use crate::snapshot::now_ms;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"login code for account \S+ is (\d+)").expect("static regex"));
static LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]*logincode=[A-Za-z0-9]+[^\s"'<>]*"#).expect("static regex"));

/// Which kind of delivery a sender address produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
	Code,
	Link,
}

/// The extracted one-time credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpValue {
	/// Numeric code typed into the login form.
	Code(String),
	/// Single-use login URL navigated to directly.
	Link(String),
}

/// One usable delivery pulled from the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpDelivery {
	pub value: OtpValue,
	/// Arrival time in unix milliseconds.
	pub received_at: u64,
}

/// Source of one-time deliveries for a recipient identity.
#[async_trait]
pub trait OtpSource: Send + Sync {
	/// Returns the freshest usable delivery within `freshness`, if any.
	async fn fetch_recent(&self, identity: &str, freshness: Duration) -> Result<Option<OtpDelivery>>;
}

/// Extracts a numeric login code from a message body.
pub fn extract_code(body: &str) -> Option<String> {
	CODE_PATTERN.captures(body).map(|caps| caps[1].to_string())
}

/// Extracts a single-use login link from a message body.
pub fn extract_link(body: &str) -> Option<String> {
	LINK_PATTERN.find(body).map(|m| m.as_str().to_string())
}

/// Keeps only deliveries inside the freshness window ending at `now`.
pub fn filter_fresh(deliveries: Vec<OtpDelivery>, now: u64, freshness: Duration) -> Vec<OtpDelivery> {
	let cutoff = now.saturating_sub(freshness.as_millis() as u64);
	deliveries.into_iter().filter(|delivery| delivery.received_at >= cutoff).collect()
}

/// Picks the most recent delivery; ties keep the earliest in query order.
pub fn select_delivery(deliveries: Vec<OtpDelivery>) -> Option<OtpDelivery> {
	let mut best: Option<OtpDelivery> = None;
	for delivery in deliveries {
		match &best {
			Some(current) if delivery.received_at <= current.received_at => {}
			_ => best = Some(delivery),
		}
	}
	best
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailMessage {
	from: String,
	/// Unix milliseconds.
	received_at: u64,
	body: String,
}

/// [`OtpSource`] backed by a JSON mailbox API.
pub struct HttpMailSource {
	client: reqwest::Client,
	config: MailboxConfig,
}

impl HttpMailSource {
	pub fn new(config: MailboxConfig) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|e| BellhopError::Mailbox(e.to_string()))?;
		Ok(Self { client, config })
	}

	fn sender_kind(&self, from: &str) -> Option<SenderKind> {
		if from.contains(&self.config.code_sender) {
			Some(SenderKind::Code)
		} else if from.contains(&self.config.link_sender) {
			Some(SenderKind::Link)
		} else {
			None
		}
	}
}

#[async_trait]
impl OtpSource for HttpMailSource {
	async fn fetch_recent(&self, identity: &str, freshness: Duration) -> Result<Option<OtpDelivery>> {
		let mut request = self.client.get(&self.config.endpoint).query(&[("recipient", identity)]);
		if let Some(token) = &self.config.token {
			request = request.bearer_auth(token);
		}
		let messages: Vec<MailMessage> = request
			.send()
			.await
			.map_err(|e| BellhopError::Mailbox(e.to_string()))?
			.error_for_status()
			.map_err(|e| BellhopError::Mailbox(e.to_string()))?
			.json()
			.await
			.map_err(|e| BellhopError::Mailbox(e.to_string()))?;

		let mut deliveries = Vec::new();
		for message in messages {
			let Some(kind) = self.sender_kind(&message.from) else { continue };
			let value = match kind {
				SenderKind::Code => extract_code(&message.body).map(OtpValue::Code),
				SenderKind::Link => extract_link(&message.body).map(OtpValue::Link),
			};
			let Some(value) = value else {
				debug!(target = "bellhop.auth", from = %message.from, "delivery matched sender but held no credential");
				continue;
			};
			deliveries.push(OtpDelivery {
				value,
				received_at: message.received_at,
			});
		}
		Ok(select_delivery(filter_fresh(deliveries, now_ms(), freshness)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn code_extraction_matches_portal_wording() {
		let body = "Hello,\n\nYour login code for account acme-lettings is 482913.\n";
		assert_eq!(extract_code(body), Some("482913".into()));
		assert_eq!(extract_code("no code here"), None);
	}

	#[test]
	fn link_extraction_finds_login_url() {
		let body = "Click <a href=\"https://portal.example.com/login?logincode=Zx9Qa7\">here</a> to sign in.";
		assert_eq!(extract_link(body), Some("https://portal.example.com/login?logincode=Zx9Qa7".into()));
		assert_eq!(extract_link("https://portal.example.com/help"), None);
	}

	#[test]
	fn freshest_delivery_wins() {
		let older = OtpDelivery {
			value: OtpValue::Code("111111".into()),
			received_at: 1_000,
		};
		let newer = OtpDelivery {
			value: OtpValue::Code("222222".into()),
			received_at: 60_000,
		};
		let picked = select_delivery(vec![older.clone(), newer.clone()]).unwrap();
		assert_eq!(picked, newer);
		// Order of the query result must not matter.
		let picked = select_delivery(vec![newer.clone(), older]).unwrap();
		assert_eq!(picked, newer);
	}

	#[test]
	fn ties_keep_query_order() {
		let first = OtpDelivery {
			value: OtpValue::Code("111111".into()),
			received_at: 5_000,
		};
		let second = OtpDelivery {
			value: OtpValue::Link("https://portal.example.com/login?logincode=abc".into()),
			received_at: 5_000,
		};
		assert_eq!(select_delivery(vec![first.clone(), second]).unwrap(), first);
	}

	#[test]
	fn deliveries_outside_the_freshness_window_are_ignored() {
		let now = 3_600_000;
		let window = Duration::from_secs(300);
		let stale = OtpDelivery {
			value: OtpValue::Code("111111".into()),
			received_at: now - 600_000,
		};
		let fresh = OtpDelivery {
			value: OtpValue::Code("222222".into()),
			received_at: now - 60_000,
		};

		let kept = filter_fresh(vec![stale.clone(), fresh.clone()], now, window);
		assert_eq!(kept, vec![fresh.clone()]);
		assert_eq!(select_delivery(kept).unwrap(), fresh);

		// A stale-only mailbox yields nothing at all.
		assert!(select_delivery(filter_fresh(vec![stale], now, window)).is_none());
	}

	#[test]
	fn empty_mailbox_yields_nothing() {
		assert!(select_delivery(Vec::new()).is_none());
	}
}

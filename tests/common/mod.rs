#![allow(dead_code)]

// std
use std::{
	collections::VecDeque,
	sync::{
		Arc,
		atomic::{AtomicU32, Ordering},
	},
	time::Duration,
};
// crates.io
use parking_lot::Mutex;
use tokio::time::Instant;
// self
use request_governor::{
	config::GovernorConfig,
	error::UpstreamError,
	transport::{RequestDescriptor, Response, Transport, TransportFuture},
	url::Url,
};

/// Outcome a [`ScriptedTransport`] replays for one call.
#[derive(Clone, Copy, Debug)]
pub enum Step {
	/// 2xx response with a JSON body.
	Ok(&'static str),
	/// Non-2xx status.
	Status(u16),
	/// Transport deadline elapsed.
	Timeout,
}

/// Transport replaying a fixed script, answering `200 {}` once it runs out.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
	script: Mutex<VecDeque<Step>>,
	calls: AtomicU32,
	call_times: Mutex<Vec<Instant>>,
	latency: Duration,
}
impl ScriptedTransport {
	pub fn new(script: impl IntoIterator<Item = Step>) -> Arc<Self> {
		Arc::new(Self { script: Mutex::new(script.into_iter().collect()), ..Default::default() })
	}

	pub fn healthy() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn with_latency(script: impl IntoIterator<Item = Step>, latency: Duration) -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(script.into_iter().collect()),
			latency,
			..Default::default()
		})
	}

	pub fn calls(&self) -> u32 {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn call_times(&self) -> Vec<Instant> {
		self.call_times.lock().clone()
	}
}
impl Transport for ScriptedTransport {
	fn send<'a>(&'a self, _: &'a RequestDescriptor) -> TransportFuture<'a> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.call_times.lock().push(Instant::now());

		let step = self.script.lock().pop_front().unwrap_or(Step::Ok("{}"));
		let latency = self.latency;

		Box::pin(async move {
			if !latency.is_zero() {
				tokio::time::sleep(latency).await;
			}

			match step {
				Step::Ok(body) => Ok(Response::new(200, body)),
				Step::Status(status) => Err(UpstreamError::status_code(status, "scripted failure")),
				Step::Timeout => Err(UpstreamError::Timeout { message: "scripted timeout".into() }),
			}
		})
	}
}

pub fn target(path: &str) -> Url {
	Url::parse("https://api.example.com")
		.and_then(|base| base.join(path))
		.expect("Test URL should parse.")
}

/// Configuration with short backoff so paused-clock tests stay small.
pub fn quick_config() -> GovernorConfig {
	GovernorConfig { backoff_factor: 0.05, max_delay_sec: 1., ..Default::default() }
}

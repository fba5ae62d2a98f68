//! Demonstrates a governor in front of a flaky in-process transport and, optionally, a real URL.
//!
//! 1. Load a [`GovernorConfig`] from JSON.
//! 2. Implement [`Transport`] for a mock that fails twice with HTTP 503 before recovering.
//! 3. Fire requests of mixed [`Priority`] concurrently and watch retries absorb the failures.
//! 4. Pass a URL as the first argument to send one request through [`ReqwestTransport`].

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicU32, Ordering},
	},
	time::Duration,
};
// crates.io
use color_eyre::Result;
// self
use request_governor::{
	config::GovernorConfig,
	error::UpstreamError,
	governor::Governor,
	limiter::Priority,
	transport::{ReqwestTransport, RequestDescriptor, Response, Transport, TransportFuture},
	url::Url,
};

const CONFIG: &str = r#"{
	"per_second_limit": 2,
	"per_minute_limit": 60,
	"burst_size": 2,
	"failure_threshold": 4,
	"max_retry_attempts": 3,
	"backoff_factor": 0.2,
	"max_delay_sec": 2.0
}"#;

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let config = GovernorConfig::from_json_str(CONFIG)?;
	let governor = Arc::new(
		Governor::new("demo-inventory", config.clone(), Arc::new(FlakyTransport::default()))?
			.with_on_retry(|attempt| {
				println!(
					"Retry #{} in {:?} after: {}.",
					attempt.attempt_number, attempt.delay, attempt.last_error
				);

				Ok(())
			}),
	);
	let base = Url::parse("https://inventory.example.com")?;
	let mut handles = Vec::new();

	for (sku, priority) in
		[("A-1", Priority::Low), ("B-2", Priority::High), ("C-3", Priority::Normal)]
	{
		let governor = Arc::clone(&governor);
		let request =
			RequestDescriptor::get(base.join(&format!("/stock/{sku}"))?).with_priority(priority);

		handles.push(tokio::spawn(async move { (sku, governor.execute(request).await) }));
	}

	for handle in handles {
		let (sku, result) = handle.await?;

		match result {
			Ok(response) => println!("{sku} ({}): {}.", response.status, response.text()),
			Err(e) => println!("{sku} failed: {e}."),
		}
	}

	println!("{}", serde_json::to_string_pretty(&governor.metrics())?);

	if let Some(target) = std::env::args().nth(1) {
		let remote = Governor::new(
			"demo-remote",
			config,
			Arc::new(ReqwestTransport::with_timeout(Duration::from_secs(10))?),
		)?;

		match remote.execute(RequestDescriptor::get(Url::parse(&target)?)).await {
			Ok(response) => println!("{target} answered HTTP {}.", response.status),
			Err(e) => println!("{target} failed: {e}."),
		}

		remote.shutdown().await;
	}

	governor.shutdown().await;

	Ok(())
}

#[derive(Debug, Default)]
struct FlakyTransport {
	calls: AtomicU32,
}
impl Transport for FlakyTransport {
	fn send<'a>(&'a self, request: &'a RequestDescriptor) -> TransportFuture<'a> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst);

		Box::pin(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;

			if call < 2 {
				return Err(UpstreamError::status_code(503, "inventory service warming up"));
			}

			let body = format!(r#"{{"path":"{}","in_stock":true}}"#, request.target.path());

			Ok(Response::new(200, body).with_header("content-type", "application/json"))
		})
	}
}

//! Transport seam between the governor and an HTTP stack.
//!
//! [`Transport`] is the governor's only dependency on the network. Implementations translate a
//! [`RequestDescriptor`] into a wire request and report every non-success outcome as a classified
//! [`UpstreamError`], so retry and breaker decisions never depend on a particular client library.
//! [`ReqwestTransport`] ships behind the default `reqwest` feature.

#[cfg(feature = "reqwest")] mod reqwest;
#[cfg(feature = "reqwest")] pub use self::reqwest::ReqwestTransport;

// crates.io
use serde::de::DeserializeOwned;
// self
use crate::{_prelude::*, error::UpstreamError, limiter::Priority};

/// Boxed future returned by [`Transport::send`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<Response, UpstreamError>> + 'a + Send>>;

/// Abstraction over HTTP clients able to execute governed requests.
///
/// Implementations must be `Send + Sync + 'static` so one instance can be shared by every caller of
/// a [`Governor`](crate::governor::Governor). A send may be invoked several times for the same
/// descriptor when the governor retries.
pub trait Transport
where
	Self: 'static + Send + Sync,
{
	/// Executes `request` once.
	fn send<'a>(&'a self, request: &'a RequestDescriptor) -> TransportFuture<'a>;
}

/// HTTP methods supported by governed requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
	/// `GET`.
	#[default]
	Get,
	/// `POST`.
	Post,
	/// `PUT`.
	Put,
	/// `PATCH`.
	Patch,
	/// `DELETE`.
	Delete,
	/// `HEAD`.
	Head,
}
impl Method {
	/// Returns the canonical method token.
	pub const fn as_str(self) -> &'static str {
		match self {
			Method::Get => "GET",
			Method::Post => "POST",
			Method::Put => "PUT",
			Method::Patch => "PATCH",
			Method::Delete => "DELETE",
			Method::Head => "HEAD",
		}
	}
}
impl Display for Method {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Describes one outbound request and how it should be governed.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
	/// HTTP method.
	pub method: Method,
	/// Absolute target URL.
	pub target: Url,
	/// Query parameters appended to `target`.
	pub query: Vec<(String, String)>,
	/// Extra request headers.
	pub headers: Vec<(String, String)>,
	/// JSON request body.
	pub body: Option<serde_json::Value>,
	/// Admission priority.
	pub priority: Priority,
	/// Per-attempt admission deadline; overrides the governor default.
	pub admission_timeout: Option<Duration>,
	/// Token that aborts the request, retries included.
	pub cancel: Option<CancellationToken>,
}
impl RequestDescriptor {
	/// Creates a descriptor with [`Priority::Normal`] and no parameters.
	pub fn new(method: Method, target: Url) -> Self {
		Self {
			method,
			target,
			query: Vec::new(),
			headers: Vec::new(),
			body: None,
			priority: Priority::Normal,
			admission_timeout: None,
			cancel: None,
		}
	}

	/// Shorthand for a `GET` descriptor.
	pub fn get(target: Url) -> Self {
		Self::new(Method::Get, target)
	}

	/// Shorthand for a `POST` descriptor.
	pub fn post(target: Url) -> Self {
		Self::new(Method::Post, target)
	}

	/// Appends a query parameter.
	pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.push((key.into(), value.into()));

		self
	}

	/// Appends a request header.
	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// Sets the JSON body.
	pub fn with_json(mut self, body: serde_json::Value) -> Self {
		self.body = Some(body);

		self
	}

	/// Sets the admission priority.
	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;

		self
	}

	/// Bounds how long each attempt may wait for admission.
	pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
		self.admission_timeout = Some(timeout);

		self
	}

	/// Attaches a cancellation token.
	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancel = Some(token);

		self
	}
}

/// Successful (2xx) response returned by a [`Transport`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
	/// HTTP status code.
	pub status: u16,
	/// Response headers in arrival order.
	pub headers: Vec<(String, String)>,
	/// Raw body.
	pub body: Vec<u8>,
}
impl Response {
	/// Creates a response without headers.
	pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
		Self { status, headers: Vec::new(), body: body.into() }
	}

	/// Appends a header.
	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// First header named `name`, compared case-insensitively.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	/// Body decoded as UTF-8, replacing invalid sequences.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	/// Deserializes the body as JSON; errors name the offending path.
	pub fn json<T>(&self) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let mut de = serde_json::Deserializer::from_slice(&self.body);

		serde_path_to_error::deserialize(&mut de)
			.map_err(|source| Error::Decode { source, status: self.status })
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[derive(Debug, Deserialize)]
	struct Trade {
		price: f64,
	}

	#[test]
	fn builders_accumulate_parameters() {
		let target = Url::parse("https://api.example.com/trades").expect("Test URL should parse.");
		let token = CancellationToken::new();
		let request = RequestDescriptor::get(target)
			.with_query("from", "2024-01-01")
			.with_query("to", "2024-01-02")
			.with_priority(Priority::High)
			.with_cancellation(token.clone());

		assert_eq!(request.method, Method::Get);
		assert_eq!(request.query.len(), 2);
		assert_eq!(request.priority, Priority::High);

		token.cancel();

		assert!(request.cancel.as_ref().is_some_and(|t| t.is_cancelled()));
	}

	#[test]
	fn json_errors_report_path_and_status() {
		let ok = Response::new(200, r#"[{ "price": 12.5 }]"#);
		let trades = ok.json::<Vec<Trade>>().expect("Valid payload should decode.");

		assert_eq!(trades[0].price, 12.5);

		let bad = Response::new(200, r#"[{ "price": "cheap" }]"#);
		let err = bad.json::<Vec<Trade>>().expect_err("Invalid payload should fail.");

		match err {
			Error::Decode { source, status } => {
				assert_eq!(status, 200);
				assert_eq!(source.path().to_string(), "[0].price");
			},
			other => panic!("Unexpected error: {other:?}."),
		}
	}

	#[test]
	fn header_lookup_ignores_case() {
		let response = Response::new(200, "").with_header("Content-Type", "application/json");

		assert_eq!(response.header("content-type"), Some("application/json"));
		assert_eq!(response.header("retry-after"), None);
	}
}

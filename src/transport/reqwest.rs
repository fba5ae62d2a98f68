// crates.io
use reqwest::{
	Method as ReqwestMethod,
	header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER},
};
use time::format_description::well_known::Rfc2822;
// self
use crate::{
	_prelude::*,
	error::{ConfigError, UpstreamError},
	transport::{Method, RequestDescriptor, Response, Transport, TransportFuture},
};

const BODY_PREVIEW_LIMIT: usize = 256;

/// Thin wrapper around [`ReqwestClient`] that classifies outcomes for the governor.
///
/// Non-2xx statuses become [`UpstreamError::Status`] carrying a truncated body preview and any
/// `Retry-After` hint, client timeouts become [`UpstreamError::Timeout`], and the remaining network
/// failures become [`UpstreamError::Connection`].
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport(pub ReqwestClient);
impl ReqwestTransport {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	/// Builds a client whose requests time out after `timeout`.
	pub fn with_timeout(timeout: Duration) -> Result<Self, ConfigError> {
		Ok(Self(ReqwestClient::builder().timeout(timeout).build()?))
	}
}
impl AsRef<ReqwestClient> for ReqwestTransport {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
impl Transport for ReqwestTransport {
	fn send<'a>(&'a self, request: &'a RequestDescriptor) -> TransportFuture<'a> {
		Box::pin(async move {
			let mut builder = self.0.request(reqwest_method(request.method), request.target.clone());

			if !request.query.is_empty() {
				builder = builder.query(&request.query);
			}
			for (name, value) in &request.headers {
				builder = builder.header(name.as_str(), value.as_str());
			}
			if let Some(body) = &request.body {
				let payload = serde_json::to_vec(body).map_err(|e| {
					UpstreamError::classified(format!("Request body could not be encoded: {e}"), false)
				})?;

				builder = builder.header(CONTENT_TYPE, "application/json").body(payload);
			}

			let response = builder.send().await.map_err(map_reqwest_error)?;
			let status = response.status();
			let retry_after = parse_retry_after(response.headers());
			let headers = response
				.headers()
				.iter()
				.filter_map(|(name, value)| {
					value.to_str().ok().map(|value| (name.as_str().to_owned(), value.to_owned()))
				})
				.collect::<Vec<_>>();
			let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

			if !status.is_success() {
				let preview = truncate_preview(String::from_utf8_lossy(&body).into_owned());
				let message = if preview.trim().is_empty() {
					status.canonical_reason().unwrap_or("no reason phrase").to_owned()
				} else {
					preview
				};

				return Err(UpstreamError::Status { status: status.as_u16(), message, retry_after });
			}

			Ok(Response { status: status.as_u16(), headers, body })
		})
	}
}

fn reqwest_method(method: Method) -> ReqwestMethod {
	match method {
		Method::Get => ReqwestMethod::GET,
		Method::Post => ReqwestMethod::POST,
		Method::Put => ReqwestMethod::PUT,
		Method::Patch => ReqwestMethod::PATCH,
		Method::Delete => ReqwestMethod::DELETE,
		Method::Head => ReqwestMethod::HEAD,
	}
}

fn map_reqwest_error(err: ReqwestError) -> UpstreamError {
	if err.is_timeout() {
		return UpstreamError::Timeout { message: err.to_string() };
	}
	if err.is_builder() {
		return UpstreamError::classified(format!("Request could not be built: {err}"), false);
	}

	UpstreamError::connection(err)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let value = headers.get(RETRY_AFTER)?;
	let raw = value.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::from_secs(secs));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Duration::try_from(delta).ok();
		}
	}

	None
}

fn truncate_preview(body: String) -> String {
	if body.chars().count() <= BODY_PREVIEW_LIMIT {
		return body;
	}

	let mut buf = String::new();

	for (idx, ch) in body.chars().enumerate() {
		if idx >= BODY_PREVIEW_LIMIT {
			buf.push('…');

			break;
		}
		buf.push(ch);
	}

	buf
}

#[cfg(test)]
mod tests {
	// crates.io
	use reqwest::header::HeaderValue;
	// self
	use super::*;

	#[test]
	fn retry_after_accepts_seconds_and_dates() {
		let mut headers = HeaderMap::new();

		headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));

		assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

		headers.insert(RETRY_AFTER, HeaderValue::from_static("Fri, 01 Jan 2100 00:00:00 +0000"));

		let hint = parse_retry_after(&headers).expect("Future date should yield a hint.");

		assert!(hint > Duration::from_secs(365 * 24 * 60 * 60));

		headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 +0000"));

		assert_eq!(parse_retry_after(&headers), None);

		headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));

		assert_eq!(parse_retry_after(&headers), None);
	}

	#[test]
	fn previews_are_truncated_on_char_boundaries() {
		let short = "é".repeat(BODY_PREVIEW_LIMIT);
		let long = "é".repeat(BODY_PREVIEW_LIMIT + 10);

		assert_eq!(truncate_preview(short.clone()), short);

		let cut = truncate_preview(long);

		assert_eq!(cut.chars().count(), BODY_PREVIEW_LIMIT + 1);
		assert!(cut.ends_with('…'));
	}
}

// self
use crate::{_prelude::*, transport::Method};

/// Type alias that resolves to an instrumented future when tracing is enabled.
#[cfg(feature = "tracing")]
pub type InstrumentedRequest<F> = tracing::instrument::Instrumented<F>;
/// Passthrough future type when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub type InstrumentedRequest<F> = F;

/// Emits a `tracing` event when the feature is enabled; otherwise only borrows the field values.
macro_rules! event {
	($level:ident, $($arg:tt)+) => {{
		#[cfg(feature = "tracing")]
		{
			::tracing::event!(::tracing::Level::$level, $($arg)+);
		}
		#[cfg(not(feature = "tracing"))]
		{
			$crate::obs::discard_fields!($($arg)+);
		}
	}};
}
pub(crate) use event;

/// Consumes `event!` fields by reference so disabled events leave no unused bindings.
#[cfg_attr(feature = "tracing", allow(unused_macros))]
macro_rules! discard_fields {
	() => {};
	($message:literal $(,)?) => {};
	($name:ident = % $value:expr $(, $($rest:tt)*)?) => {
		let _ = &$value;
		$($crate::obs::discard_fields!($($rest)*);)?
	};
	($name:ident = ? $value:expr $(, $($rest:tt)*)?) => {
		let _ = &$value;
		$($crate::obs::discard_fields!($($rest)*);)?
	};
	($name:ident = $value:expr $(, $($rest:tt)*)?) => {
		let _ = &$value;
		$($crate::obs::discard_fields!($($rest)*);)?
	};
	($name:ident $(, $($rest:tt)*)?) => {
		let _ = &$name;
		$($crate::obs::discard_fields!($($rest)*);)?
	};
}
#[cfg_attr(feature = "tracing", allow(unused_imports))]
pub(crate) use discard_fields;

/// A span wrapping one governed request, retries included.
#[derive(Clone, Debug)]
pub struct RequestSpan {
	#[cfg(feature = "tracing")]
	span: tracing::Span,
}
impl RequestSpan {
	/// Creates a new span tagged with the governor name, method, and target.
	pub fn new(governor: &str, method: Method, target: &Url) -> Self {
		#[cfg(feature = "tracing")]
		{
			let span = tracing::info_span!(
				"request_governor.request",
				governor,
				method = method.as_str(),
				target = %target
			);

			Self { span }
		}
		#[cfg(not(feature = "tracing"))]
		{
			let _ = (governor, method, target);

			Self {}
		}
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> InstrumentedRequest<Fut>
	where
		Fut: Future,
	{
		#[cfg(feature = "tracing")]
		{
			use tracing::Instrument;

			fut.instrument(self.span.clone())
		}
		#[cfg(not(feature = "tracing"))]
		{
			fut
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn instrument_wraps_future() {
		let target = Url::parse("https://api.example.com/v1/trades")
			.expect("Test URL should parse.");
		let span = RequestSpan::new("trades", Method::Get, &target);
		let value = span.instrument(async { 42 }).await;

		assert_eq!(value, 42);
	}

	#[test]
	fn event_macro_accepts_every_field_form() {
		// Bindings read only by `event!` must stay warning-free without `tracing`.
		let attempt = 2;
		let name = String::from("orders");
		let delay = Duration::from_millis(250);
		let error = std::io::Error::other("reset");

		match attempt {
			2 => event!(
				WARN,
				governor = %name,
				attempt,
				delay_ms = delay.as_millis() as u64,
				error = ?error,
				"Event macro field forms."
			),
			_ => event!(DEBUG, "Bare message."),
		}
	}
}

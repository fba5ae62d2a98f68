//! Resilient outbound request governor: dual-tier rate limiting, priority admission, circuit
//! breaking, and jittered retries wrapped around any HTTP transport.
//!
//! A [`Governor`](governor::Governor) composes four independently usable parts:
//!
//! - [`limiter::DualTierLimiter`] paces admissions against a per-second and a per-minute budget, a
//!   short burst guard, and an adaptive throttle that backs off whenever the remote answers HTTP
//!   429.
//! - [`breaker::CircuitBreaker`] trips after consecutive failures and fails fast until a recovery
//!   window elapses, then admits a bounded number of probes.
//! - [`retry::RetryOrchestrator`] re-runs retryable failures with capped exponential backoff and
//!   jitter.
//! - [`transport::Transport`] is the only seam to the network; [`transport::ReqwestTransport`]
//!   ships behind the `reqwest` feature.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod breaker;
pub mod config;
pub mod error;
pub mod governor;
pub mod limiter;
pub mod obs;
pub mod retry;
pub mod transport;

mod _prelude {
	pub use std::{
		collections::{BTreeSet, BinaryHeap, HashMap, VecDeque},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::{Arc, Weak},
		time::Duration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use tokio::time::Instant;
	pub use tokio_util::sync::CancellationToken;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use tokio_util::sync::CancellationToken;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};

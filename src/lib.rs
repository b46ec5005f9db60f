pub mod api_key;
pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod import_id;
pub mod rate_limiter;
pub mod reconciler;
pub mod request;
pub mod secret;
pub mod subuser;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::Config;
pub use error::{Error, ErrorContext, Result};
pub use group::ReconciliationGroup;
pub use rate_limiter::{RateLimiter, RateLimiters};
pub use reconciler::{Convergence, Reconciler, ReconcilerConfig};
pub use request::{ExecutionResult, Operation, RequestExecutor, RequestOptions};
pub use secret::{Secret, SecretGenerator};
pub use transport::{HttpTransport, ReqwestTransport};

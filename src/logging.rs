//! Logging setup for the provider binary.
//!
//! All logs go to **stderr**; stdout carries only the handshake line.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `debug`, `hemmer_provider_freeipa=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Show request-level logs from the FreeIPA client
//! RUST_LOG=hemmer_provider_freeipa::client=debug ./hemmer-provider-freeipa
//!
//! # Show every retry attempt after a create
//! RUST_LOG=hemmer_provider_freeipa::retry=debug ./hemmer-provider-freeipa
//! ```

use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LEVEL: &str = "info";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Initialize the global subscriber, defaulting to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_LEVEL);
}

/// Like [`init_logging`], with a custom default level for when `RUST_LOG`
/// is not set.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to initialize logging, returning false if a subscriber is already set.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(env_filter(DEFAULT_LEVEL))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}

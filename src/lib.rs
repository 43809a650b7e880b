//! Hemmer provider for FreeIPA hosts.
//!
//! Manages a single resource type, `freeipa_host`, by mapping its lifecycle
//! onto FreeIPA's JSON-RPC host methods (`host_add`, `host_mod`,
//! `host_show`, `host_del`).
//!
//! # Layout
//!
//! - [`host`]: the `freeipa_host` schema, plan and lifecycle callbacks
//! - [`client`]: the FreeIPA JSON-RPC session and the [`client::HostApi`] seam
//! - [`retry`]: bounded backoff for the read that follows a create
//! - [`config`]: provider configuration with `FREEIPA_*` fallbacks
//! - [`provider`]: [`FreeIpaProvider`], the [`ProviderService`] implementation
//! - [`server`]: the gRPC plugin server and handshake
//! - [`testing`]: a tester harness and an in-memory FreeIPA directory
//!
//! # Handshake Protocol
//!
//! On start the binary prints one line to stdout:
//!
//! ```text
//! HEMMER_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! Format: `HEMMER_PROVIDER|<protocol_version>|<address>`. Hemmer spawns the
//! provider as a subprocess and connects to that address over gRPC. Logs
//! go to stderr.
//!
//! # Provider Configuration
//!
//! ```text
//! provider "freeipa" {
//!   host     = "ipa.example.com"
//!   username = "admin"
//!   password = var.ipa_password
//! }
//!
//! resource "freeipa_host" "web" {
//!   fqdn        = "web01.example.com"
//!   description = "Web server"
//!   random      = true
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod server;
pub mod testing;
pub mod types;
pub mod validation;

/// Protocol types generated from `proto/provider.proto`.
#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated {
    tonic::include_proto!("hemmer.provider.v1");
}

pub use client::{HostApi, IpaClient, IpaError};
pub use config::ProviderConfig;
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::FreeIpaProvider;
pub use retry::RetryPolicy;
pub use schema::ProviderSchema;
pub use server::{serve, serve_on_listener, serve_with_options, ProviderService, ServeOptions};
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities,
    HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};

//! gRPC plugin server.
//!
//! [`ProviderService`] is the high-level trait the provider implements;
//! [`serve`] binds a local port, prints the handshake line and runs the
//! generated `Provider` service on top of it.
//!
//! # Signal Handling
//!
//! On SIGTERM or SIGINT the server stops accepting connections, waits up to
//! [`ServeOptions::shutdown_timeout`] for in-flight requests, then calls
//! [`ProviderService::stop`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ProviderError;
use crate::generated as pb;
use crate::schema::{has_errors, Block, Diagnostic, DiagnosticSeverity, ProviderSchema, Schema};
use crate::types::{
    ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};
use crate::validation::validate;

/// Trait the provider implements.
///
/// State and config values are plain [`serde_json::Value`]s; an absent value
/// on the wire arrives as `Value::Null`.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Return the provider configuration schema and every resource schema.
    fn schema(&self) -> ProviderSchema;

    /// Return provider metadata. Derived from the schema by default.
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.schema().resources.keys().cloned().collect(),
            capabilities: Default::default(),
        }
    }

    /// Validate the provider configuration against its schema.
    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(validate(&self.schema().provider, &config))
    }

    /// Configure the provider with credentials and settings.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Stop the provider gracefully.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Validate a resource configuration against the resource schema.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let schema = self.schema();
        let resource = schema
            .resources
            .get(resource_type)
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))?;
        Ok(validate(resource, &config))
    }

    /// Upgrade resource state from an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Plan changes for a resource. `proposed_state` is null for a destroy.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a new resource.
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError>;

    /// Read the current state of a resource.
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError>;

    /// Update an existing resource.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError>;

    /// Adopt existing infrastructure by identifier.
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let _ = id;
        Err(ProviderError::InvalidRequest(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }
}

/// Adapter from [`ProviderService`] to the generated gRPC trait.
pub(crate) struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
}

impl<P: ProviderService> ProviderGrpcService<P> {
    pub(crate) fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

fn decode(bytes: &[u8], field: &str) -> Result<Value, ProviderError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ProviderError::InvalidRequest(format!("{} is not valid JSON: {}", field, e)))
}

fn encode(value: &Value) -> Result<Vec<u8>, ProviderError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::to_vec(value)?)
}

/// Encoded state left behind by a failed create or update, or empty.
fn partial_state_bytes(err: &ProviderError) -> Vec<u8> {
    match err.partial_state().map(encode) {
        Some(Ok(state)) => {
            warn!("Returning partial state with error");
            state
        },
        Some(Err(e)) => {
            error!(error = %e, "Partial state could not be encoded");
            Vec::new()
        },
        None => Vec::new(),
    }
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<pb::Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| pb::Diagnostic {
            severity: match d.severity {
                DiagnosticSeverity::Error => pb::diagnostic::Severity::Error as i32,
                DiagnosticSeverity::Warning => pb::diagnostic::Severity::Warning as i32,
            },
            summary: d.summary,
            detail: d.detail.unwrap_or_default(),
            attribute: d.attribute.unwrap_or_default(),
        })
        .collect()
}

/// Render an error as a single error diagnostic. The detail carries the
/// underlying cause when there is one.
pub(crate) fn error_to_diagnostics(err: &ProviderError) -> Vec<pb::Diagnostic> {
    let err = err.cause();
    let mut diagnostic = Diagnostic::error(err.to_string());
    if let Some(source) = std::error::Error::source(err) {
        diagnostic = diagnostic.with_detail(source.to_string());
    }
    diagnostics_to_proto(vec![diagnostic])
}

fn schema_to_proto(schema: &Schema) -> pb::Schema {
    pb::Schema {
        version: schema.version as i64,
        block: Some(block_to_proto(&schema.block)),
    }
}

fn block_to_proto(block: &Block) -> pb::Block {
    pb::Block {
        attributes: block
            .attributes
            .iter()
            .map(|(name, attr)| pb::Attribute {
                name: name.clone(),
                r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
                required: attr.flags.required,
                optional: attr.flags.optional,
                computed: attr.flags.computed,
                sensitive: attr.flags.sensitive,
                description: attr.description.clone().unwrap_or_default(),
                force_new: attr.force_new,
                default_value: attr
                    .default
                    .as_ref()
                    .and_then(|v| serde_json::to_vec(v).ok())
                    .unwrap_or_default(),
            })
            .collect(),
        description: block.description.clone().unwrap_or_default(),
    }
}

fn log_diagnostics(operation: &str, diagnostics: &[Diagnostic]) {
    if has_errors(diagnostics) {
        warn!(diagnostics = diagnostics.len(), "{} completed with errors", operation);
    } else {
        info!("{} completed successfully", operation);
    }
}

#[tonic::async_trait]
impl<P: ProviderService> pb::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip(self, _request), name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: Request<pb::GetMetadataRequest>,
    ) -> Result<Response<pb::GetMetadataResponse>, Status> {
        let metadata = self.provider.metadata();
        debug!(resources = metadata.resources.len(), "GetMetadata completed");
        Ok(Response::new(pb::GetMetadataResponse {
            server_capabilities: Some(pb::ServerCapabilities {
                plan_destroy: metadata.capabilities.plan_destroy,
            }),
            resources: metadata.resources,
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: Request<pb::GetSchemaRequest>,
    ) -> Result<Response<pb::GetSchemaResponse>, Status> {
        let schema = self.provider.schema();
        debug!(resources = schema.resources.len(), "GetSchema completed");
        Ok(Response::new(pb::GetSchemaResponse {
            provider: Some(schema_to_proto(&schema.provider)),
            resources: schema
                .resources
                .iter()
                .map(|(name, resource)| (name.clone(), schema_to_proto(resource)))
                .collect(),
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, request), name = "grpc.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        request: Request<pb::ValidateProviderConfigRequest>,
    ) -> Result<Response<pb::ValidateProviderConfigResponse>, Status> {
        let req = request.into_inner();
        let result = match decode(&req.config, "config") {
            Ok(config) => self.provider.validate_provider_config(config).await,
            Err(e) => Err(e),
        };

        let diagnostics = match result {
            Ok(diagnostics) => {
                log_diagnostics("ValidateProviderConfig", &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "ValidateProviderConfig failed");
                error_to_diagnostics(&e)
            },
        };
        Ok(Response::new(pb::ValidateProviderConfigResponse { diagnostics }))
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: Request<pb::ConfigureRequest>,
    ) -> Result<Response<pb::ConfigureResponse>, Status> {
        let req = request.into_inner();
        let result = match decode(&req.config, "config") {
            Ok(config) => self.provider.configure(config).await,
            Err(e) => Err(e),
        };

        let diagnostics = match result {
            Ok(diagnostics) => {
                log_diagnostics("Configure", &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "Configure failed");
                error_to_diagnostics(&e)
            },
        };
        Ok(Response::new(pb::ConfigureResponse { diagnostics }))
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: Request<pb::StopRequest>,
    ) -> Result<Response<pb::StopResponse>, Status> {
        info!("Stop called");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                error!(error = %e, "Stop failed");
                e.to_string()
            },
        };
        Ok(Response::new(pb::StopResponse { error }))
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.validate_resource_config")]
    async fn validate_resource_config(
        &self,
        request: Request<pb::ValidateResourceConfigRequest>,
    ) -> Result<Response<pb::ValidateResourceConfigResponse>, Status> {
        let req = request.into_inner();
        let result = match decode(&req.config, "config") {
            Ok(config) => {
                self.provider
                    .validate_resource_config(&req.resource_type, config)
                    .await
            },
            Err(e) => Err(e),
        };

        let diagnostics = match result {
            Ok(diagnostics) => {
                log_diagnostics("ValidateResourceConfig", &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "ValidateResourceConfig failed");
                error_to_diagnostics(&e)
            },
        };
        Ok(Response::new(pb::ValidateResourceConfigResponse { diagnostics }))
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.upgrade_resource_state")]
    async fn upgrade_resource_state(
        &self,
        request: Request<pb::UpgradeResourceStateRequest>,
    ) -> Result<Response<pb::UpgradeResourceStateResponse>, Status> {
        let req = request.into_inner();
        let result = async {
            let state = decode(&req.raw_state, "raw_state")?;
            let upgraded = self
                .provider
                .upgrade_resource_state(&req.resource_type, req.version, state)
                .await?;
            encode(&upgraded)
        }
        .await;

        match result {
            Ok(upgraded_state) => {
                debug!(from_version = req.version, "UpgradeResourceState completed");
                Ok(Response::new(pb::UpgradeResourceStateResponse {
                    upgraded_state,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(version = req.version, error = %e, "UpgradeResourceState failed");
                Ok(Response::new(pb::UpgradeResourceStateResponse {
                    upgraded_state: vec![],
                    diagnostics: error_to_diagnostics(&e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.plan")]
    async fn plan(
        &self,
        request: Request<pb::PlanRequest>,
    ) -> Result<Response<pb::PlanResponse>, Status> {
        let req = request.into_inner();
        debug!(is_create = req.prior_state.is_empty(), "Plan called");

        let result = async {
            let prior_state = match decode(&req.prior_state, "prior_state")? {
                Value::Null => None,
                state => Some(state),
            };
            let proposed_state = decode(&req.proposed_state, "proposed_state")?;
            let config = decode(&req.config, "config")?;
            let plan = self
                .provider
                .plan(&req.resource_type, prior_state, proposed_state, config)
                .await?;
            let planned_state = encode(&plan.planned_state)?;
            Ok::<_, ProviderError>((plan, planned_state))
        }
        .await;

        match result {
            Ok((plan, planned_state)) => {
                info!(
                    changes = plan.changes.len(),
                    requires_replace = plan.requires_replace,
                    "Plan completed"
                );
                Ok(Response::new(pb::PlanResponse {
                    planned_state,
                    changes: plan.changes.into_iter().map(Into::into).collect(),
                    requires_replace: plan.requires_replace,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Plan failed");
                Ok(Response::new(pb::PlanResponse {
                    planned_state: vec![],
                    changes: vec![],
                    requires_replace: false,
                    diagnostics: error_to_diagnostics(&e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.create")]
    async fn create(
        &self,
        request: Request<pb::CreateRequest>,
    ) -> Result<Response<pb::CreateResponse>, Status> {
        let req = request.into_inner();
        let result = async {
            let planned_state = decode(&req.planned_state, "planned_state")?;
            let state = self
                .provider
                .create(&req.resource_type, planned_state)
                .await?;
            encode(&state)
        }
        .await;

        match result {
            Ok(state) => {
                info!("Create completed successfully");
                Ok(Response::new(pb::CreateResponse {
                    state,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Create failed");
                Ok(Response::new(pb::CreateResponse {
                    state: partial_state_bytes(&e),
                    diagnostics: error_to_diagnostics(&e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.read")]
    async fn read(
        &self,
        request: Request<pb::ReadRequest>,
    ) -> Result<Response<pb::ReadResponse>, Status> {
        let req = request.into_inner();
        let result = async {
            let current_state = decode(&req.current_state, "current_state")?;
            let state = self
                .provider
                .read(&req.resource_type, current_state)
                .await?;
            encode(&state)
        }
        .await;

        match result {
            Ok(state) => {
                debug!("Read completed successfully");
                Ok(Response::new(pb::ReadResponse {
                    state,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Read failed");
                Ok(Response::new(pb::ReadResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(&e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.update")]
    async fn update(
        &self,
        request: Request<pb::UpdateRequest>,
    ) -> Result<Response<pb::UpdateResponse>, Status> {
        let req = request.into_inner();
        let result = async {
            let prior_state = decode(&req.prior_state, "prior_state")?;
            let planned_state = decode(&req.planned_state, "planned_state")?;
            let state = self
                .provider
                .update(&req.resource_type, prior_state, planned_state)
                .await?;
            encode(&state)
        }
        .await;

        match result {
            Ok(state) => {
                info!("Update completed successfully");
                Ok(Response::new(pb::UpdateResponse {
                    state,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Update failed");
                Ok(Response::new(pb::UpdateResponse {
                    state: partial_state_bytes(&e),
                    diagnostics: error_to_diagnostics(&e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type), name = "grpc.delete")]
    async fn delete(
        &self,
        request: Request<pb::DeleteRequest>,
    ) -> Result<Response<pb::DeleteResponse>, Status> {
        let req = request.into_inner();
        let result = async {
            let current_state = decode(&req.current_state, "current_state")?;
            self.provider
                .delete(&req.resource_type, current_state)
                .await
        }
        .await;

        let diagnostics = match result {
            Ok(()) => {
                info!("Delete completed successfully");
                vec![]
            },
            Err(e) => {
                error!(error = %e, "Delete failed");
                error_to_diagnostics(&e)
            },
        };
        Ok(Response::new(pb::DeleteResponse { diagnostics }))
    }

    #[instrument(skip(self, request), fields(resource_type = %request.get_ref().resource_type, id = %request.get_ref().id), name = "grpc.import_resource_state")]
    async fn import_resource_state(
        &self,
        request: Request<pb::ImportResourceStateRequest>,
    ) -> Result<Response<pb::ImportResourceStateResponse>, Status> {
        let req = request.into_inner();
        let result = async {
            let imported = self
                .provider
                .import_resource(&req.resource_type, &req.id)
                .await?;
            imported
                .into_iter()
                .map(|r| -> Result<pb::ImportedResource, ProviderError> {
                    Ok(pb::ImportedResource {
                        state: encode(&r.state)?,
                        resource_type: r.resource_type,
                    })
                })
                .collect::<Result<Vec<_>, ProviderError>>()
        }
        .await;

        match result {
            Ok(imported) => {
                info!(imported_count = imported.len(), "ImportResourceState completed");
                Ok(Response::new(pb::ImportResourceStateResponse {
                    imported,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "ImportResourceState failed");
                Ok(Response::new(pb::ImportResourceStateResponse {
                    imported: vec![],
                    diagnostics: error_to_diagnostics(&e),
                }))
            },
        }
    }
}

/// Options for configuring the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// How long in-flight requests may take to drain after a shutdown
    /// signal. Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Wait for SIGTERM or SIGINT (CTRL+C on Windows).
///
/// If the handlers cannot be installed the error is logged and this never
/// resolves; the orchestrator can still kill the process.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return std::future::pending().await;
                },
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received CTRL+C, initiating graceful shutdown"),
            Err(e) => {
                error!(error = %e, "Failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            },
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<()>().await;
    }
}

/// Serve a provider on an ephemeral loopback port.
///
/// Prints `HEMMER_PROVIDER|<version>|<address>` to stdout once the port is
/// bound, then serves until a shutdown signal arrives.
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve a provider with custom options. See [`serve`].
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve_on_listener(provider, listener, options, wait_for_shutdown_signal()).await
}

/// Serve a provider on an already-bound listener until `shutdown` resolves.
pub async fn serve_on_listener<P, F>(
    provider: P,
    listener: TcpListener,
    options: ServeOptions,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: ProviderService,
    F: Future<Output = ()>,
{
    let addr: SocketAddr = listener.local_addr()?;
    println!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr);
    info!(address = %addr, "Provider server starting");

    let provider = Arc::new(provider);
    let service = pb::provider_server::ProviderServer::new(ProviderGrpcService::new(Arc::clone(
        &provider,
    )));

    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(
        Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::TcpListenerStream::new(listener),
                async {
                    let _ = drain_rx.await;
                },
            ),
    );

    // The timeout applies to draining only, never to normal operation.
    let finished = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            let _ = drain_tx.send(());
            match tokio::time::timeout(options.shutdown_timeout, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?options.shutdown_timeout, "Shutdown timeout exceeded, forcing shutdown");
                    server.abort();
                    Ok(Ok(()))
                },
            }
        },
    };

    match result {
        Ok(Ok(())) => info!("Server shutdown complete"),
        Ok(Err(e)) => {
            error!(error = %e, "Server error");
            return Err(e.into());
        },
        Err(e) => {
            error!(error = %e, "Server task failed");
            return Err(e.into());
        },
    }

    debug!("Calling provider stop()");
    if let Err(e) = provider.stop().await {
        warn!(error = %e, "Provider stop() returned error");
    }

    info!("Provider shutdown complete");
    Ok(())
}

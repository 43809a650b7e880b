use hemmer_provider_freeipa::{init_logging, serve, FreeIpaProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting FreeIPA provider");

    serve(FreeIpaProvider::new()).await
}

//! audio-relay: reverse-streaming proxy for conversation audio.

mod cache;
mod config;
mod error;
mod proxy;
mod server;
mod service;
mod validation;

use config::ProxyConfig;
use service::AudioService;

fn main() -> anyhow::Result<()> {
    // Determine config path
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            // Fall back to positional arg
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("AUDIO_RELAY_CONFIG").ok())
            .unwrap_or_else(|| "audio-relay.toml".to_string())
    };

    let config = ProxyConfig::load(&config_path)?;

    // Build the tokio runtime first; the tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = relay_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.listen_address(),
            upstream = %config.upstream.base_url,
            upstream_configured = config.upstream.has_credentials(),
            "Starting audio-relay"
        );

        run(config).await
    })
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let service = AudioService::start(config)?;
    let result = server::run(&service).await;
    service.shutdown();
    result
}

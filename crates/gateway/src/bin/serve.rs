//! Local entry point for the analyst gateway: reads `PORT` (default 8089)
//! and runs the axum server until terminated. Argument parsing, help text,
//! and exit-code mapping belong to the external CLI front-end, not here;
//! this binary exists only so the gateway can be run directly.

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::var("CLAUDE_DA_BIND_ADDR").ok();
    claude_da_gateway::run_gateway(addr.as_deref()).await
}

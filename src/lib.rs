pub mod agent_engine;
pub mod apps;
pub mod config;
pub mod device;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;

#[cfg(test)]
mod testing;

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();
}

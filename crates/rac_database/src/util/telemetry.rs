use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing
///
/// Reads `RUST_LOG`, defaulting to `info`. `json` switches the formatter for log shippers.
pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    if json {
        let logger = tracing_subscriber::fmt::layer().json();
        let collector = Registry::default().with(logger).with(env_filter);
        tracing::subscriber::set_global_default(collector)?;
    } else {
        let logger = tracing_subscriber::fmt::layer().compact();
        let collector = Registry::default().with(logger).with(env_filter);
        tracing::subscriber::set_global_default(collector)?;
    }
    Ok(())
}

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber: stderr plus an append-only log file.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(log_path: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let mut open_error = None;
    let file = log_path.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                open_error = Some(format!("cannot open log file {}: {}", path.display(), e));
                None
            }
        }
    });

    let subscriber = tracing_subscriber::Registry::default()
        .with(stderr)
        .with(file)
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(e) = open_error {
        tracing::warn!("[logging] {}, logging to stderr only", e);
    }
    Ok(())
}

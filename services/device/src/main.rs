use device::{MirrorInterpreter, SqliteStore, store};
use tracing_subscriber::EnvFilter;

fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let data_dir = dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("hotline")
        .join("device");
    std::fs::create_dir_all(&data_dir).unwrap();
    let cache = SqliteStore::open(&data_dir.join("device.sqlite3")).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to open schema cache: {e}");
        std::process::exit(1);
    });

    // Offline bootstrap: render the last-known-good schema if one is cached.
    match store::load_cached_schema(&cache) {
        Ok(Some(schema)) => {
            use device::Interpreter;
            let mut interpreter = MirrorInterpreter::new();
            match interpreter.interpret(&schema, false) {
                Ok(view) => tracing::info!(nodes = view.node_count, "rendered cached schema"),
                Err(e) => tracing::warn!(error = %e, "cached schema failed to render"),
            }
        }
        Ok(None) => tracing::info!("no cached schema, waiting for provisioning"),
        Err(e) => tracing::warn!(error = %e, "failed to load cached schema"),
    }

    tracing::info!("device core started");
}

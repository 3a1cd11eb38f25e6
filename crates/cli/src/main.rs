mod command;
mod settings;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tern_backend::{BackendError, create_backend};
use tern_sync::ChatStore;
use tracing_subscriber::EnvFilter;

use settings::SettingsStore;
use shell::{Shell, ShellError};

#[derive(Debug, Parser)]
#[command(name = "tern", version, about = "Terminal client for the chat backend")]
struct Args {
    /// Settings file (defaults to the user config directory)
    #[arg(long, env = "TERN_CONFIG")]
    config: Option<PathBuf>,

    /// Backend API root, e.g. http://localhost:8000/api/v1
    #[arg(long)]
    base_url: Option<String>,

    /// Model used for new messages
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to set up the backend client"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("interactive session ended with an error"))]
    Shell {
        stage: &'static str,
        source: ShellError,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    // Logs go to stderr so they never interleave with streamed replies on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let settings_store = Arc::new(match args.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    });
    let settings = (*settings_store.settings())
        .clone()
        .with_overrides(args.base_url, args.model);
    tracing::debug!(
        path = %settings_store.config_path().display(),
        base_url = %settings.base_url,
        model = %settings.default_model,
        "settings loaded"
    );

    let backend = create_backend(settings.backend_config()).context(BackendSnafu {
        stage: "create-backend",
    })?;
    let store = ChatStore::new(backend, settings.default_model.clone());

    Shell::new(store, settings_store, settings.default_model)
        .run()
        .await
        .context(ShellSnafu { stage: "run-shell" })
}

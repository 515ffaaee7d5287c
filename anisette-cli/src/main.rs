//! Developer CLI: drives a full anisette fetch against a server and prints
//! the resulting header set as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anisette_core::{
    AnisetteProvider, LegacyConsentPrompt, LocalEnvironment,
};
use clap::Parser;
use eyre::eyre;

mod consent;
mod file_store;

use consent::{AlwaysTrust, TerminalPrompt};
use file_store::FileStore;

#[derive(Parser)]
#[command(
    name = "anisette",
    about = "Fetch anisette headers from a provisioning server",
    version
)]
struct Args {
    /// Anisette server base URL, e.g. https://ani.sidestore.io
    server: String,

    /// Override the GSA service directory URL.
    #[arg(long)]
    lookup_url: Option<String>,

    /// Accept legacy (V1) servers without prompting. Risky; legacy servers
    /// are more likely to get accounts locked.
    #[arg(long)]
    trust_legacy: bool,

    /// Directory holding the identity store. Defaults to the platform data
    /// directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Locale reported to Apple.
    #[arg(long, default_value = "en_US")]
    locale: String,

    /// Time zone abbreviation reported to Apple.
    #[arg(long, default_value = "UTC")]
    time_zone: String,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let state_dir = match args.state_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| eyre!("no platform data directory; pass --state-dir"))?
            .join("anisette-kit"),
    };
    let store = Arc::new(FileStore::open(state_dir.join("identity.json"))?);

    let prompt: Arc<dyn LegacyConsentPrompt> = if args.trust_legacy {
        Arc::new(AlwaysTrust)
    } else {
        Arc::new(TerminalPrompt)
    };

    let mut builder = AnisetteProvider::builder(args.server, store)
        .consent_prompt(prompt)
        .local_environment(LocalEnvironment {
            locale: args.locale,
            time_zone: args.time_zone,
        });
    if let Some(url) = args.lookup_url {
        builder = builder.lookup_url(url);
    }
    let provider = builder.build();

    let headers = provider.fetch_anisette().await?;
    println!("{}", serde_json::to_string_pretty(&headers)?);
    Ok(())
}

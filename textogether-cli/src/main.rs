//! # textogether CLI
//!
//! Headless client for shared LaTeX documents served through a relay.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use textogether_types::Identity;

use crate::commands::ClientOptions;

#[derive(Parser)]
#[command(name = "textogether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Relay WebSocket root
    #[arg(long, env = "TEXTOGETHER_RELAY_URL", default_value = "ws://127.0.0.1:8787")]
    relay: String,

    /// Directory of the local durable cache
    #[arg(long, env = "TEXTOGETHER_CACHE_DIR", default_value = ".textogether")]
    cache_dir: PathBuf,

    /// Keep documents in memory only
    #[arg(long)]
    no_cache: bool,

    /// Display name shown to other participants
    #[arg(long, env = "TEXTOGETHER_NAME", default_value = "Anonymous")]
    name: String,

    /// Stable user id (random when omitted)
    #[arg(long, env = "TEXTOGETHER_USER_ID")]
    user_id: Option<String>,

    /// Seconds to wait for the relay before working offline
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Milliseconds to let peers catch us up after connecting
    #[arg(long, default_value_t = 500)]
    settle_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append text to the end of a document
    Append {
        /// Document id
        document: String,

        /// Text to append (a trailing newline is not added)
        text: String,
    },

    /// Print the converged text of a document
    Cat {
        /// Document id
        document: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Follow a document, printing text and presence as they change
    Tail {
        /// Document id
        document: String,
    },

    /// Delete the cached updates of a document
    ClearCache {
        /// Document id
        document: String,
    },
}

impl Cli {
    fn client_options(&self) -> ClientOptions {
        let identity = match &self.user_id {
            Some(id) => Identity::new(id.clone(), self.name.clone()),
            None => Identity {
                display_name: self.name.clone(),
                ..Identity::anonymous()
            },
        };
        ClientOptions {
            relay: self.relay.clone(),
            cache_dir: (!self.no_cache).then(|| self.cache_dir.clone()),
            identity,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            settle: Duration::from_millis(self.settle_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = cli.client_options();
    match cli.command {
        Commands::Append { document, text } => commands::append(&options, &document, &text).await,
        Commands::Cat { document, json } => commands::cat(&options, &document, json).await,
        Commands::Tail { document } => commands::tail(&options, &document).await,
        Commands::ClearCache { document } => commands::clear_cache(&options, &document),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_append() {
        let cli = Cli::try_parse_from([
            "textogether",
            "--name",
            "Ada",
            "--no-cache",
            "append",
            "paper",
            "\\section{A}",
        ])
        .unwrap();
        let options = cli.client_options();
        assert_eq!(options.identity.display_name, "Ada");
        assert!(options.cache_dir.is_none());
        assert!(matches!(
            cli.command,
            Commands::Append { ref document, .. } if document == "paper"
        ));
    }

    #[test]
    fn test_user_id_is_kept() {
        let cli = Cli::try_parse_from(["textogether", "--user-id", "u-1", "cat", "doc"]).unwrap();
        let options = cli.client_options();
        assert_eq!(options.identity.user_id, "u-1");
        assert_eq!(options.identity.display_name, "Anonymous");
    }
}

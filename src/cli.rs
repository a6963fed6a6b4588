// src/cli.rs

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "keypool-proxy",
    version,
    about = "Transparent multi-tenant reverse proxy for AI inference APIs with weighted key pooling",
    long_about = "A transparent reverse proxy for OpenAI-compatible, Gemini and Anthropic \
APIs. Requests are authenticated, assigned a credential from the group's \
weighted key pool, and streamed through; failing keys are blacklisted and \
periodically re-validated for recovery."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server (default when no subcommand is given)
    Serve,

    /// Re-encrypt stored key values under a different encryption key.
    /// Run only with the service stopped.
    MigrateKeys {
        /// Current encryption key; omit when the database holds plaintext
        #[arg(long)]
        from: Option<String>,

        /// New encryption key; omit to decrypt back to plaintext
        #[arg(long)]
        to: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

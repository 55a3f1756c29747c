use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "shellbox", version, about = "Sandboxed shell script execution service")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Serve the HTTP API.
    Start,
    Check {
        /// Output format: human (default) or json
        #[arg(long, default_value = "human")]
        format: String,
    },
    /// Run one script through the full pipeline and print the result.
    Run {
        script: String,

        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Challenge whose rules should score the run.
        #[arg(long)]
        challenge: Option<String>,
    },
    Version,
}

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "llmux", version, about = "Multi-tenant reverse proxy for LLM back ends")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', env = "LLMUX_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Override the auth directory from the config file.
    #[arg(long, env = "LLMUX_AUTH_DIR")]
    pub auth_dir: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    pub port: Option<u16>,
}

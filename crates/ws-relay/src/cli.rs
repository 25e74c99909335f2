use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ws-relay", version, about = "Bidirectional WebSocket relay")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Backend base URL, ws:// or wss:// (overrides config file setting)
    #[arg(long)]
    pub backend: Option<String>,

    /// Serve HTTPS/WSS instead of plain HTTP/WS
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate chain for the TLS listener (overrides config file setting)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the TLS listener (overrides config file setting)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
}

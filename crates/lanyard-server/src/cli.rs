use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "lanyard-server", about = "Lanyard real-time signaling server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/lanyard.toml")]
    pub config: String,

    /// Bind address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,
}

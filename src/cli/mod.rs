mod hook;
mod init;
mod serve;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::errors::Result;

#[derive(Debug, Parser)]
#[command(
    name = "hookgate",
    version,
    about = "Local pre/post-mutation hook server for version-control engines"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a config file with a freshly generated shared secret.
    Init(InitArgs),
    /// Run the hook server in the foreground.
    Serve,
    /// Notify the hook server; spawned by the version-control engine.
    Hook(HookArgs),
}

#[derive(Debug, Args, Clone)]
pub struct HookArgs {
    /// `pre`, `post`, or the engine's own hook name (`pre-receive`,
    /// `pretxnchangegroup`, `changegroup`, ...).
    pub hook_type: String,
    #[arg(long, default_value_t = 60)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Args, Clone, Default)]
pub struct InitArgs {
    #[arg(long, default_value_t = false)]
    pub force: bool,
    #[arg(long = "repository")]
    pub repositories: Vec<String>,
}

pub async fn dispatch() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => init::execute(args).await?,
        Command::Serve => serve::execute().await?,
        Command::Hook(args) => hook::execute(args).await?,
    }
    info!("command completed");
    Ok(())
}

use tracing::info;

use super::InitArgs;
use crate::{config, errors::Result, security::random_token};

pub async fn execute(args: InitArgs) -> Result<()> {
    let mut config = config::load().unwrap_or_default();

    if config.is_configured() && !args.force {
        println!("Shared secret already configured; pass --force to rotate it.");
    } else {
        config.shared_secret = Some(random_token());
        println!("Generated a new shared secret.");
    }

    for repository in args.repositories {
        if !config.repositories.contains(&repository) {
            config.repositories.push(repository);
        }
    }

    let path = config::save(&config)?;
    info!(path = %path.display(), "init completed");
    println!("Config saved at {}", path.display());
    println!("Start the server with `hookgate serve`.");
    Ok(())
}

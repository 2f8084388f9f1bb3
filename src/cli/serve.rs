use tracing::info;

use crate::{
    config, daemon,
    errors::{AppError, Result},
};

pub async fn execute() -> Result<()> {
    let config = config::load()?;
    if !config.is_configured() {
        return Err(AppError::NotConfigured);
    }

    info!("starting hookgate server (foreground)");
    daemon::run(config).await
}

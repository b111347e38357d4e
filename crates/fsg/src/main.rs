use std::sync::Arc;

use fsg_core::config::ConfigHandle;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), fsg_core::Error> {
    fsg_core::logging::init("fsg")?;

    let config = Arc::new(ConfigHandle::load()?);
    {
        let cfg = config.current();
        info!(
            "[BOOT] admins={} auto_delete={}m token_verification={}",
            cfg.admins.len(),
            cfg.auto_delete_minutes,
            cfg.token_verification_enabled
        );
    }

    fsg_telegram::router::run_polling(config)
        .await
        .map_err(|e| fsg_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}

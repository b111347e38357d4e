use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{config::ConfigHandle, domain::ChatId, store::Collection, Result};

/// Per-destination settings (`chat_settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete_minutes: Option<u32>,
}

/// Retention window lookup: per-destination override, else the global
/// `AUTO_DELETE`. `0` means "never delete".
pub struct RetentionPolicies {
    settings: Collection<ChatSettings>,
    config: Arc<ConfigHandle>,
}

impl RetentionPolicies {
    pub fn new(data_dir: &Path, config: Arc<ConfigHandle>) -> Self {
        Self {
            settings: Collection::open(data_dir, "chat_settings"),
            config,
        }
    }

    pub fn global_minutes(&self) -> u32 {
        self.config.current().auto_delete_minutes
    }

    pub async fn override_for(&self, dest: ChatId) -> Option<u32> {
        match self.settings.get(&dest.0.to_string()).await {
            Ok(s) => s.and_then(|s| s.auto_delete_minutes),
            Err(e) => {
                warn!("[RETENTION] settings for {} unreadable, using default: {e}", dest.0);
                None
            }
        }
    }

    pub async fn minutes_for(&self, dest: ChatId) -> u32 {
        self.override_for(dest)
            .await
            .unwrap_or_else(|| self.global_minutes())
    }

    pub async fn set(&self, dest: ChatId, minutes: u32) -> Result<()> {
        self.settings
            .upsert(&dest.0.to_string(), |cur| {
                let mut s = cur.unwrap_or_default();
                s.auto_delete_minutes = Some(minutes);
                Some(s)
            })
            .await?;
        info!("[RETENTION] {} -> {minutes} min", dest.0);
        Ok(())
    }

    /// Drop the override so the global default applies again.
    pub async fn clear(&self, dest: ChatId) -> Result<bool> {
        let mut had = false;
        self.settings
            .upsert(&dest.0.to_string(), |cur| {
                let mut s = cur?;
                had = s.auto_delete_minutes.take().is_some();
                (s != ChatSettings::default()).then_some(s)
            })
            .await?;
        Ok(had)
    }

    pub(crate) fn collection(&self) -> &Collection<ChatSettings> {
        &self.settings
    }
}

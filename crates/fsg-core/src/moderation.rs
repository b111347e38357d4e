use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{clock::Clock, domain::UserId, store::Collection, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanEntry {
    pub banned_at: i64,
}

/// Users refused at the gate (`banned_users.json`).
pub struct BanList {
    entries: Collection<BanEntry>,
}

impl BanList {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            entries: Collection::open(data_dir, "banned_users"),
        }
    }

    /// Unreadable storage counts as "not banned"; the token gate still applies.
    pub async fn is_banned(&self, user: UserId) -> bool {
        match self.entries.get(&user.0.to_string()).await {
            Ok(hit) => hit.is_some(),
            Err(e) => {
                warn!("[BAN] ban list unreadable: {e}");
                false
            }
        }
    }

    /// `false` when the user was already banned.
    pub async fn ban(&self, user: UserId, clock: &dyn Clock) -> Result<bool> {
        let now = clock.unix_now();
        let mut added = false;
        self.entries
            .upsert(&user.0.to_string(), |cur| {
                added = cur.is_none();
                Some(cur.unwrap_or(BanEntry { banned_at: now }))
            })
            .await?;
        if added {
            info!("[BAN] banned {}", user.0);
        }
        Ok(added)
    }

    pub async fn unban(&self, user: UserId) -> Result<bool> {
        let removed = self.entries.remove(&user.0.to_string()).await?.is_some();
        if removed {
            info!("[BAN] unbanned {}", user.0);
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<UserId>> {
        let mut ids: Vec<UserId> = self
            .entries
            .entries()
            .await?
            .into_iter()
            .filter_map(|(k, _)| k.parse().ok().map(UserId))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub(crate) fn collection(&self) -> &Collection<BanEntry> {
        &self.entries
    }
}

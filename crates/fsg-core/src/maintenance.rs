//! Admin maintenance: backup-and-sweep cleanup and status counts.

use std::{path::PathBuf, sync::Arc};

use tracing::{info, warn};

use crate::{
    gateway::Gateway,
    resolver::PurgeReport,
    utils::{backup_stamp, format_minutes},
    Result,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub backup_dir: PathBuf,
    pub backed_up: Vec<PathBuf>,
    pub tokens_swept: usize,
    pub tokens_kept: usize,
    /// `None` when the local index was kept (no remote index to recover from).
    pub index_purged: Option<PurgeReport>,
    pub pending_deletions_kept: usize,
}

impl CleanupReport {
    pub fn summary(&self) -> String {
        let index = match self.index_purged {
            Some(p) => format!(
                "Local index purged: {} files, {} batches ({} unpublished kept)",
                p.files, p.batches, p.kept_local_only
            ),
            None => "Local index kept (no remote index configured)".to_string(),
        };
        format!(
            "Cleanup complete.\n\nBackup: {}\nExpired tokens removed: {}\nActive tokens kept: {}\n{index}\nPending deletions kept: {}",
            self.backup_dir.display(),
            self.tokens_swept,
            self.tokens_kept,
            self.pending_deletions_kept
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub live_tokens: usize,
    pub files: usize,
    pub batches: usize,
    pub pending_deletions: usize,
    pub armed_timers: usize,
    pub banned: usize,
    pub verification_enabled: bool,
    pub auto_delete_minutes: u32,
}

impl StatusReport {
    pub fn summary(&self) -> String {
        let auto_delete = if self.auto_delete_minutes == 0 {
            "off".to_string()
        } else {
            format_minutes(self.auto_delete_minutes)
        };
        format!(
            "Status\n\nToken verification: {}\nLive tokens: {}\nFiles: {}\nBatches: {}\nAuto-delete: {auto_delete}\nPending deletions: {} ({} armed)\nBanned users: {}",
            if self.verification_enabled { "on" } else { "off" },
            self.live_tokens,
            self.files,
            self.batches,
            self.pending_deletions,
            self.armed_timers,
            self.banned
        )
    }
}

pub struct Maintenance {
    gateway: Arc<Gateway>,
}

impl Maintenance {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Back up every collection, sweep expired tokens, purge the local index
    /// when the remote index can rebuild it. Pending deletions are untouched.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let g = &self.gateway;
        let cfg = g.config().current();
        let backup_dir = cfg
            .data_dir
            .join("backups")
            .join(backup_stamp(g.clock().now()));

        let mut backed_up = Vec::new();
        let copies = [
            g.ledger().collection().backup_to(&backup_dir).await?,
            g.resolver().files().backup_to(&backup_dir).await?,
            g.resolver().batches().backup_to(&backup_dir).await?,
            g.scheduler().collection().backup_to(&backup_dir).await?,
            g.retention().collection().backup_to(&backup_dir).await?,
            g.bans().collection().backup_to(&backup_dir).await?,
        ];
        backed_up.extend(copies.into_iter().flatten());

        let tokens_swept = g.ledger().sweep_expired().await?;
        let tokens_kept = g.ledger().live_count().await?;

        let index_purged = if g.resolver().has_remote() {
            Some(g.resolver().purge_local().await?)
        } else {
            warn!("[MAINT] no remote index configured, keeping the local index");
            None
        };

        let pending_deletions_kept = g.scheduler().pending().await?.len();

        let report = CleanupReport {
            backup_dir,
            backed_up,
            tokens_swept,
            tokens_kept,
            index_purged,
            pending_deletions_kept,
        };
        info!(
            "[MAINT] cleanup done: backup {}, {} tokens swept",
            report.backup_dir.display(),
            report.tokens_swept
        );
        Ok(report)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let g = &self.gateway;
        let cfg = g.config().current();
        Ok(StatusReport {
            live_tokens: g.ledger().live_count().await?,
            files: g.resolver().files().len().await?,
            batches: g.resolver().batches().len().await?,
            pending_deletions: g.scheduler().pending().await?.len(),
            armed_timers: g.scheduler().armed_count().await,
            banned: g.bans().list().await?.len(),
            verification_enabled: cfg.token_verification_enabled,
            auto_delete_minutes: cfg.auto_delete_minutes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration;

    use super::*;
    use crate::{
        clock::ManualClock,
        domain::{ChatId, MessageId, MessageRef},
        gateway::GatewayDeps,
        index::RemoteIndex,
        links::LinkBuilder,
        records::{ContentRecord, MediaKind},
        resolver::Resolution,
        testkit::{config_handle, tmp_dir, MemoryIndex, RecordingDelivery, RecordingNotifier},
        tokens::Subject,
    };

    fn gateway(dir: &std::path::Path, clock: Arc<ManualClock>, remote: Option<Arc<dyn RemoteIndex>>) -> Arc<Gateway> {
        Arc::new(Gateway::new(GatewayDeps {
            config: config_handle(dir, &[]),
            clock,
            links: LinkBuilder::new("share_bot"),
            delivery: Arc::new(RecordingDelivery::default()),
            remote,
            notifier: Arc::new(RecordingNotifier::default()),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_backs_up_sweeps_and_purges_recoverable_index() {
        let dir = tmp_dir("fsg-maint-cleanup");
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let remote = Arc::new(MemoryIndex::default());
        let g = gateway(&dir, clock.clone(), Some(remote.clone()));

        let old = g.ledger().issue(Subject::Anyone).await.unwrap();
        clock.advance(Duration::hours(23));
        let fresh = g.ledger().issue(Subject::Anyone).await.unwrap();
        clock.advance(Duration::hours(2));

        let r = ContentRecord::new(MessageRef::new(-100, 1), None, MediaKind::Audio, 1);
        g.resolver().register(r.clone()).await.unwrap().wait().await;
        g.scheduler().schedule(ChatId(1), MessageId(2), 30).await.unwrap();

        let report = Maintenance::new(g.clone()).cleanup().await.unwrap();
        assert_eq!(report.tokens_swept, 1);
        assert_eq!(report.tokens_kept, 1);
        assert_eq!(
            report.index_purged,
            Some(PurgeReport {
                files: 1,
                batches: 0,
                kept_local_only: 0,
            })
        );
        assert_eq!(report.pending_deletions_kept, 1);
        assert!(report.backup_dir.join("tokens.json").exists());
        assert!(report.backup_dir.join("files.json").exists());
        assert!(report.summary().contains("Pending deletions kept: 1"));

        assert!(g.ledger().current_open_token().await.unwrap().is_some_and(|t| t.id == fresh.id));
        assert_ne!(old.id, fresh.id);
        // Purged locally, still resolvable through the remote tier.
        assert_eq!(g.resolver().files().len().await.unwrap(), 0);
        assert!(matches!(g.resolver().resolve(&r.id).await, Resolution::File(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cleanup_keeps_records_that_never_reached_the_remote_index() {
        let dir = tmp_dir("fsg-maint-unpublished");
        let remote = Arc::new(MemoryIndex::default());
        remote.fail_publishes(true);
        let g = gateway(&dir, Arc::new(ManualClock::at_unix(1_700_000_000)), Some(remote.clone()));

        let r = ContentRecord::new(MessageRef::new(-100, 1), None, MediaKind::Video, 1);
        assert_eq!(g.resolver().register(r.clone()).await.unwrap().wait().await, None);

        let report = Maintenance::new(g.clone()).cleanup().await.unwrap();
        let purged = report.index_purged.unwrap();
        assert_eq!(purged.files, 0);
        assert_eq!(purged.kept_local_only, 1);
        assert!(report.summary().contains("1 unpublished kept"));
        assert_eq!(g.resolver().resolve(&r.id).await, Resolution::File(r));
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cleanup_keeps_the_only_copy_of_the_index() {
        let dir = tmp_dir("fsg-maint-local-only");
        let g = gateway(&dir, Arc::new(ManualClock::at_unix(1_700_000_000)), None);
        let r = ContentRecord::new(MessageRef::new(-100, 1), None, MediaKind::Audio, 1);
        g.resolver().register(r.clone()).await.unwrap();

        let report = Maintenance::new(g.clone()).cleanup().await.unwrap();
        assert_eq!(report.index_purged, None);
        assert_eq!(g.resolver().files().len().await.unwrap(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn status_counts() {
        let dir = tmp_dir("fsg-maint-status");
        let g = gateway(&dir, Arc::new(ManualClock::at_unix(1_700_000_000)), None);
        g.ledger().refresh_if_needed().await.unwrap();
        g.bans().ban(crate::domain::UserId(3), g.clock().as_ref()).await.unwrap();

        let status = Maintenance::new(g.clone()).status().await.unwrap();
        assert_eq!(status.live_tokens, 1);
        assert_eq!(status.banned, 1);
        assert!(status.verification_enabled);
        assert!(status.summary().contains("Auto-delete: off"));
        let _ = fs::remove_dir_all(&dir);
    }
}

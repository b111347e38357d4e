//! Token ledger: issuance, verification and single-writer refresh of access
//! tokens.
//!
//! Persisted as `tokens.json`: `{ "<token>": { "user_id": 0, "expiry": 1700000000 } }`.
//! A `user_id` of `0` is the open-access sentinel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{from_unix, Clock},
    config::ConfigHandle,
    domain::UserId,
    errors::Error,
    links::LinkBuilder,
    notify::{Notifier, TokenNotice},
    records::new_record_id,
    store::Collection,
    utils::{fingerprint, human_time},
    Result,
};

const OPEN_ACCESS: i64 = 0;

/// Principal a token authorizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Subject {
    /// Open-access grant, valid for any user.
    Anyone,
    User(UserId),
}

impl Subject {
    pub fn admits(&self, user: UserId) -> bool {
        match self {
            Subject::Anyone => true,
            Subject::User(u) => *u == user,
        }
    }
}

impl From<i64> for Subject {
    fn from(v: i64) -> Self {
        if v == OPEN_ACCESS {
            Subject::Anyone
        } else {
            Subject::User(UserId(v))
        }
    }
}

impl From<Subject> for i64 {
    fn from(s: Subject) -> Self {
        match s {
            Subject::Anyone => OPEN_ACCESS,
            Subject::User(u) => u.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StoredToken {
    user_id: Subject,
    expiry: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub id: String,
    pub subject: Subject,
    pub expiry: DateTime<Utc>,
}

impl AccessToken {
    fn from_stored(id: String, stored: StoredToken) -> Self {
        Self {
            id,
            subject: stored.user_id,
            expiry: from_unix(stored.expiry),
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}

/// Outcome of `TokenLedger::verify`. Verification never fails with an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    Valid(Subject),
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A live open-access token above the low-water mark already exists.
    Kept(AccessToken),
    Issued(AccessToken),
}

pub struct TokenLedger {
    tokens: Collection<StoredToken>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigHandle>,
    links: LinkBuilder,
    notifier: Arc<dyn Notifier>,
    // Serializes the check-then-issue of `refresh_if_needed`.
    refresh_lock: Mutex<()>,
}

impl TokenLedger {
    pub fn new(
        config: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
        links: LinkBuilder,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let data_dir = config.current().data_dir.clone();
        Self {
            tokens: Collection::open(&data_dir, "tokens"),
            clock,
            config,
            links,
            notifier,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Create and persist a token for `subject`, then announce it.
    pub async fn issue(&self, subject: Subject) -> Result<AccessToken> {
        let cfg = self.config.current();
        let expiry = chrono::Duration::from_std(cfg.token_duration)
            .ok()
            .and_then(|d| self.clock.now().checked_add_signed(d))
            .ok_or_else(|| {
                Error::Config(format!(
                    "TOKEN_DURATION of {}s is out of range",
                    cfg.token_duration.as_secs()
                ))
            })?;

        let id = new_record_id();
        self.tokens
            .insert(
                &id,
                StoredToken {
                    user_id: subject,
                    expiry: expiry.timestamp(),
                },
            )
            .await?;

        let token = AccessToken {
            id,
            subject,
            expiry: from_unix(expiry.timestamp()),
        };
        info!(
            "[TOKEN] issued {} for {:?}, expires {}",
            fingerprint(&token.id),
            subject,
            human_time(token.expiry)
        );

        let notice = TokenNotice {
            token_id: token.id.clone(),
            redemption: self.links.redemption_link(&token.id),
            expiry: token.expiry,
            open_access: subject == Subject::Anyone,
        };
        if let Err(e) = self.notifier.notify(&notice).await {
            warn!("[TOKEN] notify failed for {}: {e}", fingerprint(&token.id));
        }

        Ok(token)
    }

    /// Look a token up. Expired tokens are deleted on the way out.
    pub async fn verify(&self, token_id: &str) -> Verification {
        let fp = fingerprint(token_id);
        let stored = match self.tokens.get(token_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                info!("[TOKEN] {fp} not found");
                return Verification::Invalid;
            }
            Err(e) => {
                error!("[TOKEN] storage unavailable while verifying {fp}: {e}");
                return Verification::Invalid;
            }
        };

        let now = self.clock.unix_now();
        if stored.expiry <= now {
            info!("[TOKEN] {fp} expired, removing");
            // The record is immutable; a concurrent sweep may already have
            // removed it, which is the same outcome.
            if let Err(e) = self.tokens.remove(token_id).await {
                warn!("[TOKEN] failed to remove expired {fp}: {e}");
            }
            return Verification::Invalid;
        }

        debug!("[TOKEN] {fp} valid");
        Verification::Valid(stored.user_id)
    }

    /// True if any live token names `user` or is open-access.
    pub async fn has_valid_grant(&self, user: UserId) -> bool {
        let now = self.clock.unix_now();
        match self.tokens.entries().await {
            Ok(entries) => entries
                .iter()
                .any(|(_, t)| t.expiry > now && t.user_id.admits(user)),
            Err(e) => {
                error!("[TOKEN] storage unavailable, denying {}: {e}", user.0);
                false
            }
        }
    }

    /// Live open-access token with the latest expiry.
    pub async fn current_open_token(&self) -> Result<Option<AccessToken>> {
        let now = self.clock.unix_now();
        let best = self
            .tokens
            .entries()
            .await?
            .into_iter()
            .filter(|(_, t)| t.user_id == Subject::Anyone && t.expiry > now)
            .max_by_key(|(_, t)| t.expiry);
        Ok(best.map(|(id, t)| AccessToken::from_stored(id, t)))
    }

    /// Issue a fresh open-access token unless one with more than the low-water
    /// mark of validity left already exists.
    pub async fn refresh_if_needed(&self) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;
        let low_water = self.config.current().token_low_water.as_secs() as i64;

        if let Some(current) = self.current_open_token().await? {
            let remaining = current.expiry.timestamp() - self.clock.unix_now();
            if remaining > low_water {
                debug!(
                    "[TOKEN] keeping {} ({}s left)",
                    fingerprint(&current.id),
                    remaining
                );
                return Ok(RefreshOutcome::Kept(current));
            }
            info!(
                "[TOKEN] {} below low-water mark ({}s left), rotating",
                fingerprint(&current.id),
                remaining
            );
        }

        Ok(RefreshOutcome::Issued(self.issue(Subject::Anyone).await?))
    }

    /// Remove every expired token. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.unix_now();
        let removed = self.tokens.retain(|_, t| t.expiry > now).await?;
        if removed > 0 {
            info!("[TOKEN] swept {removed} expired tokens");
        }
        Ok(removed)
    }

    pub async fn live_count(&self) -> Result<usize> {
        let now = self.clock.unix_now();
        Ok(self
            .tokens
            .entries()
            .await?
            .iter()
            .filter(|(_, t)| t.expiry > now)
            .count())
    }

    pub(crate) fn collection(&self) -> &Collection<StoredToken> {
        &self.tokens
    }

    /// Run `refresh_if_needed` now and then every `TOKEN_REFRESH_INTERVAL`.
    pub fn spawn_refresh_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let ledger = self.clone();
        let period = self.config.current().token_refresh_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = ledger.refresh_if_needed().await {
                            error!("[TOKEN] refresh failed: {e}");
                        }
                    }
                }
            }
            debug!("[TOKEN] refresh loop stopped");
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
        testkit::{config_handle, tmp_dir, RecordingNotifier},
    };

    struct Fixture {
        ledger: Arc<TokenLedger>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        dir: std::path::PathBuf,
    }

    fn fixture(prefix: &str, vars: &[(&str, &str)]) -> Fixture {
        let dir = tmp_dir(prefix);
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = Arc::new(TokenLedger::new(
            config_handle(&dir, vars),
            clock.clone(),
            LinkBuilder::new("share_bot"),
            notifier.clone(),
        ));
        Fixture {
            ledger,
            clock,
            notifier,
            dir,
        }
    }

    #[tokio::test]
    async fn open_token_valid_at_30_minutes_and_gone_after_61() {
        let f = fixture(
            "fsg-tokens-expiry",
            &[("TOKEN_DURATION", "1"), ("TOKEN_LOW_WATER_MINUTES", "30")],
        );
        let t = f.ledger.issue(Subject::Anyone).await.unwrap();

        f.clock.advance(Duration::minutes(30));
        assert_eq!(
            f.ledger.verify(&t.id).await,
            Verification::Valid(Subject::Anyone)
        );

        f.clock.advance(Duration::minutes(31));
        assert_eq!(f.ledger.verify(&t.id).await, Verification::Invalid);
        assert!(f.ledger.collection().get(&t.id).await.unwrap().is_none());

        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn expiry_boundary_is_invalid() {
        let f = fixture("fsg-tokens-boundary", &[]);
        let t = f.ledger.issue(Subject::Anyone).await.unwrap();
        f.clock.set(t.expiry);
        assert_eq!(f.ledger.verify(&t.id).await, Verification::Invalid);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let f = fixture("fsg-tokens-unknown", &[]);
        assert_eq!(f.ledger.verify("nope").await, Verification::Invalid);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_issue_exactly_one_open_token() {
        let f = fixture("fsg-tokens-single-writer", &[]);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = f.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.refresh_if_needed().await.unwrap()
            }));
        }
        let mut issued = 0;
        for h in handles {
            if matches!(h.await.unwrap(), RefreshOutcome::Issued(_)) {
                issued += 1;
            }
        }
        assert_eq!(issued, 1);
        assert_eq!(f.ledger.live_count().await.unwrap(), 1);
        assert_eq!(f.notifier.notices().len(), 1);

        assert!(matches!(
            f.ledger.refresh_if_needed().await.unwrap(),
            RefreshOutcome::Kept(_)
        ));
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn refresh_rotates_below_low_water_mark() {
        let f = fixture("fsg-tokens-rotate", &[]);
        let first = match f.ledger.refresh_if_needed().await.unwrap() {
            RefreshOutcome::Issued(t) => t,
            other => panic!("expected issue, got {other:?}"),
        };

        // 24h duration, 60m low water: at 23h01m only 59m remain.
        f.clock.advance(Duration::hours(23) + Duration::minutes(1));
        let second = match f.ledger.refresh_if_needed().await.unwrap() {
            RefreshOutcome::Issued(t) => t,
            other => panic!("expected rotation, got {other:?}"),
        };
        assert_ne!(first.id, second.id);

        // The newest open token is the one handed out.
        let current = f.ledger.current_open_token().await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn grants_match_user_or_open_access() {
        let f = fixture("fsg-tokens-grants", &[]);
        f.ledger.issue(Subject::User(UserId(5))).await.unwrap();
        assert!(f.ledger.has_valid_grant(UserId(5)).await);
        assert!(!f.ledger.has_valid_grant(UserId(6)).await);

        f.ledger.issue(Subject::Anyone).await.unwrap();
        assert!(f.ledger.has_valid_grant(UserId(6)).await);

        f.clock.advance(Duration::hours(25));
        assert!(!f.ledger.has_valid_grant(UserId(5)).await);
        assert_eq!(f.ledger.sweep_expired().await.unwrap(), 2);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn issue_announces_the_redemption_link() {
        let f = fixture("fsg-tokens-notify", &[]);
        let t = f.ledger.issue(Subject::Anyone).await.unwrap();
        let notices = f.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].redemption,
            format!("https://t.me/share_bot?start=verify_{}", t.id)
        );
        assert!(notices[0].open_access);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn unreadable_store_fails_closed() {
        let f = fixture("fsg-tokens-corrupt", &[]);
        let t = f.ledger.issue(Subject::Anyone).await.unwrap();
        fs::write(f.ledger.collection().path(), "{broken").unwrap();

        assert_eq!(f.ledger.verify(&t.id).await, Verification::Invalid);
        assert!(!f.ledger.has_valid_grant(UserId(1)).await);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[test]
    fn subject_uses_zero_as_open_access_on_disk() {
        let json = serde_json::to_string(&StoredToken {
            user_id: Subject::Anyone,
            expiry: 10,
        })
        .unwrap();
        assert_eq!(json, r#"{"user_id":0,"expiry":10}"#);
        let back: StoredToken = serde_json::from_str(r#"{"user_id":77,"expiry":10}"#).unwrap();
        assert_eq!(back.user_id, Subject::User(UserId(77)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_issues_on_startup_and_stops_on_cancel() {
        let f = fixture("fsg-tokens-loop", &[]);
        let cancel = CancellationToken::new();
        let handle = f.ledger.spawn_refresh_loop(cancel.clone());

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(f.ledger.live_count().await.unwrap(), 1);

        // Later ticks keep the existing token.
        tokio::time::sleep(std::time::Duration::from_secs(31 * 60)).await;
        assert_eq!(f.ledger.live_count().await.unwrap(), 1);

        cancel.cancel();
        handle.await.unwrap();
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn out_of_range_duration_is_an_error_not_a_panic() {
        let dir = tmp_dir("fsg-tokens-overflow");
        let mut cfg = crate::testkit::test_config(&dir, &[]);
        cfg.token_duration = std::time::Duration::from_secs(360_000_000_000_000);
        let ledger = TokenLedger::new(
            Arc::new(ConfigHandle::new(cfg)),
            Arc::new(ManualClock::at_unix(1_700_000_000)),
            LinkBuilder::new("share_bot"),
            Arc::new(RecordingNotifier::default()),
        );

        assert!(matches!(
            ledger.refresh_if_needed().await,
            Err(Error::Config(_))
        ));
        assert_eq!(ledger.live_count().await.unwrap(), 0);
        let _ = fs::remove_dir_all(&dir);
    }
}

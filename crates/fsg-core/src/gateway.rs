//! Request flow for `/start`: ban check, token gate, resolution, delivery and
//! retention.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    clock::Clock,
    config::ConfigHandle,
    deletion::DeletionScheduler,
    delivery::port::DeliveryPort,
    domain::{ChatId, MessageRef, UserId},
    index::RemoteIndex,
    ingest::Ingestor,
    links::{LinkBuilder, StartPayload},
    moderation::BanList,
    notify::Notifier,
    records::ContentRecord,
    resolver::{ReferenceResolver, Resolution},
    retention::RetentionPolicies,
    tokens::{Subject, TokenLedger, Verification},
    utils::{fingerprint, format_minutes},
};

/// What happened to a `/start` request. Rendered for the requester with
/// `message()`; internal errors never appear in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessOutcome {
    Banned,
    /// Bare `/start`. `redemption` is set when the user still needs a token.
    Welcome { redemption: Option<String> },
    TokenAccepted,
    TokenRejected,
    NeedsToken { redemption: String },
    InvalidLink,
    NotFound,
    Delivered {
        delivered: usize,
        missing: usize,
        auto_delete_minutes: u32,
    },
    /// The gate itself could not be evaluated.
    Unavailable,
}

impl AccessOutcome {
    /// Reply text, if the outcome warrants one.
    pub fn message(&self) -> Option<String> {
        let text = match self {
            AccessOutcome::Banned => "You are banned from using this bot.".to_string(),
            AccessOutcome::Welcome { redemption: None } => {
                "Welcome! Open a shared link to receive its files.\n\n/help - Show help".to_string()
            }
            AccessOutcome::Welcome {
                redemption: Some(link),
            } => format!(
                "Welcome! Open a shared link to receive its files.\n\n\
                 You need to verify access first. Get a token here:\n{link}"
            ),
            AccessOutcome::TokenAccepted => {
                "Token verified. You now have access to shared files.".to_string()
            }
            AccessOutcome::TokenRejected => {
                "Invalid or expired token. Please get a new token.".to_string()
            }
            AccessOutcome::NeedsToken { redemption } => format!(
                "You need to verify access to use this bot.\n\nGet an access token here:\n{redemption}"
            ),
            AccessOutcome::InvalidLink => "This link is not valid.".to_string(),
            AccessOutcome::NotFound => "File or batch not found.".to_string(),
            AccessOutcome::Delivered {
                delivered: 0,
                missing: 0,
                ..
            } => "This batch is empty.".to_string(),
            AccessOutcome::Delivered {
                delivered: 0,
                missing,
                ..
            } => format!("Sorry, none of the {missing} requested files could be delivered."),
            AccessOutcome::Delivered { missing: 0, .. } => return None,
            AccessOutcome::Delivered {
                delivered, missing, ..
            } => format!(
                "Delivered {delivered} files. {missing} could not be found or sent."
            ),
            AccessOutcome::Unavailable => {
                "Something went wrong. Please try again later.".to_string()
            }
        };
        Some(text)
    }
}

/// External collaborators the gateway is built from.
pub struct GatewayDeps {
    pub config: Arc<ConfigHandle>,
    pub clock: Arc<dyn Clock>,
    pub links: LinkBuilder,
    pub delivery: Arc<dyn DeliveryPort>,
    pub remote: Option<Arc<dyn RemoteIndex>>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Gateway {
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    links: LinkBuilder,
    delivery: Arc<dyn DeliveryPort>,
    ledger: Arc<TokenLedger>,
    resolver: Arc<ReferenceResolver>,
    retention: Arc<RetentionPolicies>,
    scheduler: DeletionScheduler,
    bans: Arc<BanList>,
    ingestor: Arc<Ingestor>,
}

impl Gateway {
    pub fn new(deps: GatewayDeps) -> Self {
        let GatewayDeps {
            config,
            clock,
            links,
            delivery,
            remote,
            notifier,
        } = deps;
        let data_dir = config.current().data_dir.clone();

        let ledger = Arc::new(TokenLedger::new(
            config.clone(),
            clock.clone(),
            links.clone(),
            notifier,
        ));
        let resolver = Arc::new(ReferenceResolver::new(&data_dir, remote));
        let retention = Arc::new(RetentionPolicies::new(&data_dir, config.clone()));
        let scheduler = DeletionScheduler::new(
            &data_dir,
            delivery.clone(),
            retention.clone(),
            clock.clone(),
        );
        let bans = Arc::new(BanList::new(&data_dir));
        let ingestor = Arc::new(Ingestor::new(resolver.clone(), clock.clone(), links.clone()));

        Self {
            config,
            clock,
            links,
            delivery,
            ledger,
            resolver,
            retention,
            scheduler,
            bans,
            ingestor,
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn links(&self) -> &LinkBuilder {
        &self.links
    }

    pub fn ledger(&self) -> &Arc<TokenLedger> {
        &self.ledger
    }

    pub fn resolver(&self) -> &Arc<ReferenceResolver> {
        &self.resolver
    }

    pub fn retention(&self) -> &Arc<RetentionPolicies> {
        &self.retention
    }

    pub fn scheduler(&self) -> &DeletionScheduler {
        &self.scheduler
    }

    pub fn bans(&self) -> &Arc<BanList> {
        &self.bans
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub async fn handle_start(
        &self,
        user: UserId,
        destination: ChatId,
        payload: Option<&str>,
    ) -> AccessOutcome {
        if self.bans.is_banned(user).await {
            info!("[GATE] refused banned user {}", user.0);
            return AccessOutcome::Banned;
        }

        let payload = payload.map(str::trim).filter(|p| !p.is_empty());
        let Some(raw) = payload else {
            return match self.gate(user).await {
                Ok(()) => AccessOutcome::Welcome { redemption: None },
                Err(AccessOutcome::NeedsToken { redemption }) => AccessOutcome::Welcome {
                    redemption: Some(redemption),
                },
                Err(other) => other,
            };
        };

        let id = match StartPayload::parse(raw) {
            StartPayload::Redeem(token) => return self.redeem(user, &token).await,
            StartPayload::Invalid => return AccessOutcome::InvalidLink,
            StartPayload::Fetch(id) => id,
        };

        if let Err(outcome) = self.gate(user).await {
            return outcome;
        }

        match self.resolver.resolve(&id).await {
            Resolution::NotFound => AccessOutcome::NotFound,
            Resolution::File(record) => self.deliver_all(destination, vec![record], 0).await,
            Resolution::Batch(batch) => {
                let res = self.resolver.resolve_members(&batch).await;
                self.deliver_all(destination, res.resolved, res.missing.len())
                    .await
            }
        }
    }

    async fn redeem(&self, user: UserId, token: &str) -> AccessOutcome {
        match self.ledger.verify(token).await {
            Verification::Valid(subject) if subject.admits(user) => {
                info!("[GATE] {} redeemed {}", user.0, fingerprint(token));
                AccessOutcome::TokenAccepted
            }
            Verification::Valid(_) => {
                info!("[GATE] {} presented a token issued to someone else", user.0);
                AccessOutcome::TokenRejected
            }
            Verification::Invalid => AccessOutcome::TokenRejected,
        }
    }

    // Ok(()) when the user may proceed.
    async fn gate(&self, user: UserId) -> Result<(), AccessOutcome> {
        let cfg = self.config.current();
        if !cfg.token_verification_enabled || self.ledger.has_valid_grant(user).await {
            return Ok(());
        }

        if let Some(url) = cfg.external_redemption_url() {
            return Err(AccessOutcome::NeedsToken {
                redemption: url.to_string(),
            });
        }

        match self.ledger.issue(Subject::User(user)).await {
            Ok(token) => Err(AccessOutcome::NeedsToken {
                redemption: self.links.redemption_link(&token.id),
            }),
            Err(e) => {
                warn!("[GATE] could not issue a token for {}: {e}", user.0);
                Err(AccessOutcome::Unavailable)
            }
        }
    }

    async fn deliver_all(
        &self,
        destination: ChatId,
        records: Vec<ContentRecord>,
        mut missing: usize,
    ) -> AccessOutcome {
        let mut copies: Vec<MessageRef> = Vec::with_capacity(records.len());
        for record in &records {
            match self
                .delivery
                .deliver(record.location, destination, record.caption())
                .await
            {
                Ok(copy) => copies.push(copy),
                Err(e) => {
                    warn!("[GATE] delivery of {} failed: {e}", record.id);
                    missing += 1;
                }
            }
        }

        let delivered = copies.len();
        let minutes = self.retention.minutes_for(destination).await;
        if minutes > 0 && delivered > 0 {
            let notice = format!(
                "These files will be deleted in {}. Save them elsewhere if you need them.",
                format_minutes(minutes)
            );
            match self.delivery.send_notice(destination, &notice).await {
                Ok(msg) => copies.push(msg),
                Err(e) => warn!("[GATE] auto-delete notice to {} failed: {e}", destination.0),
            }
            for copy in &copies {
                if let Err(e) = self
                    .scheduler
                    .schedule(copy.chat_id, copy.message_id, minutes)
                    .await
                {
                    warn!("[GATE] could not schedule deletion of {copy}: {e}");
                }
            }
        }

        info!(
            "[GATE] delivered {delivered} to {}, {missing} missing",
            destination.0
        );
        AccessOutcome::Delivered {
            delivered,
            missing,
            auto_delete_minutes: minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;
    use crate::{
        clock::ManualClock,
        domain::MessageId,
        records::{BatchRecord, IndexEntry, MediaKind},
        testkit::{config_handle, tmp_dir, MemoryIndex, RecordingDelivery, RecordingNotifier},
    };

    const USER: UserId = UserId(500);
    const DEST: ChatId = ChatId(500);

    struct Fixture {
        gateway: Gateway,
        delivery: Arc<RecordingDelivery>,
        remote: Arc<MemoryIndex>,
        notifier: Arc<RecordingNotifier>,
        dir: PathBuf,
    }

    fn fixture(prefix: &str, vars: &[(&str, &str)]) -> Fixture {
        let dir = tmp_dir(prefix);
        let delivery = Arc::new(RecordingDelivery::default());
        let remote = Arc::new(MemoryIndex::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Gateway::new(GatewayDeps {
            config: config_handle(&dir, vars),
            clock: Arc::new(ManualClock::at_unix(1_700_000_000)),
            links: LinkBuilder::new("share_bot"),
            delivery: delivery.clone(),
            remote: Some(remote.clone()),
            notifier: notifier.clone(),
        });
        Fixture {
            gateway,
            delivery,
            remote,
            notifier,
            dir,
        }
    }

    async fn stored(f: &Fixture, msg: i32, name: Option<&str>) -> ContentRecord {
        let r = ContentRecord::new(
            MessageRef::new(-100, msg),
            name.map(str::to_string),
            MediaKind::Video,
            1,
        );
        f.gateway
            .resolver()
            .files()
            .insert(&r.id, r.clone())
            .await
            .unwrap();
        r
    }

    #[tokio::test]
    async fn banned_users_get_nothing() {
        let f = fixture("fsg-gate-banned", &[("TOKEN_VERIFICATION_ENABLED", "0")]);
        let r = stored(&f, 1, None).await;
        f.gateway.bans().ban(USER, f.gateway.clock().as_ref()).await.unwrap();

        let out = f.gateway.handle_start(USER, DEST, Some(&r.id)).await;
        assert_eq!(out, AccessOutcome::Banned);
        assert!(f.delivery.delivered().is_empty());
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn without_a_grant_a_per_user_token_is_offered() {
        let f = fixture("fsg-gate-needs-token", &[]);
        let r = stored(&f, 1, None).await;

        let out = f.gateway.handle_start(USER, DEST, Some(&r.id)).await;
        let AccessOutcome::NeedsToken { redemption } = out else {
            panic!("expected NeedsToken, got {out:?}");
        };
        assert!(redemption.starts_with("https://t.me/share_bot?start=verify_"));
        assert!(f.delivery.delivered().is_empty());
        assert_eq!(f.notifier.notices().len(), 1);
        assert!(!f.notifier.notices()[0].open_access);

        // Redeeming the offered token, then fetching, delivers.
        let token = redemption.trim_start_matches("https://t.me/share_bot?start=");
        assert_eq!(
            f.gateway.handle_start(USER, DEST, Some(token)).await,
            AccessOutcome::TokenAccepted
        );
        let out = f.gateway.handle_start(USER, DEST, Some(&r.id)).await;
        assert!(matches!(out, AccessOutcome::Delivered { delivered: 1, missing: 0, .. }));
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn external_redemption_url_is_preferred() {
        let f = fixture("fsg-gate-get-token", &[("GET_TOKEN", "https://example.org/get")]);
        let out = f.gateway.handle_start(USER, DEST, Some("someid")).await;
        assert_eq!(
            out,
            AccessOutcome::NeedsToken {
                redemption: "https://example.org/get".into()
            }
        );
        assert!(f.notifier.notices().is_empty());
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn open_access_token_admits_everyone_but_user_tokens_do_not() {
        let f = fixture("fsg-gate-redeem", &[]);
        let open = f.gateway.ledger().issue(Subject::Anyone).await.unwrap();
        let other = f.gateway.ledger().issue(Subject::User(UserId(9))).await.unwrap();

        assert_eq!(
            f.gateway.handle_start(USER, DEST, Some(&format!("verify_{}", other.id))).await,
            AccessOutcome::TokenRejected
        );
        assert_eq!(
            f.gateway.handle_start(USER, DEST, Some(&format!("verify_{}", open.id))).await,
            AccessOutcome::TokenAccepted
        );
        assert_eq!(
            f.gateway.handle_start(USER, DEST, None).await,
            AccessOutcome::Welcome { redemption: None }
        );
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn batch_delivers_in_order_and_counts_every_kind_of_miss() {
        let f = fixture("fsg-gate-batch", &[("TOKEN_VERIFICATION_ENABLED", "0")]);
        let a = stored(&f, 1, Some("Part 1")).await;
        let broken = stored(&f, 2, None).await;
        let c = stored(&f, 3, None).await;
        f.delivery.fail_location(broken.location);

        let batch = BatchRecord::new(
            vec![a.id.clone(), "vanished".into(), broken.id.clone(), c.id.clone()],
            1,
        );
        f.remote.seed(IndexEntry::Batch(batch.clone()));

        let out = f.gateway.handle_start(USER, DEST, Some(&batch.id)).await;
        assert_eq!(
            out,
            AccessOutcome::Delivered {
                delivered: 2,
                missing: 2,
                auto_delete_minutes: 0
            }
        );
        let delivered = f.delivery.delivered();
        assert_eq!(delivered[0].location, a.location);
        assert_eq!(delivered[0].caption.as_deref(), Some("Part 1"));
        assert_eq!(delivered[1].location, c.location);
        assert!(out.message().unwrap().contains("2 could not"));
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_sends_a_notice_and_schedules_everything() {
        let f = fixture(
            "fsg-gate-retention",
            &[("TOKEN_VERIFICATION_ENABLED", "0"), ("AUTO_DELETE", "10")],
        );
        let r = stored(&f, 1, None).await;

        let out = f.gateway.handle_start(USER, DEST, Some(&r.id)).await;
        assert_eq!(
            out,
            AccessOutcome::Delivered {
                delivered: 1,
                missing: 0,
                auto_delete_minutes: 10
            }
        );
        assert_eq!(out.message(), None);

        let notices = f.delivery.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].1.contains("10m"));

        let mut pending: Vec<MessageId> = f
            .gateway
            .scheduler()
            .pending()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.message)
            .collect();
        pending.sort();
        let mut expected = vec![f.delivery.delivered()[0].copy.message_id, notices[0].2.message_id];
        expected.sort();
        assert_eq!(pending, expected);
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn unknown_and_malformed_payloads() {
        let f = fixture("fsg-gate-unknown", &[("TOKEN_VERIFICATION_ENABLED", "0")]);
        assert_eq!(
            f.gateway.handle_start(USER, DEST, Some("abc")).await,
            AccessOutcome::NotFound
        );
        assert_eq!(
            f.gateway.handle_start(USER, DEST, Some("not a link!")).await,
            AccessOutcome::InvalidLink
        );
        let _ = fs::remove_dir_all(&f.dir);
    }

    #[test]
    fn messages_never_leak_internals() {
        assert!(AccessOutcome::Unavailable
            .message()
            .unwrap()
            .starts_with("Something went wrong"));
        assert_eq!(
            AccessOutcome::Delivered {
                delivered: 0,
                missing: 3,
                auto_delete_minutes: 0
            }
            .message()
            .unwrap(),
            "Sorry, none of the 3 requested files could be delivered."
        );
    }
}

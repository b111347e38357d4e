use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fsg_core::{
    clock::{Clock, SystemClock},
    config::ConfigHandle,
    delivery::{
        port::DeliveryPort,
        throttled::{ThrottleConfig, ThrottledDelivery},
    },
    domain::ChatId,
    gateway::{Gateway, GatewayDeps},
    index::{journal::JournalIndex, RemoteIndex},
    links::LinkBuilder,
    maintenance::Maintenance,
    notify::{FanoutNotifier, Notifier, WebhookNotifier},
};

use crate::{handlers, links_channel::LinksChannelIndex, AdminNotifier, TelegramDelivery};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub gateway: Arc<Gateway>,
    pub maintenance: Arc<Maintenance>,
    pub telegram: TelegramDelivery,
    pub chat_locks: Arc<ChatLocks>,
}

#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub async fn run_polling(config: Arc<ConfigHandle>) -> anyhow::Result<()> {
    let cfg = config.current();
    let bot = Bot::new(cfg.bot_token.clone());

    let me = bot.get_me().await?;
    let links = LinkBuilder::new(me.username());
    info!("fsg started: @{}", links.bot_username());
    info!("Data directory: {}", cfg.data_dir.display());
    info!("Admins: {}", cfg.admins.len());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Copies go out spaced per chat; Telegram 429s are still retried once in
    // the adapter.
    let telegram = TelegramDelivery::new(bot.clone(), config.clone());
    let delivery: Arc<dyn DeliveryPort> = Arc::new(ThrottledDelivery::new(
        Arc::new(telegram.clone()),
        ThrottleConfig::with_per_chat(cfg.batch_delivery_delay),
    ));

    let journal: Arc<dyn RemoteIndex> = Arc::new(JournalIndex::open(
        cfg.data_dir.join("index.jsonl"),
        clock.clone(),
    ));
    let remote: Arc<dyn RemoteIndex> = match cfg.links_channel {
        Some(channel) => Arc::new(LinksChannelIndex::new(
            journal,
            bot.clone(),
            ChatId(channel),
            links.clone(),
            clock.clone(),
        )),
        None => journal,
    };

    let mut notifier = FanoutNotifier::default();
    notifier.push(Arc::new(AdminNotifier::new(bot.clone(), config.clone())));
    if let Some(url) = &cfg.token_webhook_url {
        notifier.push(Arc::new(WebhookNotifier::new(url.clone())?));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);

    let gateway = Arc::new(Gateway::new(GatewayDeps {
        config: config.clone(),
        clock,
        links,
        delivery,
        remote: Some(remote),
        notifier,
    }));

    match gateway.scheduler().recover_on_startup().await {
        Ok(report) => info!(
            "[DELETE] startup recovery: {} fired, {} re-armed",
            report.fired, report.rearmed
        ),
        Err(e) => error!("[DELETE] startup recovery failed: {e}"),
    }

    let shutdown = CancellationToken::new();
    let refresh = gateway.ledger().spawn_refresh_loop(shutdown.clone());

    let state = Arc::new(AppState {
        config,
        maintenance: Arc::new(Maintenance::new(gateway.clone())),
        gateway: gateway.clone(),
        telegram,
        chat_locks: Arc::new(ChatLocks::default()),
    });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("shutting down");
    shutdown.cancel();
    if let Err(e) = refresh.await {
        warn!("token refresh task ended abnormally: {e}");
    }
    gateway.scheduler().shutdown().await;

    Ok(())
}

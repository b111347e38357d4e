use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{error, info};

use fsg_core::{
    domain::{ChatId, MessageId, UserId},
    links::LinkBuilder,
    search::{SearchHit, SearchQuery},
    tokens::{RefreshOutcome, Subject},
    utils::{format_minutes, human_time},
};

use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn parse_user_id(arg: &str) -> Option<UserId> {
    arg.split_whitespace()
        .next()?
        .parse::<i64>()
        .ok()
        .map(UserId)
}

fn parse_minutes(arg: &str) -> Result<u32, &'static str> {
    let raw = arg.split_whitespace().next().ok_or("Usage: /setautodelete <minutes>")?;
    match raw.parse::<i64>() {
        Ok(n) if n < 0 => Err("Minutes cannot be negative."),
        Ok(n) => u32::try_from(n).map_err(|_| "That is too many minutes."),
        Err(_) => Err("Minutes must be a whole number."),
    }
}

fn parse_purge_args(arg: &str) -> Option<(ChatId, MessageId)> {
    let mut it = arg.split_whitespace();
    let chat = it.next()?.parse::<i64>().ok()?;
    let msg = it.next()?.parse::<i32>().ok()?;
    Some((ChatId(chat), MessageId(msg)))
}

const MAX_SEARCH_RESULTS: usize = 10;

fn render_search(query: &SearchQuery, hits: &[SearchHit], links: &LinkBuilder) -> String {
    if hits.is_empty() {
        return format!("No files found matching {}.", query.describe());
    }
    let mut out = format!("🔍 Search results for {}:\n", query.describe());
    for (i, hit) in hits.iter().take(MAX_SEARCH_RESULTS).enumerate() {
        let icon = match hit {
            SearchHit::File { .. } => "📄",
            SearchHit::Batch { .. } => "📁",
        };
        out.push_str(&format!(
            "\n{}. {icon} {} (matched in: {})\n{}\n",
            i + 1,
            hit.label(),
            hit.matched_in().join(", "),
            links.content_link(hit.id())
        ));
    }
    if hits.len() > MAX_SEARCH_RESULTS {
        out.push_str(&format!(
            "\n...and {} more results.",
            hits.len() - MAX_SEARCH_RESULTS
        ));
    }
    out
}

const HELP: &str = "📁 File Share Bot\n\n\
Open a shared link to receive its files.\n\
/search <words|date:YYYY-MM-DD|link:...> - Find stored files\n\n\
Admin commands:\n\
Send any file - Store it and get a share link\n\
/rename - Name the next stored file\n\
/firstbatch - Start collecting files into a batch\n\
/lastbatch - Finish the batch and get its link\n\
/ban <id> / /unban <id> / /listbanned\n\
/setautodelete <minutes|default> - Auto-delete window for this chat\n\
/autodelete - Show this chat's auto-delete window\n\
/newtoken - Issue a fresh access token\n\
/purgedelete <chat> <msg> - Cancel a pending deletion\n\
/status - Show bot status\n\
/reload - Reload configuration\n\n\
Owner commands:\n\
/tokentoggle - Turn token verification on/off\n\
/cleanup - Back up data and drop published records from the local index";

async fn reply(bot: &Bot, msg: &Message, text: impl Into<String>) {
    let _ = bot
        .send_message(msg.chat.id, text.into())
        .disable_web_page_preview(true)
        .await;
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);
    let (cmd, arg) = parse_command(text);

    let cfg = state.config.current();
    let is_admin = cfg.is_admin(user_id.0);
    let is_owner = cfg.owner_id() == Some(user_id.0);
    let g = &state.gateway;

    match cmd.as_str() {
        "start" => {
            let payload = arg.split_whitespace().next();
            let outcome = g.handle_start(user_id, chat_id, payload).await;
            if let Some(text) = outcome.message() {
                reply(&bot, &msg, text).await;
            }
        }

        "help" => reply(&bot, &msg, HELP).await,

        "search" => {
            if g.bans().is_banned(user_id).await {
                return Ok(());
            }
            let Some(query) = SearchQuery::parse(&arg) else {
                reply(
                    &bot,
                    &msg,
                    "Please provide search keywords.\n\nExamples:\n/search anime\n/search date:2025-04-01\n/search link:https://t.me/...",
                )
                .await;
                return Ok(());
            };
            match g.resolver().search(&query).await {
                Ok(hits) => reply(&bot, &msg, render_search(&query, &hits, g.links())).await,
                Err(e) => {
                    error!("[CMD] search failed: {e}");
                    reply(&bot, &msg, "Search is unavailable right now.").await;
                }
            }
        }

        _ if !is_admin => {}

        "rename" => {
            g.ingestor().request_rename(user_id).await;
            reply(&bot, &msg, "Please enter the new name for the next file:").await;
        }

        "firstbatch" => {
            g.ingestor().start_batch(user_id).await;
            reply(&bot, &msg, "Batch collection started! Send the files, then /lastbatch.").await;
        }

        "lastbatch" => match g.ingestor().finish_batch(user_id).await {
            Ok(Some(closed)) => {
                reply(
                    &bot,
                    &msg,
                    format!(
                        "Batch stored ({} files)!\nShare link:\n{}",
                        closed.batch.member_ids.len(),
                        closed.link
                    ),
                )
                .await
            }
            Ok(None) => reply(&bot, &msg, "No active batch!").await,
            Err(e) => {
                error!("[CMD] saving batch failed: {e}");
                reply(&bot, &msg, "Failed to save batch!").await;
            }
        },

        "ban" => match parse_user_id(&arg) {
            None => reply(&bot, &msg, "Provide a numeric user ID.").await,
            Some(target) => match g.bans().ban(target, g.clock().as_ref()).await {
                Ok(true) => reply(&bot, &msg, format!("Banned {}.", target.0)).await,
                Ok(false) => reply(&bot, &msg, "Already banned.").await,
                Err(e) => {
                    error!("[CMD] ban failed: {e}");
                    reply(&bot, &msg, "Failed to update the ban list.").await;
                }
            },
        },

        "unban" => match parse_user_id(&arg) {
            None => reply(&bot, &msg, "Provide a numeric user ID.").await,
            Some(target) => match g.bans().unban(target).await {
                Ok(true) => reply(&bot, &msg, format!("Unbanned {}.", target.0)).await,
                Ok(false) => reply(&bot, &msg, "That user is not banned.").await,
                Err(e) => {
                    error!("[CMD] unban failed: {e}");
                    reply(&bot, &msg, "Failed to update the ban list.").await;
                }
            },
        },

        "listbanned" => match g.bans().list().await {
            Ok(ids) if ids.is_empty() => reply(&bot, &msg, "No banned users.").await,
            Ok(ids) => {
                let list: Vec<String> = ids.iter().map(|u| u.0.to_string()).collect();
                reply(&bot, &msg, format!("Banned users: {}", list.join(", "))).await
            }
            Err(e) => {
                error!("[CMD] listing bans failed: {e}");
                reply(&bot, &msg, "Failed to list banned users.").await;
            }
        },

        "setautodelete" => {
            let result = if arg.trim().eq_ignore_ascii_case("default") {
                g.retention().clear(chat_id).await.map(|_| None)
            } else {
                match parse_minutes(&arg) {
                    Ok(minutes) => g.retention().set(chat_id, minutes).await.map(|_| Some(minutes)),
                    Err(usage) => {
                        reply(&bot, &msg, usage).await;
                        return Ok(());
                    }
                }
            };
            match result {
                Ok(Some(0)) => reply(&bot, &msg, "Auto-delete disabled for this chat.").await,
                Ok(Some(m)) => {
                    reply(
                        &bot,
                        &msg,
                        format!("Files sent here will be deleted after {}.", format_minutes(m)),
                    )
                    .await
                }
                Ok(None) => {
                    reply(&bot, &msg, "This chat now follows the global auto-delete setting.").await
                }
                Err(e) => {
                    error!("[CMD] setautodelete failed: {e}");
                    reply(&bot, &msg, "Failed to save the setting.").await;
                }
            }
        }

        "autodelete" => {
            let overridden = g.retention().override_for(chat_id).await;
            let minutes = overridden.unwrap_or_else(|| g.retention().global_minutes());
            let source = if overridden.is_some() { "this chat" } else { "global default" };
            let window = if minutes == 0 {
                "off".to_string()
            } else {
                format_minutes(minutes)
            };
            reply(&bot, &msg, format!("Auto-delete: {window} ({source}).")).await;
        }

        "newtoken" => match g.ledger().issue(Subject::Anyone).await {
            Ok(token) => {
                reply(
                    &bot,
                    &msg,
                    format!(
                        "New access token issued.\n\n{}\nExpires: {}",
                        g.links().redemption_link(&token.id),
                        human_time(token.expiry)
                    ),
                )
                .await
            }
            Err(e) => {
                error!("[CMD] issuing token failed: {e}");
                reply(&bot, &msg, "Failed to issue a token.").await;
            }
        },

        "purgedelete" => match parse_purge_args(&arg) {
            None => reply(&bot, &msg, "Usage: /purgedelete <chat_id> <message_id>").await,
            Some((chat, message)) => match g.scheduler().cancel(chat, message).await {
                Ok(true) => reply(&bot, &msg, "Pending deletion cancelled.").await,
                Ok(false) => reply(&bot, &msg, "No pending deletion for that message.").await,
                Err(e) => {
                    error!("[CMD] purgedelete failed: {e}");
                    reply(&bot, &msg, "Failed to cancel the deletion.").await;
                }
            },
        },

        "status" => match state.maintenance.status().await {
            Ok(status) => {
                let mut text = status.summary();
                if let Ok(Some(t)) = g.ledger().current_open_token().await {
                    text.push_str(&format!("\nOpen token expires: {}", human_time(t.expiry)));
                }
                reply(&bot, &msg, text).await
            }
            Err(e) => {
                error!("[CMD] status failed: {e}");
                reply(&bot, &msg, "Status unavailable.").await;
            }
        },

        "reload" => match state.config.reload() {
            Ok(_) => reply(&bot, &msg, "Configuration reloaded.").await,
            Err(e) => {
                error!("[CMD] reload failed: {e}");
                reply(&bot, &msg, format!("Reload failed, previous settings kept.\n{e}")).await;
            }
        },

        _ if !is_owner => {}

        "tokentoggle" => {
            let enable = !cfg.token_verification_enabled;
            let value = if enable { "1" } else { "0" };
            match state.config.set_persisted("TOKEN_VERIFICATION_ENABLED", value) {
                Ok(_) => {
                    info!("[CMD] token verification set to {enable} by {}", user_id.0);
                    if enable {
                        // Make sure there is something to redeem right away.
                        if let Ok(RefreshOutcome::Issued(_)) = g.ledger().refresh_if_needed().await {
                            info!("[CMD] issued an open token after enabling verification");
                        }
                    }
                    let state_word = if enable { "enabled" } else { "disabled" };
                    reply(&bot, &msg, format!("Token verification {state_word}.")).await;
                }
                Err(e) => {
                    error!("[CMD] tokentoggle failed: {e}");
                    reply(&bot, &msg, "Failed to save the setting.").await;
                }
            }
        }

        "cleanup" => {
            reply(&bot, &msg, "Cleaning up...").await;
            match state.maintenance.cleanup().await {
                Ok(report) => reply(&bot, &msg, report.summary()).await,
                Err(e) => {
                    error!("[CMD] cleanup failed: {e}");
                    reply(&bot, &msg, "Cleanup failed. See the logs for details.").await;
                }
            }
        }

        _ => {}
    }

    Ok(())
}

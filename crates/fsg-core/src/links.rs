use std::sync::OnceLock;

use regex::Regex;

const REDEEM_PREFIX: &str = "verify_";

/// Builds the deep links handed out to users.
#[derive(Clone, Debug)]
pub struct LinkBuilder {
    bot_username: String,
}

impl LinkBuilder {
    pub fn new(bot_username: impl Into<String>) -> Self {
        let bot_username = bot_username.into();
        Self {
            bot_username: bot_username.trim_start_matches('@').to_string(),
        }
    }

    pub fn bot_username(&self) -> &str {
        &self.bot_username
    }

    pub fn content_link(&self, id: &str) -> String {
        format!("https://t.me/{}?start={id}", self.bot_username)
    }

    pub fn redemption_link(&self, token_id: &str) -> String {
        format!(
            "https://t.me/{}?start={REDEEM_PREFIX}{token_id}",
            self.bot_username
        )
    }
}

/// Parsed `/start` argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartPayload {
    /// `verify_<token>`
    Redeem(String),
    /// A shared content or batch id.
    Fetch(String),
    Invalid,
}

impl StartPayload {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(caps) = redeem_re().captures(raw) {
            return StartPayload::Redeem(caps[1].to_string());
        }
        if id_re().is_match(raw) {
            return StartPayload::Fetch(raw.to_string());
        }
        StartPayload::Invalid
    }
}

fn redeem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^verify_([A-Za-z0-9-]{8,64})$").expect("valid regex"))
}

// Telegram caps start parameters at 64 chars of [A-Za-z0-9_-].
fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"))
}

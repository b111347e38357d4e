use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use tracing::{info, warn};

use crate::{errors::Error, Result};

/// One year.
const MAX_TOKEN_HOURS: u64 = 24 * 365;

/// Typed configuration for the gateway.
///
/// Components never read the environment themselves; they get a `ConfigHandle`
/// at construction and take a snapshot with `current()` when they need one.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bot_token: String,
    pub admins: Vec<i64>,
    /// Archive chat where ingested content lives.
    pub database_channel: i64,
    /// Human-readable mirror of the remote index (optional).
    pub links_channel: Option<i64>,
    pub protect_content: bool,

    // Retention
    pub auto_delete_minutes: u32,

    // Access tokens
    pub token_duration: Duration,
    pub token_low_water: Duration,
    pub token_refresh_interval: Duration,
    pub token_verification_enabled: bool,
    pub get_token_url: Option<String>,
    pub token_webhook_url: Option<String>,

    // Delivery
    pub batch_delivery_delay: Duration,

    // Storage
    pub data_dir: PathBuf,
    pub env_file: PathBuf,
}

impl Config {
    /// Load from the process environment overlaid on the `.env` file (`ENV_FILE`).
    pub fn load() -> Result<Self> {
        let env_file = env_path("ENV_FILE").unwrap_or_else(|| PathBuf::from(".env"));
        let cfg = Self::from_vars(&read_sources(&env_file, &HashMap::new()), env_file)?;
        fs::create_dir_all(&cfg.data_dir)?;
        Ok(cfg)
    }

    /// Build a config from an already merged key/value view.
    pub fn from_vars(vars: &HashMap<String, String>, env_file: PathBuf) -> Result<Self> {
        let get = |k: &str| vars.get(k).cloned();

        let bot_token = get("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let admins = parse_csv_i64(get("ADMINS"));
        if admins.is_empty() {
            return Err(Error::Config(
                "ADMINS environment variable is required".to_string(),
            ));
        }

        let database_channel = parse_i64(&get, "DATABASE_CHANNEL")?.unwrap_or(0);
        if database_channel == 0 {
            return Err(Error::Config(
                "DATABASE_CHANNEL environment variable is required".to_string(),
            ));
        }
        let links_channel = parse_i64(&get, "LINKS_CHANNEL")?.filter(|id| *id != 0);
        let protect_content = parse_bool(&get, "PROTECT_CONTENT").unwrap_or(true);

        let auto_delete_minutes = parse_u64(&get, "AUTO_DELETE")?.unwrap_or(0);
        let auto_delete_minutes = u32::try_from(auto_delete_minutes)
            .map_err(|_| Error::Config(format!("AUTO_DELETE out of range: {auto_delete_minutes}")))?;

        let token_hours = parse_u64(&get, "TOKEN_DURATION")?.unwrap_or(24);
        if token_hours == 0 {
            return Err(Error::Config("TOKEN_DURATION must be at least 1 hour".to_string()));
        }
        if token_hours > MAX_TOKEN_HOURS {
            return Err(Error::Config(format!(
                "TOKEN_DURATION must be at most {MAX_TOKEN_HOURS} hours: {token_hours}"
            )));
        }
        let token_duration = scaled_secs("TOKEN_DURATION", token_hours, 3600)?;
        let token_low_water = scaled_secs(
            "TOKEN_LOW_WATER_MINUTES",
            parse_u64(&get, "TOKEN_LOW_WATER_MINUTES")?.unwrap_or(60),
            60,
        )?;
        if token_low_water >= token_duration {
            return Err(Error::Config(
                "TOKEN_LOW_WATER_MINUTES must be shorter than TOKEN_DURATION".to_string(),
            ));
        }
        let refresh_minutes = parse_u64(&get, "TOKEN_REFRESH_INTERVAL_MINUTES")?.unwrap_or(30);
        if refresh_minutes == 0 {
            return Err(Error::Config(
                "TOKEN_REFRESH_INTERVAL_MINUTES must be > 0".to_string(),
            ));
        }
        let token_refresh_interval =
            scaled_secs("TOKEN_REFRESH_INTERVAL_MINUTES", refresh_minutes, 60)?;
        if token_refresh_interval > token_duration {
            return Err(Error::Config(
                "TOKEN_REFRESH_INTERVAL_MINUTES must not exceed TOKEN_DURATION".to_string(),
            ));
        }
        let token_verification_enabled =
            parse_bool(&get, "TOKEN_VERIFICATION_ENABLED").unwrap_or(true);

        let get_token_url = get("GET_TOKEN").and_then(non_empty);
        if let Some(url) = &get_token_url {
            if !is_http_url(url) {
                warn!("GET_TOKEN is not an http(s) URL, per-user tokens will be issued instead");
            }
        }
        let token_webhook_url = get("TOKEN_WEBHOOK_URL").and_then(non_empty);
        if let Some(url) = &token_webhook_url {
            if !is_http_url(url) {
                return Err(Error::Config(format!(
                    "TOKEN_WEBHOOK_URL must be an http(s) URL: {url}"
                )));
            }
        }

        let batch_delivery_delay =
            Duration::from_millis(parse_u64(&get, "BATCH_DELIVERY_DELAY_MS")?.unwrap_or(1000));

        let data_dir = get("DATA_DIR")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        Ok(Self {
            bot_token,
            admins,
            database_channel,
            links_channel,
            protect_content,
            auto_delete_minutes,
            token_duration,
            token_low_water,
            token_refresh_interval,
            token_verification_enabled,
            get_token_url,
            token_webhook_url,
            batch_delivery_delay,
            data_dir,
            env_file,
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    /// The first admin owns owner-only commands (token toggle, cleanup).
    pub fn owner_id(&self) -> Option<i64> {
        self.admins.first().copied()
    }

    /// `GET_TOKEN` when it is usable as a redemption URL.
    pub fn external_redemption_url(&self) -> Option<&str> {
        self.get_token_url.as_deref().filter(|u| is_http_url(u))
    }
}

/// Active configuration snapshot plus the means to replace it.
///
/// Readers clone the `Arc` and keep a consistent view for the duration of an
/// operation; `reload()` swaps the snapshot in one step.
pub struct ConfigHandle {
    env_file: PathBuf,
    overrides: Mutex<HashMap<String, String>>,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn new(cfg: Config) -> Self {
        Self {
            env_file: cfg.env_file.clone(),
            overrides: Mutex::new(HashMap::new()),
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    pub fn load() -> Result<Self> {
        Ok(Self::new(Config::load()?))
    }

    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the sources and swap the active snapshot. On error the previous
    /// snapshot stays active.
    pub fn reload(&self) -> Result<Arc<Config>> {
        let overrides = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let vars = read_sources(&self.env_file, &overrides);
        let next = Arc::new(Config::from_vars(&vars, self.env_file.clone())?);
        fs::create_dir_all(&next.data_dir)?;

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        info!("configuration reloaded from {}", self.env_file.display());
        Ok(next)
    }

    /// Persist one key into the env file and make it effective immediately.
    pub fn set_persisted(&self, key: &str, value: &str) -> Result<Arc<Config>> {
        write_dotenv_key(&self.env_file, key, value)?;
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self.reload()
    }
}

// Precedence: runtime overrides > process env > env file.
fn read_sources(env_file: &Path, overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut vars = fs::read_to_string(env_file)
        .map(|txt| parse_dotenv(&txt))
        .unwrap_or_default();
    vars.extend(env::vars());
    vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        out.insert(key.to_string(), strip_quotes(v.trim()).to_string());
    }
    out
}

fn write_dotenv_key(path: &Path, key: &str, value: &str) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let matches = line
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false);
            if matches && !line.trim_start().starts_with('#') {
                replaced = true;
                format!("{key}={value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("{key}={value}"));
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, lines.join("\n") + "\n")?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return &s[1..s.len() - 1];
    }
    s
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    get(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = get(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer: {raw}")))
}

fn scaled_secs(key: &str, value: u64, unit_secs: u64) -> Result<Duration> {
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Config(format!("{key} out of range: {value}")))
}

fn parse_i64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<i64>> {
    let Some(raw) = get(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<i64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be an integer: {raw}")))
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

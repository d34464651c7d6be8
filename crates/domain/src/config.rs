//! Environment-driven configuration structures shared by all crates.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use strum::IntoEnumIterator;
use thiserror::Error;

use crate::model::{PaymentPackage, PriceTable, TaskKind, UserId, VideoTier};

/// Gateway configuration: HTTP binds, shared database and chat-platform access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    database_url: String,
    api_bind_address: String,
    api_unix_socket: Option<String>,
    internal_bind_address: Option<String>,
    internal_unix_socket: Option<String>,
    public_base_url: String,
    bot_token: String,
    chat_api_base_url: String,
    admin_ids: Vec<UserId>,
    task_retention: Duration,
    orchestration_window: Duration,
    media_ttl: Duration,
}

impl GatewayConfig {
    pub const DEFAULT_CHAT_API_BASE_URL: &'static str = "https://api.telegram.org";
    pub const DEFAULT_RETENTION_HOURS: u64 = 24;
    pub const DEFAULT_ORCHESTRATION_WINDOW_SECS: u64 = 3_600;
    pub const DEFAULT_MEDIA_TTL_SECS: u64 = 3_600;

    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let retention_hours = get_number_or("TASK_RETENTION_HOURS", Self::DEFAULT_RETENTION_HOURS)?;
        let window_secs = get_number_or(
            "ORCHESTRATION_WINDOW_SECS",
            Self::DEFAULT_ORCHESTRATION_WINDOW_SECS,
        )?;
        let media_ttl_secs = get_number_or("MEDIA_TTL_SECS", Self::DEFAULT_MEDIA_TTL_SECS)?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            api_bind_address: get_required_var("API_BIND_ADDRESS")?,
            api_unix_socket: get_optional_var("API_UNIX_SOCKET"),
            internal_bind_address: get_optional_var("API_INTERNAL_BIND_ADDRESS"),
            internal_unix_socket: get_optional_var("API_INTERNAL_UNIX_SOCKET"),
            public_base_url: get_required_var("PUBLIC_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            bot_token: get_required_var("BOT_TOKEN")?,
            chat_api_base_url: get_optional_var("CHAT_API_BASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_CHAT_API_BASE_URL.to_string()),
            admin_ids: parse_admin_ids(get_optional_var("ADMIN_IDS").as_deref())?,
            task_retention: Duration::from_secs(retention_hours.saturating_mul(3_600)),
            orchestration_window: Duration::from_secs(window_secs),
            media_ttl: Duration::from_secs(media_ttl_secs),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn api_unix_socket(&self) -> Option<&str> {
        self.api_unix_socket.as_deref()
    }

    pub fn internal_bind_address(&self) -> Option<&str> {
        self.internal_bind_address.as_deref()
    }

    pub fn internal_unix_socket(&self) -> Option<&str> {
        self.internal_unix_socket.as_deref()
    }

    pub fn has_internal_listener(&self) -> bool {
        self.internal_bind_address.is_some() || self.internal_unix_socket.is_some()
    }

    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    pub fn bot_token(&self) -> &str {
        &self.bot_token
    }

    pub fn chat_api_base_url(&self) -> &str {
        &self.chat_api_base_url
    }

    pub fn admin_ids(&self) -> &[UserId] {
        &self.admin_ids
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn task_retention(&self) -> Duration {
        self.task_retention
    }

    pub fn orchestration_window(&self) -> Duration {
        self.orchestration_window
    }

    pub fn media_ttl(&self) -> Duration {
        self.media_ttl
    }
}

/// Remote generation API access, polling knobs and model names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_poll_attempts: u32,
    download_timeout: Duration,
    fan_out: usize,
    models: ModelTable,
    translate_url: Option<String>,
}

impl GenerationConfig {
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
    pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 60;
    pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
    pub const DEFAULT_FAN_OUT: usize = 3;

    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let defaults = ModelTable::default();
        let models = ModelTable {
            image_model: get_optional_var("GEN_IMAGE_MODEL").unwrap_or(defaults.image_model),
            video_balance_model: get_optional_var("GEN_VIDEO_BALANCE_MODEL")
                .unwrap_or(defaults.video_balance_model),
            video_pro6_model: get_optional_var("GEN_VIDEO_PRO6_MODEL")
                .unwrap_or(defaults.video_pro6_model),
            video_pro10_model: get_optional_var("GEN_VIDEO_PRO10_MODEL")
                .unwrap_or(defaults.video_pro10_model),
            video_super6_model: get_optional_var("GEN_VIDEO_SUPER6_MODEL")
                .unwrap_or(defaults.video_super6_model),
        };

        Ok(Self {
            api_key: get_required_var("GEN_API_KEY")?,
            base_url: get_required_var("GEN_API_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            poll_interval: Duration::from_secs(get_number_or(
                "GEN_POLL_INTERVAL_SECS",
                Self::DEFAULT_POLL_INTERVAL_SECS,
            )?),
            max_poll_attempts: get_number_or("GEN_MAX_POLL_ATTEMPTS", Self::DEFAULT_MAX_POLL_ATTEMPTS)?
                .max(1),
            download_timeout: Duration::from_secs(get_number_or(
                "GEN_DOWNLOAD_TIMEOUT_SECS",
                Self::DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            )?),
            fan_out: get_number_or("GEN_FAN_OUT", Self::DEFAULT_FAN_OUT)?.max(1),
            models,
            translate_url: get_optional_var("TRANSLATE_URL"),
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_poll_attempts(&self) -> u32 {
        self.max_poll_attempts
    }

    pub fn download_timeout(&self) -> Duration {
        self.download_timeout
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub fn translate_url(&self) -> Option<&str> {
        self.translate_url.as_deref()
    }
}

/// Remote model names per request family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTable {
    pub image_model: String,
    pub video_balance_model: String,
    pub video_pro6_model: String,
    pub video_pro10_model: String,
    pub video_super6_model: String,
}

impl ModelTable {
    pub fn video_model(&self, tier: VideoTier) -> &str {
        match tier {
            VideoTier::Balance => &self.video_balance_model,
            VideoTier::Pro6 => &self.video_pro6_model,
            VideoTier::Pro10 => &self.video_pro10_model,
            VideoTier::Super6 => &self.video_super6_model,
        }
    }
}

impl Default for ModelTable {
    fn default() -> Self {
        Self {
            image_model: "google/nano-banana-edit".to_string(),
            video_balance_model: "grok-imagine/image-to-video".to_string(),
            video_pro6_model: "hailuo/02-image-to-video-pro".to_string(),
            video_pro10_model: "hailuo/02-image-to-video-standard".to_string(),
            video_super6_model: "hailuo/2-3-image-to-video-pro".to_string(),
        }
    }
}

/// Payment provider credentials and reconciliation timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfig {
    shop_id: String,
    secret_key: String,
    return_url: String,
    api_base_url: String,
    currency: String,
    poll_interval: Duration,
    confirmation_timeout: Duration,
    receipt_email: Option<String>,
    packages: Vec<PaymentPackage>,
}

impl PaymentConfig {
    pub const DEFAULT_API_BASE_URL: &'static str = "https://api.yookassa.ru/v3";
    pub const DEFAULT_CURRENCY: &'static str = "RUB";
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
    pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            shop_id: get_required_var("PAYMENT_SHOP_ID")?,
            secret_key: get_required_var("PAYMENT_SECRET_KEY")?,
            return_url: get_required_var("PAYMENT_RETURN_URL")?,
            api_base_url: get_optional_var("PAYMENT_API_BASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            currency: get_optional_var("PAYMENT_CURRENCY")
                .unwrap_or_else(|| Self::DEFAULT_CURRENCY.to_string()),
            poll_interval: Duration::from_secs(get_number_or(
                "PAYMENT_POLL_INTERVAL_SECS",
                Self::DEFAULT_POLL_INTERVAL_SECS,
            )?),
            confirmation_timeout: Duration::from_secs(get_number_or(
                "PAYMENT_TIMEOUT_SECS",
                Self::DEFAULT_TIMEOUT_SECS,
            )?),
            receipt_email: get_optional_var("PAYMENT_RECEIPT_EMAIL"),
            packages: parse_packages(get_optional_var("PAYMENT_PACKAGES").as_deref())?,
        })
    }

    pub fn shop_id(&self) -> &str {
        &self.shop_id
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn return_url(&self) -> &str {
        &self.return_url
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn confirmation_timeout(&self) -> Duration {
        self.confirmation_timeout
    }

    pub fn receipt_email(&self) -> Option<&str> {
        self.receipt_email.as_deref()
    }

    pub fn packages(&self) -> &[PaymentPackage] {
        &self.packages
    }
}

/// Reads `PRICE_<KIND>` overrides on top of the default price table.
pub fn load_price_table() -> Result<PriceTable, ConfigError> {
    hydrate_env_file()?;

    let mut overrides = BTreeMap::new();
    for kind in TaskKind::iter() {
        let key = format!("PRICE_{}", kind.as_ref().to_ascii_uppercase());
        if let Some(raw) = env::var(&key).ok().filter(|value| !value.trim().is_empty()) {
            let cost = raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|cost| *cost > 0)
                .ok_or(ConfigError::InvalidValue { key, value: raw })?;
            overrides.insert(kind, cost);
        }
    }
    Ok(PriceTable::new(overrides))
}

fn parse_admin_ids(raw: Option<&str>) -> Result<Vec<UserId>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<i64>()
                .map(UserId::new)
                .map_err(|_| ConfigError::InvalidValue {
                    key: "ADMIN_IDS".to_string(),
                    value: item.to_string(),
                })
        })
        .collect()
}

fn parse_packages(raw: Option<&str>) -> Result<Vec<PaymentPackage>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            PaymentPackage::parse(item).ok_or_else(|| ConfigError::InvalidValue {
                key: "PAYMENT_PACKAGES".to_string(),
                value: item.to_string(),
            })
        })
        .collect()
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(ConfigError::MissingVar { key })
            } else {
                Ok(trimmed.to_string())
            }
        }
        Err(_) => Err(ConfigError::MissingVar { key }),
    }
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn get_number_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("CARDSMITH_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid value `{value}` in `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn set_env() {
        env::set_var("CARDSMITH_SKIP_DOTENV", "1");
        env::set_var("DATABASE_URL", "sqlite://test.db");
        env::set_var("API_BIND_ADDRESS", "127.0.0.1:8080");
        env::set_var("PUBLIC_BASE_URL", "https://bot.example/");
        env::set_var("BOT_TOKEN", "123:abc");
        env::remove_var("API_UNIX_SOCKET");
        env::remove_var("API_INTERNAL_BIND_ADDRESS");
        env::remove_var("API_INTERNAL_UNIX_SOCKET");
        env::remove_var("ADMIN_IDS");
        env::remove_var("TASK_RETENTION_HOURS");
        env::set_var("GEN_API_KEY", "gen-key");
        env::set_var("GEN_API_BASE_URL", "https://gen.example/api/v1/");
        env::remove_var("GEN_POLL_INTERVAL_SECS");
        env::remove_var("GEN_IMAGE_MODEL");
        env::set_var("PAYMENT_SHOP_ID", "shop");
        env::set_var("PAYMENT_SECRET_KEY", "secret");
        env::set_var("PAYMENT_RETURN_URL", "https://t.me/cardsmith_bot");
        env::remove_var("PAYMENT_PACKAGES");
        for kind in TaskKind::iter() {
            env::remove_var(format!("PRICE_{}", kind.as_ref().to_ascii_uppercase()));
        }
    }

    #[test]
    fn gateway_config_reads_env_with_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("ADMIN_IDS", "42, 7");

        let config = GatewayConfig::load_from_env().expect("config loads");
        assert_eq!(config.database_url(), "sqlite://test.db");
        assert_eq!(config.public_base_url(), "https://bot.example");
        assert_eq!(config.admin_ids(), &[UserId::new(42), UserId::new(7)]);
        assert!(config.is_admin(UserId::new(7)));
        assert_eq!(config.task_retention(), Duration::from_secs(24 * 3_600));
        assert_eq!(
            config.chat_api_base_url(),
            GatewayConfig::DEFAULT_CHAT_API_BASE_URL
        );
        assert!(!config.has_internal_listener());

        set_env();
    }

    #[test]
    fn gateway_config_supports_unix_and_internal_listeners() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("API_UNIX_SOCKET", "/tmp/api.sock");
        env::set_var("API_INTERNAL_BIND_ADDRESS", "127.0.0.1:9090");

        let config = GatewayConfig::load_from_env().expect("config loads");
        assert_eq!(config.api_unix_socket(), Some("/tmp/api.sock"));
        assert_eq!(config.internal_bind_address(), Some("127.0.0.1:9090"));
        assert!(config.has_internal_listener());

        set_env();
    }

    #[test]
    fn empty_required_env_var_is_treated_as_missing() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("BOT_TOKEN", "   ");

        let err = GatewayConfig::load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { key: "BOT_TOKEN" }));

        set_env();
    }

    #[test]
    fn malformed_admin_ids_are_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("ADMIN_IDS", "42,abc");

        let err = GatewayConfig::load_from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        set_env();
    }

    #[test]
    fn generation_config_trims_base_url_and_applies_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("GEN_POLL_INTERVAL_SECS", "3");
        env::set_var("GEN_IMAGE_MODEL", "custom/editor");

        let config = GenerationConfig::load_from_env().expect("config loads");
        assert_eq!(config.base_url(), "https://gen.example/api/v1");
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(
            config.max_poll_attempts(),
            GenerationConfig::DEFAULT_MAX_POLL_ATTEMPTS
        );
        assert_eq!(config.models().image_model, "custom/editor");
        assert_eq!(
            config.models().video_balance_model,
            ModelTable::default().video_balance_model
        );

        set_env();
    }

    #[test]
    fn invalid_number_surfaces_key() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("GEN_POLL_INTERVAL_SECS", "soon");

        let err = GenerationConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                key: "GEN_POLL_INTERVAL_SECS",
                ..
            }
        ));

        set_env();
    }

    #[test]
    fn payment_config_parses_packages() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("PAYMENT_PACKAGES", "299:30, 599:65");

        let config = PaymentConfig::load_from_env().expect("config loads");
        assert_eq!(config.currency(), "RUB");
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(600));
        assert_eq!(
            config.packages(),
            &[
                PaymentPackage {
                    amount_minor: 29_900,
                    credits: 30
                },
                PaymentPackage {
                    amount_minor: 59_900,
                    credits: 65
                }
            ]
        );

        set_env();
    }

    #[test]
    fn price_overrides_are_read_per_kind() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("PRICE_PHOTO_SCENE", "2");
        env::set_var("PRICE_VIDEO_PRO6", "9");

        let table = load_price_table().expect("prices load");
        assert_eq!(table.unit_cost(TaskKind::PhotoScene), 2);
        assert_eq!(table.unit_cost(TaskKind::VideoPro6), 9);
        assert_eq!(table.unit_cost(TaskKind::PhotoPose), 1);

        env::set_var("PRICE_PHOTO_SCENE", "-1");
        assert!(load_price_table().is_err());

        set_env();
    }
}

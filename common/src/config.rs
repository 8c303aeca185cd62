use crate::util::SerdeLevelFilter;
use anyhow::{anyhow, Context};
use log::LevelFilter;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use std::{
    env::{self, VarError},
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};
use time::{OffsetDateTime, UtcOffset};

static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

const APP_KEY_ENV_VAR: &str = "SCHWAB_APP_KEY";
const APP_SECRET_ENV_VAR: &str = "SCHWAB_APP_SECRET";
const CALLBACK_URL_ENV_VAR: &str = "SCHWAB_CALLBACK_URL";
const DEFAULT_CALLBACK_URL: &str = "https://127.0.0.1";
const CONFIG_PATH: &str = "./config.json";

pub struct Config {
    pub keys: ApiKeys,
    pub urls: Urls,
    pub auth_file: PathBuf,
    pub controller: ControllerConfig,
    pub orders: OrderConfig,
    pub utc_offset: LocalOffset,
    pub log_level_filter: LevelFilter,
}

impl Config {
    pub fn get() -> &'static Self {
        GLOBAL_CONFIG.get().expect("Config not set")
    }

    pub fn init() -> anyhow::Result<()> {
        // A missing .env is fine, the variables may come from the real environment
        if let Err(error) = dotenvy::dotenv() {
            if !error.not_found() {
                return Err(error).context("Failed to load .env file");
            }
        }

        let keys = ApiKeys::from_env()?;
        let on_disk_config = OnDiskConfig::load_or_default(Path::new(CONFIG_PATH))?;

        let utc_offset = match UtcOffset::current_local_offset() {
            Ok(offset) => LocalOffset::new(offset),
            Err(_) => on_disk_config
                .utc_offset
                .unwrap_or_else(|| LocalOffset::new(UtcOffset::UTC)),
        };

        let me = Self {
            keys,
            urls: on_disk_config.urls,
            auth_file: on_disk_config.auth_file,
            controller: on_disk_config.controller,
            orders: on_disk_config.orders,
            utc_offset,
            log_level_filter: on_disk_config.log_level_filter,
        };

        GLOBAL_CONFIG
            .set(me)
            .map_err(|_| anyhow!("Config already initialized"))
    }

    pub fn localize(datetime: OffsetDateTime) -> OffsetDateTime {
        datetime.to_offset(Self::get().utc_offset.get())
    }
}

pub struct ApiKeys {
    pub app_key: String,
    pub app_secret: String,
    /// Redirect URL registered with the app, used when authorizing a new session.
    pub callback_url: String,
}

impl ApiKeys {
    fn from_env() -> anyhow::Result<Self> {
        let app_key = read_env_var(APP_KEY_ENV_VAR)?;
        let app_secret = read_env_var(APP_SECRET_ENV_VAR)?;
        let callback_url = read_opt_env_var(CALLBACK_URL_ENV_VAR)?
            .unwrap_or_else(|| DEFAULT_CALLBACK_URL.to_owned());

        Ok(Self {
            app_key,
            app_secret,
            callback_url,
        })
    }
}

#[derive(Serialize, Deserialize)]
pub struct Urls {
    pub trader_api_root: String,
    pub market_data_api_root: String,
    pub oauth_api_root: String,
}

impl Default for Urls {
    fn default() -> Self {
        Self {
            trader_api_root: "https://api.schwabapi.com/trader/v1".to_owned(),
            market_data_api_root: "https://api.schwabapi.com/marketdata/v1".to_owned(),
            oauth_api_root: "https://api.schwabapi.com/v1".to_owned(),
        }
    }
}

/// Timings shared by the polling controllers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct ControllerConfig {
    pub poll_interval_ms: u64,
    pub quote_retry_delay_ms: u64,
    pub stop_order_delay_ms: u64,
    pub extreme_expiration_secs: u64,
    pub range_poll_interval_ms: u64,
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quote_retry_delay(&self) -> Duration {
        Duration::from_millis(self.quote_retry_delay_ms)
    }

    pub fn stop_order_delay(&self) -> Duration {
        Duration::from_millis(self.stop_order_delay_ms)
    }

    pub fn extreme_expiration(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.extreme_expiration_secs).unwrap_or(i64::MAX))
    }

    pub fn range_poll_interval(&self) -> Duration {
        Duration::from_millis(self.range_poll_interval_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            quote_retry_delay_ms: 2000,
            stop_order_delay_ms: 5000,
            extreme_expiration_secs: 30 * 60,
            range_poll_interval_ms: 1000,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct OrderConfig {
    // How far back to look for working orders to cancel before placing a new one
    pub working_order_lookback_days: u16,
    pub requests_per_minute: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            working_order_lookback_days: 365,
            requests_per_minute: 120,
        }
    }
}

fn read_env_var(env_var: &str) -> anyhow::Result<String> {
    read_opt_env_var(env_var)?.ok_or_else(|| {
        anyhow!("Missing required env var {env_var}. Add it to the environment or to .env")
    })
}

fn read_opt_env_var(env_var: &str) -> anyhow::Result<Option<String>> {
    match env::var(env_var) {
        Ok(var) => Ok(Some(var)),
        Err(VarError::NotPresent) => Ok(None),
        Err(error @ VarError::NotUnicode(_)) => {
            Err(anyhow!("Failed to parse env var {env_var}: {error}"))
        }
    }
}

pub struct LocalOffset {
    atomic_offset: AtomicU32,
}

impl LocalOffset {
    fn offset_to_u32(offset: UtcOffset) -> u32 {
        let (h, m, s) = offset.as_hms();
        let bytes = [h as u8, m as u8, s as u8, 0];
        u32::from_ne_bytes(bytes)
    }

    pub fn new(offset: UtcOffset) -> Self {
        Self {
            atomic_offset: AtomicU32::new(Self::offset_to_u32(offset)),
        }
    }

    pub fn get(&self) -> UtcOffset {
        let [h, m, s, _] = self.atomic_offset.load(Ordering::Relaxed).to_ne_bytes();
        UtcOffset::from_hms(h as i8, m as i8, s as i8)
            .expect("LocalOffset internal invariant violated")
    }

    pub fn set(&self, offset: UtcOffset) {
        self.atomic_offset
            .store(Self::offset_to_u32(offset), Ordering::Relaxed);
    }
}

impl Serialize for LocalOffset {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.get().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LocalOffset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        UtcOffset::deserialize(deserializer).map(Self::new)
    }
}

#[derive(Serialize, Deserialize)]
struct OnDiskConfig {
    urls: Urls,
    auth_file: PathBuf,
    #[serde(default)]
    controller: ControllerConfig,
    #[serde(default)]
    orders: OrderConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    utc_offset: Option<LocalOffset>,
    #[serde(with = "SerdeLevelFilter")]
    log_level_filter: LevelFilter,
}

impl OnDiskConfig {
    fn load_or_default(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            return Self::write_default(config_path);
        }

        let buf = fs::read_to_string(config_path).context("Failed to read config file")?;
        match serde_json::from_str::<Self>(&buf) {
            Ok(config) => Ok(config),
            Err(error) => {
                println!("Failed to read on-disk config ({error}), writing default config.");
                Self::write_default(config_path)
            }
        }
    }

    fn write_default(config_path: &Path) -> anyhow::Result<Self> {
        let default = Self::default();
        let serialized = serde_json::to_string_pretty(&default)
            .context("Failed to serialize on-disk config")?;
        fs::write(config_path, serialized.as_bytes()).context("Failed to write default config")?;
        Ok(default)
    }
}

impl Default for OnDiskConfig {
    fn default() -> Self {
        Self {
            urls: Urls::default(),
            auth_file: PathBuf::from("./auth.json"),
            controller: ControllerConfig::default(),
            orders: OrderConfig::default(),
            utc_offset: None,
            log_level_filter: LevelFilter::Debug,
        }
    }
}

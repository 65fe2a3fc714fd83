//! # Runtime configuration.
//!
//! [`Config`] centralizes every tunable of the dispensing cycle: identity
//! (nozzle/tank), the serial link, the timeout and retry envelope of the
//! supervisor, the fleet directory endpoint, and the operator HTTP surface.
//!
//! Values load from a TOML file when one is present and fall back to the
//! defaults below otherwise. Durations are stored as integer seconds or
//! milliseconds and exposed through `Duration` accessors so call sites never
//! repeat unit conversions.
//!
//! ## Defaults worth calling out
//! - `app_comm_budget_secs = 600`: the operator-contact budget is ten
//!   minutes while a refill is active (and unbounded in Idle).
//! - `nozzle_heartbeat_budget_secs = 40`: forty seconds, not ten.
//! - `max_interrupt_secs = 180`: the Interrupted state is bounded by an
//!   explicit maximum duration; the 5 s retry cadence divides into it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::RuntimeError;

/// Serial link settings. 8-N-1 framing is fixed; only path and baud vary.
#[derive(Clone, Debug, Deserialize)]
pub struct SerialConfig {
    /// Device path of the nozzle controller UART.
    #[serde(default = "SerialConfig::default_path")]
    pub path: String,
    /// Line rate.
    #[serde(default = "SerialConfig::default_baud")]
    pub baud: u32,
}

impl SerialConfig {
    fn default_path() -> String {
        "/dev/ttyAMA0".to_string()
    }
    fn default_baud() -> u32 {
        460_800
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            baud: Self::default_baud(),
        }
    }
}

/// Fleet directory endpoint and credentials.
#[derive(Clone, Debug, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the fleet API, without a trailing slash.
    #[serde(default = "DirectoryConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Directory tokens are valid for roughly five minutes; refresh early.
    #[serde(default = "DirectoryConfig::default_token_refresh_secs")]
    pub token_refresh_secs: u64,
}

impl DirectoryConfig {
    fn default_base_url() -> String {
        "http://localhost:9080".to_string()
    }
    fn default_token_refresh_secs() -> u64 {
        270
    }

    /// How long a minted token is trusted before a re-login.
    pub fn token_refresh(&self) -> Duration {
        Duration::from_secs(self.token_refresh_secs)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            username: String::new(),
            password: String::new(),
            token_refresh_secs: Self::default_token_refresh_secs(),
        }
    }
}

/// Operator HTTP surface settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the operator application.
    #[serde(default = "ApiConfig::default_listen")]
    pub listen: String,
    /// Operator login name accepted by the challenge/response endpoint.
    #[serde(default = "ApiConfig::default_username")]
    pub username: String,
    /// Shared secret hashed into the auth verifier. Weak by design of the
    /// wire contract; see the authenticator module for the rotation seam.
    #[serde(default)]
    pub shared_secret: String,
    /// Directory for multipart image uploads.
    #[serde(default = "ApiConfig::default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl ApiConfig {
    fn default_listen() -> String {
        "0.0.0.0:8080".to_string()
    }
    fn default_username() -> String {
        "FasAdmin".to_string()
    }
    fn default_upload_dir() -> PathBuf {
        PathBuf::from("uploads")
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            username: Self::default_username(),
            shared_secret: String::new(),
            upload_dir: Self::default_upload_dir(),
        }
    }
}

/// Global configuration for the dispensing supervisor.
///
/// All fields are public; prefer the `Duration` accessors over re-deriving
/// units at call sites.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Four-digit decimal nozzle identifier, first argument of every nozzle
    /// command. Stable for the supervisor's lifetime.
    pub nozzle_id: String,
    /// Tank this control board serves; scopes the permitted-vehicle fetch.
    pub tank_id: u32,

    pub serial: SerialConfig,
    pub directory: DirectoryConfig,
    pub api: ApiConfig,

    /// Path of the transaction store file.
    pub store_path: PathBuf,

    /// Response deadline for expect-response nozzle commands.
    pub uart_response_timeout_secs: u64,
    /// Interval between `rfid_get` attempts while recovering in Interrupted.
    pub rfid_retry_interval_secs: u64,
    /// Wall-clock ceiling on AwaitingFirstRfid.
    pub rfid_total_budget_secs: u64,
    /// How long the operator has to submit the DRF.
    pub drf_submit_timeout_secs: u64,
    /// Budget of the nozzle-originated-frame watch.
    pub nozzle_heartbeat_budget_secs: u64,
    /// Budget of the board heartbeat watch.
    pub board_heartbeat_budget_secs: u64,
    /// Interval of the Idle heartbeat probe.
    pub heartbeat_probe_interval_secs: u64,
    /// Operator-contact budget while a refill is active. Unbounded in Idle.
    pub app_comm_budget_secs: u64,
    /// How long AwaitingOperatorAck waits for a status poll.
    pub app_inform_timeout_secs: u64,
    /// Per-attempt deadline for meter reads while dispensing.
    pub meter_read_timeout_secs: u64,
    /// Per-attempt deadline for the first meter read after reset.
    pub first_meter_timeout_secs: u64,
    /// Attempt budget for the first meter read (150 x 2 s = five minutes).
    pub first_meter_retries: u32,
    /// Attempt budget for meter reads while dispensing.
    pub dispense_meter_retries: u32,
    /// Attempt budget for the final meter read.
    pub final_meter_retries: u32,
    /// Consecutive identical readings required for stability.
    pub meter_stability_window: usize,
    /// Minimum age of a stable run, in milliseconds.
    pub meter_stability_ms: u64,
    /// Persist progress every this many liters.
    pub persist_step_liters: Decimal,
    /// Attempt budget for `rfid_get` in AwaitingFirstRfid.
    pub max_rfid_retries: u32,
    /// Attempt budget for the tag-match wait, derived from a five-minute
    /// ceiling at 5 s per attempt.
    pub tag_match_retries: u32,
    /// Ceiling on the Interrupted recovery loop.
    pub max_interrupt_secs: u64,
    /// Cadence of the time-guard tick.
    pub tick_interval_ms: u64,
}

impl Config {
    /// Loads configuration from `path` if it exists, defaults otherwise.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        if path.exists() {
            let txt = std::fs::read_to_string(path)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
            toml::from_str(&txt)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))
        } else {
            Ok(Self::default())
        }
    }

    pub fn uart_response_timeout(&self) -> Duration {
        Duration::from_secs(self.uart_response_timeout_secs)
    }
    pub fn rfid_retry_interval(&self) -> Duration {
        Duration::from_secs(self.rfid_retry_interval_secs)
    }
    pub fn rfid_total_budget(&self) -> Duration {
        Duration::from_secs(self.rfid_total_budget_secs)
    }
    pub fn drf_submit_timeout(&self) -> Duration {
        Duration::from_secs(self.drf_submit_timeout_secs)
    }
    pub fn nozzle_heartbeat_budget(&self) -> Duration {
        Duration::from_secs(self.nozzle_heartbeat_budget_secs)
    }
    pub fn board_heartbeat_budget(&self) -> Duration {
        Duration::from_secs(self.board_heartbeat_budget_secs)
    }
    pub fn heartbeat_probe_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_probe_interval_secs)
    }
    pub fn app_comm_budget(&self) -> Duration {
        Duration::from_secs(self.app_comm_budget_secs)
    }
    pub fn app_inform_timeout(&self) -> Duration {
        Duration::from_secs(self.app_inform_timeout_secs)
    }
    pub fn meter_read_timeout(&self) -> Duration {
        Duration::from_secs(self.meter_read_timeout_secs)
    }
    pub fn first_meter_timeout(&self) -> Duration {
        Duration::from_secs(self.first_meter_timeout_secs)
    }
    pub fn meter_stability_duration(&self) -> Duration {
        Duration::from_millis(self.meter_stability_ms)
    }
    pub fn max_interrupt_duration(&self) -> Duration {
        Duration::from_secs(self.max_interrupt_secs)
    }
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Retry count for the Interrupted recovery loop: the explicit ceiling
    /// divided by the retry interval, never zero.
    pub fn interrupt_retries(&self) -> u32 {
        let interval = self.rfid_retry_interval_secs.max(1);
        ((self.max_interrupt_secs / interval) as u32).max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nozzle_id: "0076".to_string(),
            tank_id: 1,
            serial: SerialConfig::default(),
            directory: DirectoryConfig::default(),
            api: ApiConfig::default(),
            store_path: PathBuf::from("fuelvisor-store.json"),
            uart_response_timeout_secs: 5,
            rfid_retry_interval_secs: 5,
            rfid_total_budget_secs: 180,
            drf_submit_timeout_secs: 120,
            nozzle_heartbeat_budget_secs: 40,
            board_heartbeat_budget_secs: 40,
            heartbeat_probe_interval_secs: 10,
            app_comm_budget_secs: 600,
            app_inform_timeout_secs: 10,
            meter_read_timeout_secs: 5,
            first_meter_timeout_secs: 2,
            first_meter_retries: 150,
            dispense_meter_retries: 5,
            final_meter_retries: 2,
            meter_stability_window: 2,
            meter_stability_ms: 5000,
            persist_step_liters: Decimal::ONE,
            max_rfid_retries: 100,
            tag_match_retries: 60,
            max_interrupt_secs: 180,
            tick_interval_ms: 1000,
        }
    }
}

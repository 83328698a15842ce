use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

use crate::engine::machine::MachineSettings;
use crate::engine::sync::SyncPolicy;
use crate::engine::throttle::Backoff;
use crate::error::AppError;
use crate::models::driver::VehicleType;
use crate::runtime::RuntimeSettings;
use crate::session::SessionSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub driver_id: String,
    pub auth_token: String,
    pub socket_url: String,
    pub api_base_url: String,
    pub state_dir: PathBuf,
    pub vehicle_type: Option<VehicleType>,
    pub pickup_location: Option<String>,
    pub action_timeout_secs: i64,
    pub completion_display_secs: i64,
    pub notice_ttl_secs: i64,
    pub sync_interval_secs: u64,
    pub sync_otp_suppression_secs: i64,
    pub sync_min_interval_secs: i64,
    pub sync_debounce_ms: i64,
    pub sync_max_per_minute: usize,
    pub sync_max_retries: u32,
    pub reconnect_max_retries: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_settle_ms: u64,
    pub location_min_interval_secs: i64,
    pub location_min_distance_m: f64,
    pub event_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 4100)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            driver_id: required("DRIVER_ID")?,
            auth_token: required("AUTH_TOKEN")?,
            socket_url: env::var("SOCKET_URL")
                .unwrap_or_else(|_| "ws://localhost:5000/socket".to_string()),
            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5000/api".to_string()),
            state_dir: env::var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".ride-dispatch")),
            vehicle_type: parse_optional("VEHICLE_TYPE")?,
            pickup_location: env::var("PICKUP_LOCATION")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            action_timeout_secs: parse_or_default("ACTION_TIMEOUT_SECS", 10)?,
            completion_display_secs: parse_or_default("COMPLETION_DISPLAY_SECS", 5)?,
            notice_ttl_secs: parse_or_default("NOTICE_TTL_SECS", 4)?,
            sync_interval_secs: parse_or_default("SYNC_INTERVAL_SECS", 20)?,
            sync_otp_suppression_secs: parse_or_default("SYNC_OTP_SUPPRESSION_SECS", 60)?,
            sync_min_interval_secs: parse_or_default("SYNC_MIN_INTERVAL_SECS", 5)?,
            sync_debounce_ms: parse_or_default("SYNC_DEBOUNCE_MS", 1500)?,
            sync_max_per_minute: parse_or_default("SYNC_MAX_PER_MINUTE", 6)?,
            sync_max_retries: parse_or_default("SYNC_MAX_RETRIES", 3)?,
            reconnect_max_retries: parse_or_default("RECONNECT_MAX_RETRIES", 10)?,
            reconnect_initial_ms: parse_or_default("RECONNECT_INITIAL_MS", 1000)?,
            reconnect_max_ms: parse_or_default("RECONNECT_MAX_MS", 30_000)?,
            reconnect_settle_ms: parse_or_default("RECONNECT_SETTLE_MS", 2000)?,
            location_min_interval_secs: parse_or_default("LOCATION_MIN_INTERVAL_SECS", 5)?,
            location_min_distance_m: parse_or_default("LOCATION_MIN_DISTANCE_M", 25.0)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 256)?,
        })
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            factor: 2.0,
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_retries,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            machine: MachineSettings {
                action_timeout: TimeDelta::seconds(self.action_timeout_secs),
                completion_display: TimeDelta::seconds(self.completion_display_secs),
                notice_ttl: TimeDelta::seconds(self.notice_ttl_secs),
                ..MachineSettings::default()
            },
            sync: SyncPolicy {
                min_interval: TimeDelta::seconds(self.sync_min_interval_secs),
                otp_suppression: TimeDelta::seconds(self.sync_otp_suppression_secs),
                debounce: TimeDelta::milliseconds(self.sync_debounce_ms),
                max_per_minute: self.sync_max_per_minute,
            },
            sync_retry: Backoff {
                max_attempts: self.sync_max_retries,
                ..Backoff::default()
            },
            location_min_interval: TimeDelta::seconds(self.location_min_interval_secs),
            location_min_distance_m: self.location_min_distance_m,
            vehicle_type: self.vehicle_type,
            pickup_location: self.pickup_location.clone(),
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            reconnect_settle: Duration::from_millis(self.reconnect_settle_ms),
            ..RuntimeSettings::default()
        }
    }
}

fn required(key: &str) -> Result<String, AppError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AppError::Internal(format!("missing {key}"))),
    }
}

fn parse_optional<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        _ => Ok(None),
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

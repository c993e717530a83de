//! Configuration module for billing-engine.

use crate::engine::EngineSettings;
use crate::gateway::HttpGatewayConfig;
use chrono::NaiveTime;
use secrecy::Secret;
use service_core::config::{self as core_config, env_flag, env_or};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Daily fire time, UTC.
    pub run_at: NaiveTime,
    pub dry_run: bool,
    pub stale_run_after_hours: i64,
    pub failure_alert_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Http,
    Stub,
}

impl GatewayKind {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(GatewayKind::Http),
            "stub" => Ok(GatewayKind::Stub),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "GATEWAY_KIND must be http or stub, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub base_url: String,
    pub api_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub timeout_secs: u64,
    pub max_network_retries: u32,
}

impl GatewayConfig {
    pub fn http_config(&self) -> HttpGatewayConfig {
        HttpGatewayConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            webhook_secret: self.webhook_secret.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_network_retries: self.max_network_retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub queue_size: usize,
    pub timeout_secs: u64,
}

/// Parse an `HH:MM` UTC time of day.
pub fn parse_run_at(s: &str) -> Result<NaiveTime, AppError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "BILLING_RUN_AT must be HH:MM, got {:?}: {}",
            s,
            e
        ))
    })
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "billing-engine".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: optional_var("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            scheduler: SchedulerConfig {
                enabled: env_flag("BILLING_SCHEDULER_ENABLED", true)?,
                run_at: parse_run_at(
                    &env::var("BILLING_RUN_AT").unwrap_or_else(|_| "03:00".to_string()),
                )?,
                dry_run: env_flag("BILLING_DRY_RUN", false)?,
                stale_run_after_hours: env_or("BILLING_STALE_RUN_HOURS", 6)?,
                failure_alert_ratio: env_or("BILLING_FAILURE_ALERT_RATIO", 0.25)?,
            },
            gateway: GatewayConfig {
                kind: GatewayKind::parse(
                    &env::var("GATEWAY_KIND").unwrap_or_else(|_| "http".to_string()),
                )?,
                base_url: env::var("GATEWAY_BASE_URL").unwrap_or_default(),
                api_key: Secret::new(env::var("GATEWAY_API_KEY").unwrap_or_default()),
                webhook_secret: Secret::new(env::var("GATEWAY_WEBHOOK_SECRET").unwrap_or_default()),
                timeout_secs: env_or("GATEWAY_TIMEOUT_SECS", 30)?,
                max_network_retries: env_or("GATEWAY_MAX_NETWORK_RETRIES", 2)?,
            },
            notifications: NotificationConfig {
                webhook_url: optional_var("NOTIFICATION_WEBHOOK_URL"),
                queue_size: env_or("NOTIFICATION_QUEUE_SIZE", 1024)?,
                timeout_secs: env_or("NOTIFICATION_TIMEOUT_SECS", 10)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.scheduler.stale_run_after_hours < 1 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_STALE_RUN_HOURS must be at least 1"
            )));
        }
        if !(0.0..=1.0).contains(&self.scheduler.failure_alert_ratio) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_FAILURE_ALERT_RATIO must be between 0 and 1"
            )));
        }
        if self.gateway.kind == GatewayKind::Http && self.gateway.base_url.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "GATEWAY_BASE_URL is required for the http gateway"
            )));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            stale_run_after: chrono::Duration::hours(self.scheduler.stale_run_after_hours),
            failure_alert_ratio: self.scheduler.failure_alert_ratio,
        }
    }
}

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use psfleet_reconcile::{CapacityPolicy, Track, TrackPolicy, DEFAULT_TICK_INTERVAL};

use crate::db::DbConfig;
use crate::provider::{LaunchTemplate, ProviderSettings, StaticCredentials, TrackTemplates};
use crate::scheduler::ReconcilerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub environment: String,
    pub dev_mode: bool,
    pub tick_interval: Duration,
    pub database: DbConfig,
    pub policy: CapacityPolicy,
    pub templates: TrackTemplates,
    pub instance_port: u16,
    pub provider: ProviderSettings,
    pub credentials: Option<StaticCredentials>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any key/value source. Invalid values
    /// are errors; only absent ones fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let environment = lookup("FLEET_ENVIRONMENT").unwrap_or_else(|| "dev".to_string());

        let dev_mode = flag(&lookup, "FLEET_DEV", false);

        let tick_interval = Duration::from_secs(parse_or(
            &lookup,
            "FLEET_TICK_INTERVAL_SECS",
            DEFAULT_TICK_INTERVAL.as_secs(),
        )?);
        if tick_interval.is_zero() {
            bail!("FLEET_TICK_INTERVAL_SECS must be positive");
        }

        let defaults = CapacityPolicy::default();
        let policy = CapacityPolicy {
            spot: TrackPolicy {
                free_target: parse_or(&lookup, "FLEET_SPOT_FREE_TARGET", defaults.spot.free_target)?,
                stopped_target: 0,
            },
            on_demand: TrackPolicy {
                free_target: parse_or(
                    &lookup,
                    "FLEET_ON_DEMAND_FREE_TARGET",
                    defaults.on_demand.free_target,
                )?,
                stopped_target: parse_or(
                    &lookup,
                    "FLEET_ON_DEMAND_STOPPED_TARGET",
                    defaults.on_demand.stopped_target,
                )?,
            },
        };

        let instance_type =
            lookup("FLEET_INSTANCE_TYPE").unwrap_or_else(|| "g5.xlarge".to_string());
        let key_name = lookup("FLEET_KEY_NAME").filter(|v| !v.trim().is_empty());
        let name_prefix =
            lookup("FLEET_NAME_TAG_PREFIX").unwrap_or_else(|| "PixelStreaming".to_string());

        let template = |track: Track, image_var: &str, template_var: &str| -> Result<LaunchTemplate> {
            Ok(LaunchTemplate {
                track,
                image_id: required(&lookup, image_var)?,
                launch_template_id: required(&lookup, template_var)?,
                instance_type: instance_type.clone(),
                key_name: key_name.clone(),
                name_tag: format!("{name_prefix}-{}", tag_suffix(track)),
            })
        };
        let templates = TrackTemplates {
            spot: template(
                Track::Spot,
                "FLEET_SPOT_IMAGE_ID",
                "FLEET_SPOT_LAUNCH_TEMPLATE_ID",
            )?,
            on_demand: template(
                Track::OnDemand,
                "FLEET_ON_DEMAND_IMAGE_ID",
                "FLEET_ON_DEMAND_LAUNCH_TEMPLATE_ID",
            )?,
        };

        let instance_port = parse_or(&lookup, "FLEET_INSTANCE_PORT", 80u16)?;

        let provider = ProviderSettings {
            dry_run_probe: flag(&lookup, "PROVIDER_DRY_RUN_PROBE", true),
            call_timeout: Duration::from_secs(parse_or(&lookup, "PROVIDER_CALL_TIMEOUT_SECS", 30)?),
        };
        if provider.call_timeout.is_zero() {
            bail!("PROVIDER_CALL_TIMEOUT_SECS must be positive");
        }

        let credentials = match (lookup("AWS_ACCESS_KEY"), lookup("AWS_SECRET_KEY")) {
            (Some(access_key), Some(secret_key)) => Some(StaticCredentials {
                access_key,
                secret_key,
            }),
            (None, None) => None,
            _ => bail!("AWS_ACCESS_KEY and AWS_SECRET_KEY must be set together"),
        };

        let mut database = DbConfig::from_lookup(&lookup)?;
        database.statement_logging = environment != "prod";
        database.query_timeout =
            Duration::from_secs(parse_or(&lookup, "LEDGER_QUERY_TIMEOUT_SECS", 10)?);
        if database.query_timeout.is_zero() {
            bail!("LEDGER_QUERY_TIMEOUT_SECS must be positive");
        }

        Ok(Self {
            log_level,
            environment,
            dev_mode,
            tick_interval,
            database,
            policy,
            templates,
            instance_port,
            provider,
            credentials,
        })
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            policy: self.policy,
            templates: self.templates.clone(),
            instance_port: self.instance_port,
        }
    }
}

fn tag_suffix(track: Track) -> &'static str {
    match track {
        Track::Spot => "Spot",
        Track::OnDemand => "OnDemand",
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{name} must be set"))
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        None => Ok(default),
    }
}

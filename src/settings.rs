use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::pipeline::PipelineConfig;

const CONFIG_FILE: &str = "wipe_scraper";
const ENV_PREFIX: &str = "WIPES";

/// Runtime settings: defaults, then `wipe_scraper.toml`, then `WIPES_*` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,
    pub api_base_url: String,
    pub country: String,
    pub distance: u32,
    pub min_players: u32,
    pub page_size: u32,
    pub min_rank: i64,
    /// 0 disables the age check.
    pub max_days_old: i64,
    pub page_delay_secs: u64,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::build(Environment::with_prefix(ENV_PREFIX))
    }

    fn build(env: Environment) -> Result<Self> {
        let settings = Config::builder()
            .set_default("db_path", "data/wipes.sqlite")?
            .set_default("api_base_url", "https://api.battlemetrics.com/servers")?
            .set_default("country", "US")?
            .set_default("distance", 5000)?
            .set_default("min_players", 0)?
            .set_default("page_size", 25)?
            .set_default("min_rank", 5000)?
            .set_default("max_days_old", 150)?
            .set_default("page_delay_secs", 5)?
            .set_default("interval_secs", 5)?
            .set_default("request_timeout_secs", 30)?
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(env.try_parsing(true))
            .build()
            .context("Failed to load settings")?;
        settings
            .try_deserialize()
            .context("Invalid settings")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            country: self.country.clone(),
            distance: self.distance,
            min_players: self.min_players,
            page_size: self.page_size,
            min_rank: self.min_rank,
            max_days_old: (self.max_days_old > 0).then_some(self.max_days_old),
            page_delay: Duration::from_secs(self.page_delay_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

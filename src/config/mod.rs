use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// Application settings: where the per-symbol stores live and which
/// endpoints the fetcher talks to. Loaded from an optional TOML file with
/// `QUANTBOT_*` environment overrides on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    pub archive_base_url: String,
    pub spot_api_url: String,
    pub futures_api_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            archive_base_url: "https://data.binance.vision/data".to_string(),
            spot_api_url: "https://api.binance.com".to_string(),
            futures_api_url: "https://fapi.binance.com".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("data_dir", defaults.data_dir.clone())
            .and_then(|b| b.set_default("archive_base_url", defaults.archive_base_url.clone()))
            .and_then(|b| b.set_default("spot_api_url", defaults.spot_api_url.clone()))
            .and_then(|b| b.set_default("futures_api_url", defaults.futures_api_url.clone()))
            .map_err(|e| QuantError::Config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(false));
        }

        builder
            .add_source(Environment::with_prefix("QUANTBOT"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuantError::Config(e.to_string()))
    }
}

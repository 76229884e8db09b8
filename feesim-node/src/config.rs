use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use collect::corerpc::CoreRpcConfig;
use collect::CollectorConfig;
use estimate::{IndBlockSourceConfig, MultiTxSourceConfig, UniTxSourceConfig};
use predict::PredictorConfig;
use sim::TransientConfig;

pub const CONFIG_FILE_ENV: &str = "FEESIM_CONFIG";
pub const DATA_DIR_ENV: &str = "FEESIM_DATADIR";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Which arrival-model estimator drives the tx source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxSourceModel {
    Uniform,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collect: CollectorConfig,
    pub transient: TransientConfig,
    pub predict: PredictorConfig,
    /// Seconds between transient sim runs.
    pub sim_period: u64,
    /// Observed txs older than this are compacted away, seconds.
    pub tx_max_age: i64,
    /// Max gap between stored txs and the wall clock before the store is
    /// discarded at startup, seconds.
    pub tx_gap_tol: i64,
    pub txsource_model: TxSourceModel,
    pub unitx: UniTxSourceConfig,
    pub multitx: MultiTxSourceConfig,
    pub indblock: IndBlockSourceConfig,
    pub bitcoin_rpc: CoreRpcConfig,
    pub app_rpc: AppRpcConfig,
    pub datadir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppRpcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for AppRpcConfig {
    fn default() -> Self {
        AppRpcConfig {
            host: "localhost".to_string(),
            port: 8350,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            collect: CollectorConfig::default(),
            transient: TransientConfig::default(),
            predict: PredictorConfig::default(),
            sim_period: 60,
            tx_max_age: 10800, // 3 hours
            tx_gap_tol: 3600,  // 1 hour
            txsource_model: TxSourceModel::Uniform,
            unitx: UniTxSourceConfig::default(),
            multitx: MultiTxSourceConfig::default(),
            indblock: IndBlockSourceConfig::default(),
            bitcoin_rpc: CoreRpcConfig::default(),
            app_rpc: AppRpcConfig::default(),
            datadir: default_datadir(),
        }
    }
}

impl Config {
    /// Load the config. Explicit paths win over env vars, which win over the
    /// default locations; a missing default config file is not an error.
    pub fn load(config_file: Option<PathBuf>, datadir: Option<PathBuf>) -> Result<Config> {
        let config_file = config_file.or_else(|| std::env::var(CONFIG_FILE_ENV).ok().map(Into::into));
        let datadir = datadir.or_else(|| std::env::var(DATA_DIR_ENV).ok().map(Into::into));

        let mut cfg = match &config_file {
            Some(path) => Config::from_file(path)?,
            None => {
                let dir = datadir.clone().unwrap_or_else(default_datadir);
                let path = dir.join(CONFIG_FILE_NAME);
                if path.exists() {
                    Config::from_file(&path)?
                } else {
                    Config::default()
                }
            }
        };

        if let Some(dir) = datadir {
            cfg.datadir = dir;
        }
        std::fs::create_dir_all(&cfg.datadir)
            .with_context(|| format!("creating datadir {}", cfg.datadir.display()))?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents).context("parsing config file")
    }

    pub fn db_path(&self) -> PathBuf {
        self.datadir.join("feesim.db")
    }
}

fn default_datadir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".feesim"))
        .unwrap_or_else(|_| PathBuf::from("./feesim-data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let cfg = Config::default();
        assert_eq!(cfg.collect.poll_period, 10);
        assert_eq!(cfg.sim_period, 60);
        assert_eq!(cfg.transient.max_block_confirms, 12);
        assert_eq!(cfg.transient.num_iters, 10000);
        assert_eq!(cfg.predict.max_block_confirms, 6);
        assert_eq!(cfg.predict.halflife, 1008);
        assert_eq!(cfg.unitx.min_window, 600);
        assert_eq!(cfg.indblock.window, 2016);
        assert_eq!(cfg.tx_max_age, 10800);
        assert_eq!(cfg.txsource_model, TxSourceModel::Uniform);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
sim_period = 30
txsource_model = "weighted"

[transient]
maxblockconfirms = 18
numiters = 2000

[indblock]
mincov = 0.25
"#,
        )
        .unwrap();
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.sim_period, 30);
        assert_eq!(cfg.txsource_model, TxSourceModel::Weighted);
        assert_eq!(cfg.transient.max_block_confirms, 18);
        assert_eq!(cfg.transient.num_iters, 2000);
        assert_eq!(cfg.transient.min_success_pct, 0.9);
        assert_eq!(cfg.indblock.min_cov, 0.25);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.collect.poll_period, 10);
    }
}

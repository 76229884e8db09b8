use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use collect::corerpc::{CoreRpcClient, CoreRpcStateGetter};
use estimate::UniTxSourceEstimator;
use feesim_node::config::{Config, TxSourceModel};
use feesim_node::feesim::{FeeSim, TxEstimator};
use feesim_node::service::Service;

#[derive(Parser)]
#[command(name = "feesim-node")]
#[command(about = "Mempool-simulation fee estimator daemon", long_about = None)]
struct Cli {
    /// Configuration file path (alternatively, use the FEESIM_CONFIG env
    /// var)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory path (alternatively, use the FEESIM_DATADIR env var)
    #[arg(short, long, value_name = "DIR")]
    datadir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let reload_handle = init_logging(cli.debug)?;

    let cfg = Config::load(cli.config, cli.datadir)?;
    info!("feesim-node starting, datadir {}", cfg.datadir.display());

    let db = Arc::new(storage::Database::open(cfg.db_path())?);

    let rpc_client = Arc::new(
        CoreRpcClient::connect(cfg.bitcoin_rpc.clone())
            .await
            .context("connecting to bitcoind")?,
    );
    let state_getter = Arc::new(CoreRpcStateGetter::new(Arc::clone(&rpc_client)));

    let tx_estimator = match cfg.txsource_model {
        TxSourceModel::Uniform => TxEstimator::Uniform(UniTxSourceEstimator::new(
            Arc::new(db.tx_store()?),
            cfg.unitx,
            rand::rngs::StdRng::seed_from_u64(rand::random()),
        )),
        TxSourceModel::Weighted => TxEstimator::Weighted {
            cfg: cfg.multitx,
            db: Arc::new(db.tx_store()?),
            rng: rand::rngs::StdRng::seed_from_u64(rand::random()),
        },
    };

    let feesim = Arc::new(FeeSim::new(
        Arc::clone(&db),
        state_getter,
        rpc_client,
        tx_estimator,
        cfg.clone(),
    )?);

    let svc = Arc::new(Service {
        feesim: Arc::clone(&feesim),
        cfg,
        set_debug: Box::new(move |on| {
            let filter = if on { "debug" } else { "info" };
            if let Err(e) = reload_handle.reload(EnvFilter::new(filter)) {
                error!("log filter reload: {e}");
            }
        }),
    });
    tokio::spawn(async move {
        if let Err(e) = svc.listen_and_serve().await {
            error!("RPC service: {e:#}");
        }
    });

    let mut runner = {
        let feesim = Arc::clone(&feesim);
        tokio::spawn(feesim.run())
    };

    tokio::select! {
        result = &mut runner => {
            result.context("feesim task")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            feesim.stop();
            runner.await.context("feesim task")??;
        }
    }

    info!("feesim-node stopped");
    Ok(())
}

fn init_logging(debug: bool) -> Result<reload::Handle<EnvFilter, Registry>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(handle)
}

// Native-messaging host running the privileged side of the bridge.
//
// The browser starts this process and exchanges length-prefixed JSON frames on stdin/stdout,
// so logging goes to stderr.

use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use futures::channel::mpsc;
use zeroize::Zeroizing;

use wallet_bridge_lib::adapters::AdapterSet;
use wallet_bridge_lib::config::BridgeConfig;
use wallet_bridge_lib::native_messaging::RoutedEnvelope;
use wallet_bridge_lib::{
    channel_transport, init_config, ApprovalPrompt, BackgroundService, BitcoinNetwork,
    BridgeError, BridgeResult, Environment, FileStore, HttpLightningAdapter, HttpSparkAdapter,
    InMemoryLightning, InMemorySpark, NativeMessagingCodec, NetworkRegistry, RpcDispatcher,
    SessionManager, StaticApproval,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        log::error!("wallet bridge host failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> BridgeResult<()> {
    let config_path = std::env::var_os("BRIDGE_CONFIG_PATH").map(PathBuf::from);
    let config = init_config(config_path.as_deref())?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .target(env_logger::Target::Stderr)
        .init();

    // Browsers pass the calling extension origin as the first argument.
    if let Some(caller) = std::env::args().nth(1) {
        log::info!("started by {}", caller);
    }

    let dispatcher = build_dispatcher(config)?;
    let (transport, outbox) = channel_transport();
    let service = BackgroundService::new(Arc::new(dispatcher), transport)
        .with_request_timeout(config.transport.request_timeout())
        .with_idle_timeout(config.session.timeout());

    let writer = thread::spawn(move || {
        let codec = NativeMessagingCodec;
        let mut stdout = BufWriter::new(io::stdout());
        for (route, envelope) in futures::executor::block_on_stream(outbox) {
            if let Err(e) = codec.write_routed(&mut stdout, &RoutedEnvelope { route, envelope }) {
                log::error!("failed to write frame: {}", e);
                if e == BridgeError::TransportClosed {
                    break;
                }
            }
        }
    });

    let (inbound, frames) = mpsc::unbounded();
    thread::spawn(move || {
        let codec = NativeMessagingCodec;
        let stdin = io::stdin();
        let mut reader = stdin.lock();
        if let Err(e) = codec.pump_frames(&mut reader, |frame| inbound.unbounded_send(frame).is_ok()) {
            log::error!("stopped reading frames: {}", e);
        }
        log::info!("stdin closed");
    });

    service.run(frames).await;
    drop(service);

    tokio::task::spawn_blocking(move || writer.join())
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?
        .map_err(|_| BridgeError::Internal("writer thread panicked".to_string()))?;
    Ok(())
}

fn build_dispatcher(config: &BridgeConfig) -> BridgeResult<RpcDispatcher> {
    let adapters = match (
        &config.backends.lightning_endpoint,
        &config.backends.spark_endpoint,
    ) {
        (Some(lightning), Some(spark)) => AdapterSet::new(
            HttpLightningAdapter::new(lightning.as_str())?,
            HttpSparkAdapter::new(spark.as_str())?,
        ),
        _ => {
            log::warn!("no wallet backends configured, using in-memory regtest adapters");
            AdapterSet::new(
                InMemoryLightning::new(BitcoinNetwork::Regtest, 0),
                InMemorySpark::new(BitcoinNetwork::Regtest, 0),
            )
        }
    };

    let networks = match std::env::var_os("BRIDGE_NETWORKS_PATH") {
        Some(path) => NetworkRegistry::load(Path::new(&path))?,
        None => NetworkRegistry::with_defaults(),
    };

    let data_dir = std::env::var_os("BRIDGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wallet-bridge-data"));
    let store = FileStore::open(data_dir.join("permissions.json"))?;

    let session = SessionManager::new(config.session.timeout());
    if let Some(seed) = seed_from_env()? {
        session.unlock(&seed);
    }

    let approvals: Arc<dyn ApprovalPrompt> = match config.environment {
        Environment::Production => Arc::new(StaticApproval::deny()),
        _ => {
            log::warn!("approving wallet prompts automatically outside production");
            Arc::new(StaticApproval::allow())
        }
    };

    RpcDispatcher::new(
        adapters,
        Arc::new(session),
        approvals,
        Arc::new(store),
        Arc::new(networks),
    )
    .with_retry(config.retry)
    .with_active_chain(config.default_chain_id)
}

fn seed_from_env() -> BridgeResult<Option<Zeroizing<[u8; 32]>>> {
    let Some(raw) = std::env::var("BRIDGE_WALLET_SEED").ok().map(Zeroizing::new) else {
        return Ok(None);
    };
    let bytes = Zeroizing::new(
        hex::decode(raw.trim().trim_start_matches("0x"))
            .map_err(|e| BridgeError::ValidationError(format!("BRIDGE_WALLET_SEED: {}", e)))?,
    );
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        BridgeError::ValidationError("BRIDGE_WALLET_SEED must be 32 bytes".to_string())
    })?;
    Ok(Some(Zeroizing::new(seed)))
}

//! store-tail: diagnostic tail of a realtime store session
//!
//! Connects one session with the configured branch and module, logs every
//! bus notification, and disconnects on Ctrl-C.
//!
//! ## Configuration
//! - First argument: configuration file (optional, see `StoreConfig::load`)
//! - REALTIME_STORE_LOG: tracing filter (default: info)
//! - REALTIME_STORE_CACHE_DIR: directory for a file cache (optional)

use std::sync::Arc;

use tracing::{error, info, warn};

use realtime_store::cache::FileCache;
use realtime_store::transport::WebSocketConnector;
use realtime_store::utils::bootstrap::init_tracing;
use realtime_store::{Channel, Notification, StoreConfig, SyncSession};

const CACHE_DIR_ENV_VAR: &str = "REALTIME_STORE_CACHE_DIR";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = StoreConfig::load(path.as_deref())?;
    let connector = WebSocketConnector::new(config.session.url.clone());

    let mut builder = SyncSession::builder(config, connector);
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV_VAR) {
        info!(dir = %dir, "Using file cache");
        builder = builder.cache(Arc::new(FileCache::new(dir)));
    }
    let session = builder.build();

    for channel in Channel::ALL {
        session.bus().on(channel, move |notification| {
            log_notification(channel, notification);
            Ok(())
        });
    }

    info!(
        url = %session.config().session.url,
        branch_id = %session.branch_id(),
        module_id = %session.module_id(),
        "store-tail started"
    );

    tokio::select! {
        connected = session.connect() => match connected {
            Ok(modules) => {
                for (module_id, module) in &modules {
                    info!(
                        module_id = %module_id,
                        version = ?module.version,
                        tables = module.tables.len(),
                        "Module ready"
                    );
                }
            }
            Err(e) => error!(error = %e, "Session never became ready"),
        },
        _ = tokio::signal::ctrl_c() => {
            session.disconnect().await;
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    session.disconnect().await;
    info!("store-tail stopped");
    Ok(())
}

fn log_notification(channel: Channel, notification: &Notification) {
    match notification {
        Notification::Status(update) => info!(
            channel = %channel,
            status = %update.status,
            delay = ?update.reconnect_delay,
            detail = ?update.detail,
            "Status"
        ),
        Notification::Error(report) => warn!(
            channel = %channel,
            kind = %report.kind,
            context = ?report.context,
            "{}",
            report.message
        ),
        Notification::Event(event) => info!(
            channel = %channel,
            module_id = ?event.module_id,
            table = %event.table,
            action = %event.action,
            sequence = ?event.sequence,
            "Event"
        ),
        Notification::StateChange(change) => info!(
            channel = %channel,
            reason = ?change.reason,
            module_id = ?change.module_id,
            table = ?change.table,
            "State changed"
        ),
        Notification::Ack(ack) => info!(channel = %channel, request_id = ?ack.request_id, "Ack"),
        Notification::Cache(notice) => info!(
            channel = %channel,
            module_id = %notice.module_id,
            op = ?notice.op,
            outcome = ?notice.outcome,
            "Cache"
        ),
        Notification::Snapshot(snapshot) => info!(
            channel = %channel,
            modules = snapshot.modules.len(),
            "Snapshot"
        ),
        Notification::Log(log) => info!(channel = %channel, context = ?log.context, "{}", log.message),
        Notification::Hello(frame) | Notification::Directive(frame) => {
            info!(channel = %channel, frame = %frame, "Frame")
        }
    }
}

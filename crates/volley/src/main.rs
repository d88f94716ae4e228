use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use volley_core::{
    config::Config,
    coordinator::{AuthState, SessionCoordinator},
    dispatch::Dispatcher,
    monitor::{MonitorConfig, ReplyMonitor},
    provider::gateway::ClientGateway,
    provider::port::SessionStore,
    provider::store::FileSessionStore,
};
use volley_telegram::TelegramProvider;

#[tokio::main]
async fn main() -> Result<(), volley_core::Error> {
    volley_core::logging::init("volley")?;

    let cfg = Config::load()?;

    let store = Arc::new(FileSessionStore::new(&cfg.session_file));
    let saved = match store.load() {
        Ok(saved) => saved,
        Err(err) => {
            warn!(error = %err, "could not read stored session, connecting fresh");
            None
        }
    };

    let provider = Arc::new(
        TelegramProvider::connect(
            cfg.api_id,
            &cfg.api_hash,
            saved.as_ref(),
            cfg.monitor_fetch_limit,
        )
        .await?,
    );

    let gateway = Arc::new(ClientGateway::new(provider.clone()));
    let auth = Arc::new(Mutex::new(AuthState::default()));
    let dispatcher = Arc::new(Dispatcher::new(
        gateway.clone(),
        auth.clone(),
        cfg.send_delay,
    ));
    let monitor = ReplyMonitor::new(
        gateway,
        auth.clone(),
        MonitorConfig {
            poll_interval: cfg.monitor_poll_interval,
            group_scan_limit: cfg.group_scan_limit,
            auto_reply_text: cfg.auto_reply_text.clone(),
        },
    );

    let coordinator = Arc::new(SessionCoordinator::new(
        provider,
        store,
        auth,
        dispatcher,
        monitor,
    ));
    coordinator.restore().await;

    volley_http::serve(&cfg.http_bind, coordinator)
        .await
        .map_err(|e| volley_core::Error::External(format!("http server failed: {e}")))?;

    Ok(())
}

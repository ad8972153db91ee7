use std::sync::Arc;

use rocket::launch;
use tracing::{error, info, warn};

use chatbot_server::engine::CandleLoader;
use chatbot_server::{build_rocket, logging, AppConfig, AppState, ModelSession};

#[launch]
async fn rocket() -> _ {
    let config = AppConfig::from_env();
    logging::init(&config);

    info!("Starting chatbot server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.model.model_name,
        cache_dir = ?config.model.cache_dir,
        device = ?config.model.device,
        "model configuration"
    );
    info!("Bind address: {}", config.bind_address());
    info!(
        log_file = ?config.log_file,
        request_timeout = ?config.request_timeout,
        "server configuration"
    );

    let session = Arc::new(ModelSession::new(
        config.model.clone(),
        Box::new(CandleLoader),
    ));

    // 加载失败不退出：/health 和 / 照常服务，chat 接口返回 503
    let loader = session.clone();
    match rocket::tokio::task::spawn_blocking(move || loader.load()).await {
        Ok(true) => info!("model loaded, chat endpoints ready"),
        Ok(false) => warn!("model failed to load; serving in degraded mode"),
        Err(e) => error!("model load task failed: {e}; serving in degraded mode"),
    }

    build_rocket(AppState::new(config, session))
}

use std::sync::Arc;

use crate::chat::ChatHandler;
use crate::config::AppConfig;
use crate::session::ModelSession;
use crate::types::{HealthResponse, ModelStatus};

/// 全局共享状态（Rocket managed state）：
/// - config: 启动时读取的配置，只读
/// - session: 唯一的模型会话
/// - chat: 注入了 session 的请求处理器
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub session: Arc<ModelSession>,
    pub chat: ChatHandler,
}

impl AppState {
    pub fn new(config: AppConfig, session: Arc<ModelSession>) -> Self {
        let chat = ChatHandler::new(session.clone(), &config);
        Self {
            config: Arc::new(config),
            session,
            chat,
        }
    }

    pub fn health(&self) -> HealthResponse {
        let (model_status, message) = match self.session.model_name() {
            Some(name) => (
                ModelStatus::Loaded,
                format!("Chatbot is running with model `{name}`"),
            ),
            None => (
                ModelStatus::NotLoaded,
                "Model is not loaded; chat endpoints are unavailable until a reload succeeds"
                    .to_string(),
            ),
        };

        HealthResponse {
            status: "healthy".to_string(),
            model_status,
            message,
        }
    }
}

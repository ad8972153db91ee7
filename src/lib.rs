//! Chatbot server
//!
//! Serves a pretrained causal language model over HTTP:
//! - `POST /chat` for a single cleaned reply
//! - `GET /chat/stream` for the same reply delivered word by word over SSE
//! - `GET /health`, `GET /`, static files and a manual model reload
//!
//! Generation is delegated to Candle; this crate owns configuration,
//! request validation, prompt shaping and the HTTP surface.

pub mod api;
pub mod app_state;
pub mod chat;
pub mod config;
pub mod cors;
pub mod engine;
pub mod error;
pub mod logging;
pub mod session;
pub mod types;

use rocket::fs::FileServer;
use rocket::{catchers, routes, Build, Rocket};

pub use app_state::AppState;
pub use config::AppConfig;
pub use error::ChatError;
pub use session::ModelSession;

/// Assembles the Rocket instance: managed state, CORS, routes, JSON error
/// catchers and static files.
pub fn build_rocket(state: AppState) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", state.config.host.clone()))
        .merge(("port", state.config.port));

    let cors = cors::Cors::new(state.config.allowed_origins.clone());
    let static_dir = state.config.static_dir.clone();

    let rocket = rocket::custom(figment)
        .manage(state)
        .attach(cors)
        .mount(
            "/",
            routes![
                api::index,
                api::health,
                api::chat,
                api::chat_stream,
                api::reload,
                api::preflight,
            ],
        )
        .register("/", catchers![api::default_catcher]);

    // 目录不存在时不挂载 /static
    if static_dir.is_dir() {
        rocket.mount("/static", FileServer::from(static_dir))
    } else {
        rocket
    }
}

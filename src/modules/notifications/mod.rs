use axum::Router;
use axum::routing::get;

use crate::state::AppState;

pub mod router;
pub mod ws_handler;

pub use router::NotificationRouter;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler::ws_handler))
}

mod client_routes;
mod config;
mod errors;
mod pipeline;
mod queue_routes;
mod server;
mod state;
mod worker;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ServiceConfig, DEFAULT_BODY_MAX_BYTES};
pub use errors::ApiError;
pub use pipeline::{Pipeline, PipelineError};
pub use server::{build_router, run_server};
pub use state::AppState;
pub use worker::{start_worker, WorkerControl};

pub mod analytics;
pub mod handlers;
pub mod health;
pub mod response;
pub mod routes;
pub mod static_files;

pub use handlers::single_param;
pub use response::{ApiError, ApiResponse, ApiResult};
pub use routes::create_api_router;

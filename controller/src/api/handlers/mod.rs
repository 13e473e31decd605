pub mod agents;
pub mod filters;
pub mod multiplex;
pub mod report;
pub mod uninstall;

pub use agents::*;
pub use filters::*;
pub use multiplex::*;
pub use report::*;
pub use uninstall::*;

use serde::Serialize;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> axum::response::Json<Self> {
        axum::response::Json(Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        })
    }

    pub fn error(message: String) -> axum::response::Json<Self> {
        axum::response::Json(Self {
            success: false,
            data: None,
            message,
        })
    }
}

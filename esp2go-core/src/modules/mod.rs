//! Capability modules hosted by the registry.

pub mod microphone;
pub mod ota;
pub mod storage;
pub mod system;
pub mod wifi;

pub use microphone::MicrophoneModule;
pub use ota::OtaModule;
pub use storage::StorageModule;
pub use system::SystemModule;
pub use wifi::WifiModule;

use std::io;

use crate::api::{ApiResponse, ErrorCode, ErrorResponse};

/// Envelope for store errors, keyed on the io error kind.
pub(crate) fn io_error_response(context: &str, e: &io::Error) -> ApiResponse {
    let code = match e.kind() {
        io::ErrorKind::NotFound => ErrorCode::NotFound,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorCode::BadRequest,
        io::ErrorKind::PermissionDenied => ErrorCode::Forbidden,
        io::ErrorKind::AlreadyExists => ErrorCode::Conflict,
        _ => ErrorCode::Internal,
    };
    ErrorResponse::new(code, format!("{context}: {e}")).into()
}

//! REST access to the backend.
//!
//! [`ApiClient`] is the single entry point for HTTP calls. It owns the
//! credential injection and refresh-on-401 policy; the feature services
//! (`auth`, `profile`, `social`, chat history) only describe requests.

mod error;
mod pipeline;

pub use error::{ApiError, ApiResult};
pub use pipeline::{
    ApiClient, ApiRequest, AUTH_PATH_PREFIX, DEFAULT_TIMEOUT, MultipartField, REFRESH_PATH,
    RequestBody,
};

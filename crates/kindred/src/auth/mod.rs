//! Credentials: where they live and how they are obtained.

mod service;
mod store;

pub use service::AuthService;
pub use store::{CredentialPair, CredentialStore, FileCredentialStore, MemoryCredentialStore};

//! Pure request and identity types shared by every layer.

pub mod error;
pub mod fingerprint;
pub mod request;

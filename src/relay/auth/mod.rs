//! Time-bounded HMAC credentials, issued by the server and validated by
//! whoever holds the shared secret.

pub mod hmac;

pub use hmac::{AuthToken, Generator, Validator};

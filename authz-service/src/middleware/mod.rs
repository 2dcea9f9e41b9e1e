pub mod admin;

pub use admin::{admin_key_middleware, ADMIN_API_KEY_HEADER};

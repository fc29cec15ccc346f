pub mod assert;
pub mod constants;
pub mod sha1;

pub use assert::{assert, assertion_error, fail};
pub use constants::CONSTANTS;
pub use sha1::{sha1_base64, sha1_digest};

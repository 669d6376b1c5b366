pub mod credentials;

pub use credentials::{hash_password, verify_password};

use regex::Regex;
use std::sync::OnceLock;

/// Identity names accepted by the client: the server's username alphabet.
/// Validated before a message is queued so nothing unroutable ever reaches
/// the codec.
pub fn is_valid_identity(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("valid pattern"));
    pattern.is_match(name)
}

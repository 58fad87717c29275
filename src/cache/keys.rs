//! Cache key definitions.

use crate::domain::types::UserId;

/// Prefix of registration dedupe markers. These keys are never namespaced.
pub const HAS_EMAIL_PREFIX: &str = "has_email_";

/// Logical key of a user's cached feed.
pub fn feed_key(user_id: UserId) -> String {
    format!("user:{user_id}:feed")
}

/// Physical key of a namespaced entry: the namespace is prepended without a separator.
pub fn namespaced(namespace: &str, key: &str) -> String {
    let mut full = String::with_capacity(namespace.len() + key.len());
    full.push_str(namespace);
    full.push_str(key);
    full
}

pub fn email_key(email: &str) -> String {
    format!("{HAS_EMAIL_PREFIX}{email}")
}

//! URL scheme handling.

use tracing::trace;

use super::Sender;
use crate::types::{Target, URL_PROTOCOL_DELIMITER};

/// Scheme of a URL, or `""` when it has none.
pub fn parse_protocol(url: &str) -> &str {
    url.find(URL_PROTOCOL_DELIMITER)
        .map(|idx| &url[..idx])
        .unwrap_or("")
}

/// Prepend the sender's scheme to a target URL without one.
pub fn normalize_target(sender: &dyn Sender, mut target: Target) -> Target {
    if !parse_protocol(&target.url).is_empty() {
        return target;
    }

    let security = target.security.as_ref().and_then(|s| s.kind());
    if let Some(prefix) = sender.protocol_prefix(security) {
        trace!(url = %target.url, prefix, "Prefixing target url");
        target.url = format!("{}{}", prefix, target.url);
    }
    target
}

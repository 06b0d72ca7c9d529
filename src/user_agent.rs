//! Identifying User-Agent for every outbound request.
//!
//! The product token doubles as the robots.txt agent name, so a site can
//! address rules to this harvester specifically.

/// Free-text comment describing the traffic to site operators.
const UA_COMMENT: &str = "public-document-archiver; honours robots.txt";

/// Product token used in the User-Agent and matched against robots.txt groups.
pub const PRODUCT_TOKEN: &str = "harvester";

/// Default User-Agent for all harvester traffic.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{PRODUCT_TOKEN}/{version} ({UA_COMMENT})")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_token_version_and_comment() {
        let ua = default_user_agent();
        assert!(ua.ends_with(&format!("({UA_COMMENT})")), "UA must carry the comment");
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("harvester/")
                .and_then(|s| s.split(' ').next())
                .unwrap(),
            "UA must contain crate version"
        );
    }

    #[test]
    fn test_product_token_is_lowercase_robots_name() {
        assert_eq!(PRODUCT_TOKEN, PRODUCT_TOKEN.to_ascii_lowercase());
        assert!(!PRODUCT_TOKEN.contains(' '));
    }
}

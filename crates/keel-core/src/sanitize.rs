//! Credential and name sanitation.
//!
//! Pasted-in credentials regularly carry zero-width spaces, non-breaking
//! spaces or other control codepoints that object stores reject with an
//! opaque "malformed credential" error. Sanitation runs at every boundary:
//! on create, on decrypt, and again inside the storage client.

use crate::error::{ServiceError, ServiceResult};

/// Removes all whitespace and control characters from a credential string.
pub fn sanitize_credential(cred: &str) -> String {
    cred.trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect()
}

/// Endpoints keep their interior characters; only leading/trailing
/// whitespace is removed so domain names pass through untouched.
pub fn sanitize_endpoint(endpoint: &str) -> String {
    endpoint.trim().to_string()
}

/// Sanitizes a required credential field, failing when nothing is left.
pub fn require_credential(field: &str, value: &str) -> ServiceResult<String> {
    let cleaned = sanitize_credential(value);
    if cleaned.is_empty() {
        return Err(ServiceError::InvalidCredential {
            field: field.to_string(),
        });
    }
    Ok(cleaned)
}

/// Turns a connection display name into a filesystem/object-key safe slug.
///
/// Lowercases, collapses runs of anything outside `[a-z0-9]` to `_`, trims
/// leading/trailing `_`, clamps to 200 characters and falls back to
/// `"backup"` for empty results.
pub fn sanitize_connection_name(name: &str) -> String {
    let lowered = name.to_lowercase();

    let mut slug = String::with_capacity(lowered.len());
    let mut last_was_sep = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }

    let mut slug = slug.trim_matches('_').to_string();
    if slug.len() > 200 {
        slug.truncate(200);
        slug = slug.trim_end_matches('_').to_string();
    }

    if slug.is_empty() {
        "backup".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_interior_whitespace_and_controls() {
        assert_eq!(sanitize_credential("  AKIA XYZ\t123\n"), "AKIAXYZ123");
        // Zero-width space and non-breaking space
        assert_eq!(sanitize_credential("se\u{200b}cret\u{a0}key"), "secretkey");
        assert_eq!(sanitize_credential("plain"), "plain");
    }

    #[test]
    fn sanitized_credentials_contain_no_whitespace_or_controls() {
        let cases = [" a b ", "x\u{0000}y", "\u{feff}token", "a\r\nb"];
        for case in cases {
            let cleaned = sanitize_credential(case);
            assert!(!cleaned.chars().any(|c| c.is_whitespace() || c.is_control()));
        }
    }

    #[test]
    fn endpoint_keeps_interior() {
        assert_eq!(
            sanitize_endpoint("  s3.us-west-000.backblazeb2.com "),
            "s3.us-west-000.backblazeb2.com"
        );
    }

    #[test]
    fn require_credential_rejects_empty() {
        assert!(require_credential("access_key", " \u{200b} ").is_err());
        assert_eq!(require_credential("bucket", " b ").unwrap(), "b");
    }

    #[test]
    fn connection_name_slugs() {
        assert_eq!(sanitize_connection_name("PG Prod (EU)"), "pg_prod_eu");
        assert_eq!(sanitize_connection_name("--weird--"), "weird");
        assert_eq!(sanitize_connection_name("???"), "backup");
        assert_eq!(sanitize_connection_name(""), "backup");

        let long = "a".repeat(300);
        assert_eq!(sanitize_connection_name(&long).len(), 200);
    }
}

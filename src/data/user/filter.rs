use bson::{doc, Document};
use uuid::Uuid;

use crate::role::Role;
use crate::util;

#[inline]
pub fn by_id(id: Uuid) -> Document {
    doc! { "_id": util::bson_uuid(id) }
}

#[inline]
pub fn by_email(email: impl AsRef<str>) -> Document {
    doc! { "email": email.as_ref().trim().to_lowercase() }
}

/// Matches a live (unexpired) one-time token stored under `field`.
pub fn by_token(field: &str, raw: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(format!("{}.hash", field), util::sha256_token(raw.trim()));
    filter.insert(
        format!("{}.expires", field),
        doc! { "$gt": bson::DateTime::now() },
    );
    filter
}

/// Admin listing filter. `search` matches names and email, case-insensitively.
pub fn listing(role: Option<Role>, two_factor: Option<bool>, search: Option<&str>) -> Document {
    let mut filter = Document::new();
    if let Some(role) = role {
        filter.insert("role", role);
    }
    if let Some(enabled) = two_factor {
        filter.insert("two_factor_enabled", enabled);
    }
    if let Some(search) = search.filter(|it| !it.trim().is_empty()) {
        let regex = util::escape_search(search);
        filter.insert(
            "$or",
            vec![
                doc! { "first_name": regex.clone() },
                doc! { "last_name": regex.clone() },
                doc! { "email": regex },
            ],
        );
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_filter_is_normalized() {
        assert_eq!(by_email(" Ann@Example.COM "), doc! { "email": "ann@example.com" });
    }

    #[test]
    fn empty_listing_matches_everything() {
        assert!(listing(None, None, Some("  ")).is_empty());
    }

    #[test]
    fn listing_combines_filters() {
        let filter = listing(Some(Role::Teacher), Some(false), Some("ann"));
        assert_eq!(filter.get_str("role").unwrap(), "teacher");
        assert!(!filter.get_bool("two_factor_enabled").unwrap());
        assert_eq!(filter.get_array("$or").unwrap().len(), 3);
    }

    #[test]
    fn token_filter_targets_nested_fields() {
        let filter = by_token("password_reset", "raw");
        assert_eq!(
            filter.get_str("password_reset.hash").unwrap(),
            util::sha256_token("raw")
        );
        assert!(filter.get_document("password_reset.expires").is_ok());
    }
}

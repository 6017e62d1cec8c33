use std::iter::repeat;
use std::path::{Path, PathBuf};

use base64::engine::GeneralPurpose;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub fn find_first_subpath<P: AsRef<Path>, F: Fn(&Path) -> bool>(
    root: impl AsRef<Path>,
    subpaths: &[P],
    search: F,
) -> Option<PathBuf> {
    subpaths
        .iter()
        .zip(repeat(root.as_ref()))
        .map(|(b, a)| a.join(b))
        .find(|it: &PathBuf| search(it))
}

pub fn base64_engine() -> GeneralPurpose {
    base64::engine::GeneralPurpose::new(
        &base64::alphabet::URL_SAFE,
        base64::engine::general_purpose::NO_PAD,
    )
}

/// URL safe random token with `bytes` bytes of entropy.
pub fn random_token(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    base64_engine().encode(buffer)
}

/// Stored form of one-time tokens. Raw tokens never reach the database.
pub fn sha256_token(raw: impl AsRef<[u8]>) -> String {
    base64_engine().encode(Sha256::digest(raw.as_ref()))
}

/// `<prefix>-<year>-<8 upper hex>` identifiers handed out to students and staff.
pub fn short_identifier(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        chrono::Utc::now().format("%Y"),
        id[..8].to_uppercase()
    )
}

pub fn bson_uuid(id: uuid::Uuid) -> bson::Bson {
    bson::Bson::from(bson::Uuid::from(id))
}

pub fn escape_search(search: &str) -> bson::Regex {
    bson::Regex {
        pattern: regex::escape(search.trim()),
        options: "i".to_string(),
    }
}

/// Serde helpers for UUID containers stored as BSON binary subtype 4.
pub mod serde_uuid {
    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use uuid::Uuid;

        pub fn serialize<S: Serializer>(value: &Option<Uuid>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(id) => bson::Uuid::from(*id).serialize(s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Uuid>, D::Error> {
            Ok(Option::<bson::Uuid>::deserialize(d)?.map(Uuid::from))
        }
    }

    pub mod vec {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use uuid::Uuid;

        pub fn serialize<S: Serializer>(value: &[Uuid], s: S) -> Result<S::Ok, S::Error> {
            value
                .iter()
                .map(|id| bson::Uuid::from(*id))
                .collect::<Vec<_>>()
                .serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Uuid>, D::Error> {
            Ok(Vec::<bson::Uuid>::deserialize(d)?
                .into_iter()
                .map(Uuid::from)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_are_url_safe_and_unique() {
        let a = random_token(32);
        let b = random_token(32);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn token_hash_is_stable() {
        assert_eq!(sha256_token("abc"), sha256_token("abc"));
        assert_ne!(sha256_token("abc"), sha256_token("abd"));
    }

    #[test]
    fn short_identifier_shape() {
        let id = short_identifier("STU");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "STU");
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 8);
        assert_eq!(parts[2], parts[2].to_uppercase());
    }

    #[test]
    fn search_is_escaped() {
        let regex = escape_search(" a.b* ");
        assert_eq!(regex.pattern, "a\\.b\\*");
        assert_eq!(regex.options, "i");
    }

    #[test]
    fn uuid_containers_use_binary_subtype() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Holder {
            #[serde(with = "serde_uuid::option")]
            one: Option<uuid::Uuid>,
            #[serde(with = "serde_uuid::vec")]
            many: Vec<uuid::Uuid>,
        }

        let holder = Holder {
            one: Some(uuid::Uuid::new_v4()),
            many: vec![uuid::Uuid::new_v4(), uuid::Uuid::new_v4()],
        };
        let doc = bson::to_document(&holder).unwrap();
        match doc.get("one") {
            Some(bson::Bson::Binary(bin)) => {
                assert_eq!(bin.subtype, bson::spec::BinarySubtype::Uuid)
            }
            other => panic!("unexpected {:?}", other),
        }
        let back: Holder = bson::from_document(doc).unwrap();
        assert_eq!(back, holder);
    }
}

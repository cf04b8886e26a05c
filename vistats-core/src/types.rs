//! Core record types for vistats

use crate::store::Record;
use serde::{Deserialize, Serialize};

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// An account owning collections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Store-assigned identity
    pub id: u64,
    pub email: String,
    /// Password hash, produced outside the core
    pub password: String,
    pub name: String,
    pub created: Timestamp,
    pub is_admin: bool,
}

impl Record for User {
    const BUCKET: &'static str = "User";

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// A member of a collection's team
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teammate {
    pub user_id: u64,
}

/// A tracked site; owns one sharded store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub owner_id: u64,
    pub name: String,
    pub created: Timestamp,
    pub teammates: Vec<Teammate>,
}

impl Collection {
    /// Check whether the user is in the collection's team
    pub fn has_teammate(&self, user_id: u64) -> bool {
        self.teammates.iter().any(|t| t.user_id == user_id)
    }
}

impl Record for Collection {
    const BUCKET: &'static str = "Collection";
}

/// A login token issued by the auth layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: String,
    pub owner_id: u64,
    /// Lifetime in seconds
    pub ttl: i32,
    pub created: Timestamp,
}

impl AuthToken {
    /// Check whether the token outlived its ttl at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.created + i64::from(self.ttl) * 1_000_000_000
    }
}

impl Record for AuthToken {
    const BUCKET: &'static str = "AuthToken";
}

/// One visit to a tracked site. The begin time lives in the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Seconds between begin and the last update
    pub duration: i32,
    pub hostname: String,
    pub device_os: String,
    pub browser_name: String,
    pub browser_version: String,
    pub browser_language: String,
    pub screen_resolution: String,
    pub window_resolution: String,
    pub device_type: String,
    pub country_code: String,
    pub city: String,
    pub user_agent: String,
    pub user_ip: String,
    pub user_hostname: String,
    pub referrer: String,
    pub as_number: i32,
    pub as_name: String,
}

impl Record for Session {
    const BUCKET: &'static str = "Session";
}

/// One page load. The time lives in the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pageview {
    pub path: String,
    pub query_string: String,
}

impl Record for Pageview {
    const BUCKET: &'static str = "Pageview";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            duration: 310,
            hostname: "example.org".into(),
            device_os: "Linux".into(),
            browser_name: "Firefox".into(),
            browser_version: "56.0".into(),
            browser_language: "hu-HU".into(),
            screen_resolution: "1920x1080".into(),
            window_resolution: "1280x720".into(),
            device_type: "desktop".into(),
            country_code: "HU".into(),
            city: "Budapest".into(),
            user_agent: "Mozilla/5.0".into(),
            user_ip: "95.85.1.2".into(),
            user_hostname: "digi.hu".into(),
            referrer: "https://wikipedia.org".into(),
            as_number: 20845,
            as_name: "DIGI".into(),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let session = sample_session();
        assert_eq!(Session::decode(&session.encode().unwrap()).unwrap(), session);

        let pageview = Pageview {
            path: "/ndl".into(),
            query_string: "matrixnotation=true".into(),
        };
        assert_eq!(Pageview::decode(&pageview.encode().unwrap()).unwrap(), pageview);

        let collection = Collection {
            id: "c1".into(),
            owner_id: 3,
            name: "example.org".into(),
            created: 17,
            teammates: vec![Teammate { user_id: 4 }],
        };
        assert_eq!(Collection::decode(&collection.encode().unwrap()).unwrap(), collection);
        assert!(collection.has_teammate(4));
        assert!(!collection.has_teammate(3));

        let user = User {
            id: 4,
            email: "dora@example.org".into(),
            password: "$argon2id$hash".into(),
            name: "Dora".into(),
            created: 21,
            is_admin: true,
        };
        assert_eq!(User::decode(&user.encode().unwrap()).unwrap(), user);

        let token = AuthToken {
            id: "0f3a".into(),
            owner_id: 4,
            ttl: 3600,
            created: 22,
        };
        assert_eq!(AuthToken::decode(&token.encode().unwrap()).unwrap(), token);
    }

    #[test]
    fn test_auth_token_expiry() {
        let token = AuthToken {
            id: "t".into(),
            owner_id: 1,
            ttl: 60,
            created: 1_000_000_000,
        };
        assert!(!token.is_expired(60_999_999_999));
        assert!(token.is_expired(61_000_000_000));
    }

    #[test]
    fn test_corrupt_record_is_decode_error() {
        let err = Session::decode(&[0xFF, 0x01]).unwrap_err();
        assert!(err.is_corruption());
    }
}

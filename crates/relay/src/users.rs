// User records and password checks.
//
// Users share the card collection under `user|<id>` with a single `pass`
// property holding an Argon2id PHC string.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use onde_common::types::PropertySnapshot;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{EntityStore, StoreError};

pub const USER_ID_PREFIX: &str = "user|";
pub const PASS_PROP: &str = "pass";

#[derive(Debug, Error)]
pub enum UserError {
    #[error("Invalid user id: {user_id}")]
    InvalidCredentials { user_id: String },

    #[error("failed to hash password: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(StoreError),
}

pub fn user_record_id(user_id: &str) -> String {
    format!("{USER_ID_PREFIX}{user_id}")
}

pub fn hash_password(password: &str) -> Result<String, UserError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| UserError::Hash(error.to_string()))
}

/// Creates or replaces the record for `user_id`.
pub async fn create_user(
    store: &EntityStore,
    user_id: &str,
    password: &str,
) -> Result<(), UserError> {
    let hash = hash_password(password)?;
    let props = PropertySnapshot::from([(PASS_PROP.to_string(), hash)]);
    store.upsert(&user_record_id(user_id), &props, true).await.map_err(UserError::Store)
}

/// Checks `password` against the stored hash for `user_id`.
pub async fn verify_login(
    store: &EntityStore,
    user_id: &str,
    password: &str,
) -> Result<(), UserError> {
    let invalid = || UserError::InvalidCredentials { user_id: user_id.to_string() };

    let record = match store.get_by_id(&user_record_id(user_id)).await {
        Ok(record) => record,
        Err(StoreError::NotFound { .. }) => {
            debug!(user_id, "login for unknown user");
            return Err(invalid());
        }
        Err(err) => return Err(UserError::Store(err)),
    };

    let Some(stored) = record.get(PASS_PROP) else {
        warn!(user_id, "user record has no password hash");
        return Err(invalid());
    };
    let parsed = match PasswordHash::new(stored) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(user_id, %error, "stored password hash is malformed");
            return Err(invalid());
        }
    };

    Argon2::default().verify_password(password.as_bytes(), &parsed).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::{create_user, user_record_id, verify_login, UserError};
    use crate::store::{EntityStore, MemoryStore, StoreError};

    #[tokio::test]
    async fn created_user_can_log_in() {
        let memory = MemoryStore::new("onde");
        let store = EntityStore::Memory(memory.clone());
        create_user(&store, "ada", "s3cret").await.expect("create user");

        let record = memory.get_by_id("user|ada").await.expect("record stored");
        assert!(record["pass"].starts_with("$argon2id$"));

        verify_login(&store, "ada", "s3cret").await.expect("login succeeds");
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let store = EntityStore::Memory(MemoryStore::new("onde"));
        create_user(&store, "ada", "s3cret").await.expect("create user");

        let wrong = verify_login(&store, "ada", "nope").await.unwrap_err();
        assert_eq!(wrong.to_string(), "Invalid user id: ada");

        let unknown = verify_login(&store, "bob", "s3cret").await.unwrap_err();
        assert_eq!(unknown.to_string(), "Invalid user id: bob");
    }

    #[tokio::test]
    async fn store_outage_is_not_reported_as_bad_credentials() {
        let memory = MemoryStore::new("onde");
        memory.set_failing(true);
        let err = verify_login(&EntityStore::Memory(memory), "ada", "x").await.unwrap_err();
        assert!(matches!(err, UserError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn record_ids_are_namespaced() {
        assert_eq!(user_record_id("ada"), "user|ada");
    }
}

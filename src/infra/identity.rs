//! Stable user identity
//!
//! The user ID is generated once per install and persisted in durable storage.
//! Both contexts may race to create it; `set_if_absent` makes the first writer win.

use crate::domain::types::UserId;
use crate::error::StorageError;
use crate::io::durable::DurableStore;
use tracing::{info, warn};
use uuid::Uuid;

pub const USER_ID_KEY: &str = "user-id";

/// Older installs could leave an empty `user-id` behind after a crash mid-write.
/// An empty value is skipped in favour of the next generation key, in the same
/// order for every context, so racing contexts still settle on one id.
const MAX_GENERATIONS: usize = 8;

fn generation_key(generation: usize) -> String {
    if generation == 0 {
        USER_ID_KEY.to_string()
    } else {
        format!("{USER_ID_KEY}.{generation}")
    }
}

/// Load the persisted user ID, creating a fresh UUIDv7 on first use
pub fn load_or_create_user_id(store: &dyn DurableStore) -> Result<UserId, StorageError> {
    let candidate = Uuid::now_v7().to_string();

    for generation in 0..MAX_GENERATIONS {
        let key = generation_key(generation);
        let value = match store.get(&key)? {
            Some(existing) => existing,
            None => store.set_if_absent(&key, &candidate)?,
        };

        let value = value.trim();
        if value.is_empty() {
            warn!(key = %key, "user_id_empty_skipped");
            continue;
        }
        if value == candidate {
            info!(user_id = %value, key = %key, "user_id_created");
        }
        return Ok(UserId(value.to_string()));
    }

    Err(StorageError::Corrupt {
        key: USER_ID_KEY.to_string(),
        reason: format!("no usable user id in {MAX_GENERATIONS} generations"),
    })
}

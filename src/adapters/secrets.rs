//! Storage secret access

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;

use crate::error::{Error, Result};

/// Key holding the repository password, present for every backend
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";

/// Get a string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::SecretKeyNotFound {
            secret: secret.metadata.name.clone().unwrap_or_default(),
            key: key.to_string(),
        })?;

    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}

/// Every key of the secret as a string.
///
/// Provider credentials are passed to restic as environment variables named
/// after the secret keys, so the whole secret is exported. The password key
/// is required.
pub fn secret_env(secret: &Secret) -> Result<BTreeMap<String, String>> {
    get_secret_string(secret, RESTIC_PASSWORD)?;

    let mut env = BTreeMap::new();
    for key in secret.data.iter().flat_map(|data| data.keys()) {
        env.insert(key.clone(), get_secret_string(secret, key)?);
    }
    Ok(env)
}

//! Settings resolution and the opaque secret codec.

use serde_json::Value;

use crate::AgentRuntime;

/// Opaque codec applied to secret values at rest.
///
/// The kernel never interprets secret values; it hands them to the codec on
/// write and read. Implementations must not log raw secret values.
pub trait SecretCodec: Send + Sync {
    /// Encodes a value before it is stored in a secrets bucket.
    fn encode(&self, value: &Value) -> Value;

    /// Decodes a value read from a secrets bucket.
    fn decode(&self, value: &Value) -> Value;
}

/// Identity codec used when no encryption layer is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCodec;

impl SecretCodec for PassthroughCodec {
    fn encode(&self, value: &Value) -> Value {
        value.clone()
    }

    fn decode(&self, value: &Value) -> Value {
        value.clone()
    }
}

/// Coerces the exact strings `"true"` and `"false"` to booleans.
#[must_use]
pub fn coerce_setting(value: Value) -> Value {
    match value.as_str() {
        Some("true") => Value::Bool(true),
        Some("false") => Value::Bool(false),
        _ => value,
    }
}

impl AgentRuntime {
    /// Resolves a setting.
    ///
    /// Lookup order: character secrets, character settings, the character
    /// settings' nested `secrets` object, then the runtime settings map. The
    /// raw value passes through the secret codec, and the exact strings
    /// `"true"`/`"false"` coerce to booleans. Returns `None` on a miss.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[must_use]
    pub fn get_setting(&self, key: &str) -> Option<Value> {
        let raw = {
            let character = self.character.read().expect("character lock poisoned");
            character
                .secrets()
                .get(key)
                .or_else(|| character.settings().get(key))
                .or_else(|| {
                    character
                        .settings()
                        .get("secrets")
                        .and_then(Value::as_object)
                        .and_then(|secrets| secrets.get(key))
                })
                .cloned()
        }
        .or_else(|| {
            self.settings
                .read()
                .expect("settings lock poisoned")
                .get(key)
                .cloned()
        })?;

        Some(coerce_setting(self.secret_codec.decode(&raw)))
    }

    /// Writes a setting into the character's settings bucket, or — when
    /// `secret` is set — its secrets bucket after passing through the codec.
    ///
    /// # Panics
    ///
    /// Panics if the character lock is poisoned.
    pub fn set_setting(&self, key: impl Into<String>, value: Value, secret: bool) {
        let mut character = self.character.write().expect("character lock poisoned");
        if secret {
            let encoded = self.secret_codec.encode(&value);
            character.set_secret(key, encoded);
        } else {
            character.set_setting(key, value);
        }
    }
}

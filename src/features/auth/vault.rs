use crate::config::{AuthField, Values};
use crate::engine::template::is_blank;
use crate::error::AppResult;
use crate::storage::{
    AUTH_VALUES_KEY, IS_AUTHENTICATED_KEY, LocalStorage, OAUTH_STATE_KEY, read_slice, write_slice,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const EXPIRES_AT: &str = "expires_at";
pub const TOKEN_TYPE: &str = "token_type";
pub const CLIENT_ID: &str = "clientId";
pub const CLIENT_SECRET: &str = "secretId";

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Token payload returned by the backend's exchange and refresh endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Default)]
struct VaultState {
    values: Values,
    authenticated: bool,
}

/// Authentication state of the active service session.
///
/// Every mutation is written through to storage so a restart resumes the session.
pub struct CredentialVault {
    storage: Arc<dyn LocalStorage>,
    state: Mutex<VaultState>,
}

impl CredentialVault {
    pub fn open(storage: Arc<dyn LocalStorage>) -> Self {
        let state = VaultState {
            values: read_slice(storage.as_ref(), AUTH_VALUES_KEY),
            authenticated: read_slice(storage.as_ref(), IS_AUTHENTICATED_KEY),
        };

        Self {
            storage,
            state: Mutex::new(state),
        }
    }

    pub fn values(&self) -> Values {
        self.lock().values.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(text) if !text.is_empty() => Some(text),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    pub fn set(&self, key: &str, value: Value) -> AppResult<()> {
        let mut state = self.lock();
        state.values.insert(key.to_string(), value);
        write_slice(self.storage.as_ref(), AUTH_VALUES_KEY, &state.values)
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().authenticated
    }

    pub fn set_authenticated(&self, authenticated: bool) -> AppResult<()> {
        let mut state = self.lock();
        state.authenticated = authenticated;
        write_slice(self.storage.as_ref(), IS_AUTHENTICATED_KEY, &authenticated)
    }

    /// Merges a token grant; a grant without a refresh token keeps the previous one.
    pub fn apply_token_grant(&self, grant: TokenGrant, now_ms: i64) -> AppResult<()> {
        let expires_at = grant.expires_at.unwrap_or_else(|| {
            let lifetime_ms = grant
                .expires_in
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
                .saturating_mul(1000);
            now_ms.saturating_add(lifetime_ms)
        });

        let mut state = self.lock();
        let values = &mut state.values;
        values.insert(ACCESS_TOKEN.to_string(), Value::String(grant.access_token));
        if let Some(refresh_token) = grant.refresh_token {
            values.insert(REFRESH_TOKEN.to_string(), Value::String(refresh_token));
        }
        values.insert(EXPIRES_AT.to_string(), Value::from(expires_at));
        values.insert(
            TOKEN_TYPE.to_string(),
            Value::String(grant.token_type.unwrap_or_else(|| "Bearer".to_string())),
        );
        if let Some(client_id) = grant.client_id {
            values.insert(CLIENT_ID.to_string(), Value::String(client_id));
        }
        if let Some(client_secret) = grant.client_secret {
            values.insert(CLIENT_SECRET.to_string(), Value::String(client_secret));
        }

        write_slice(self.storage.as_ref(), AUTH_VALUES_KEY, &state.values)
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.lock().values.get(EXPIRES_AT).and_then(Value::as_i64)
    }

    /// Labels of required auth fields that have no value yet.
    pub fn missing_required(&self, fields: &[AuthField]) -> Vec<String> {
        let state = self.lock();
        fields
            .iter()
            .filter(|field| field.required)
            .filter(|field| state.values.get(&field.key).is_none_or(is_blank))
            .map(|field| field.label.clone())
            .collect()
    }

    pub fn pending_state(&self) -> Option<String> {
        read_slice(self.storage.as_ref(), OAUTH_STATE_KEY)
    }

    pub fn set_pending_state(&self, state: Option<&str>) -> AppResult<()> {
        match state {
            Some(value) => write_slice(self.storage.as_ref(), OAUTH_STATE_KEY, value),
            None => self.storage.remove_item(OAUTH_STATE_KEY),
        }
    }

    /// Drops every credential and the authenticated flag.
    pub fn clear(&self) -> AppResult<()> {
        let mut state = self.lock();
        state.values.clear();
        state.authenticated = false;
        write_slice(self.storage.as_ref(), AUTH_VALUES_KEY, &state.values)?;
        write_slice(self.storage.as_ref(), IS_AUTHENTICATED_KEY, &false)?;
        self.storage.remove_item(OAUTH_STATE_KEY)
    }

    fn lock(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldType;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn auth_field(key: &str, label: &str, required: bool) -> AuthField {
        AuthField {
            key: key.to_string(),
            label: label.to_string(),
            field_type: FieldType::Text,
            required,
        }
    }

    #[test]
    fn state_survives_reopen() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
        let vault = CredentialVault::open(storage.clone());
        vault.set("apiKey", json!("pat123")).unwrap();
        vault.set_authenticated(true).unwrap();

        let reopened = CredentialVault::open(storage);
        assert!(reopened.is_authenticated());
        assert_eq!(reopened.get_text("apiKey").as_deref(), Some("pat123"));
    }

    #[test]
    fn grant_computes_expiry_and_keeps_refresh_token() {
        let vault = CredentialVault::open(Arc::new(MemoryStorage::new()));
        vault
            .apply_token_grant(
                TokenGrant {
                    access_token: "a1".into(),
                    refresh_token: Some("r1".into()),
                    expires_in: Some(60),
                    ..TokenGrant::default()
                },
                1_000,
            )
            .unwrap();
        assert_eq!(vault.expires_at(), Some(61_000));
        assert_eq!(vault.get_text(TOKEN_TYPE).as_deref(), Some("Bearer"));

        vault
            .apply_token_grant(
                TokenGrant {
                    access_token: "a2".into(),
                    client_id: Some("cid".into()),
                    ..TokenGrant::default()
                },
                10_000,
            )
            .unwrap();
        assert_eq!(vault.get_text(ACCESS_TOKEN).as_deref(), Some("a2"));
        assert_eq!(vault.get_text(REFRESH_TOKEN).as_deref(), Some("r1"));
        assert_eq!(vault.get_text(CLIENT_ID).as_deref(), Some("cid"));
        assert_eq!(vault.expires_at(), Some(10_000 + 3_600_000));
    }

    #[test]
    fn oversized_expires_in_saturates() {
        let vault = CredentialVault::open(Arc::new(MemoryStorage::new()));
        vault
            .apply_token_grant(
                TokenGrant {
                    access_token: "a1".into(),
                    expires_in: Some(i64::MAX),
                    ..TokenGrant::default()
                },
                1_000,
            )
            .unwrap();
        assert_eq!(vault.expires_at(), Some(i64::MAX));
    }

    #[test]
    fn missing_required_reports_labels_in_order() {
        let vault = CredentialVault::open(Arc::new(MemoryStorage::new()));
        vault.set("clientId", json!("abc")).unwrap();
        vault.set("secretId", json!("")).unwrap();
        let fields = vec![
            auth_field("clientId", "Client ID", true),
            auth_field("secretId", "Client Secret", true),
            auth_field("tenant", "Tenant", false),
            auth_field("region", "Region", true),
        ];

        assert_eq!(vault.missing_required(&fields), vec!["Client Secret", "Region"]);
    }

    #[test]
    fn clear_drops_everything() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
        let vault = CredentialVault::open(storage.clone());
        vault.set("apiKey", json!("pat")).unwrap();
        vault.set_authenticated(true).unwrap();
        vault.set_pending_state(Some("xyz")).unwrap();

        vault.clear().unwrap();

        assert!(vault.values().is_empty());
        assert!(!vault.is_authenticated());
        assert!(vault.pending_state().is_none());
        assert!(!CredentialVault::open(storage).is_authenticated());
    }
}

use crate::config::{AuthType, ServiceConfiguration};
use crate::engine::http::HttpTransport;
use crate::error::{AppError, AppResult};
use crate::features::auth::oauth::{self, RedirectArtifact};
use crate::features::auth::vault::{
    CLIENT_ID, CLIENT_SECRET, CredentialVault, REFRESH_TOKEN, TokenGrant,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Renew when the access token expires within this window.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// A redirect to the identity provider is in flight.
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Credentials needed for renewal are gone; the timer should stop.
    Inactive,
    NotDue,
    Refreshed,
}

pub struct AuthFlowController {
    config: Arc<ServiceConfiguration>,
    vault: Arc<CredentialVault>,
    http: Arc<dyn HttpTransport>,
}

impl AuthFlowController {
    pub fn new(
        config: Arc<ServiceConfiguration>,
        vault: Arc<CredentialVault>,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        Self { config, vault, http }
    }

    pub fn state(&self) -> AuthState {
        if self.vault.is_authenticated() {
            AuthState::Authenticated
        } else if self.vault.pending_state().is_some() {
            AuthState::Authenticating
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Static key / manual credential path: no network round trip.
    pub fn authenticate(&self) -> AppResult<()> {
        if self.config.auth.is_redirect_oauth() {
            return Err(AppError::auth(
                "This service signs in through the identity provider. Use the redirect flow.",
            ));
        }

        let missing = self.vault.missing_required(&self.config.auth.fields);
        if !missing.is_empty() {
            return Err(AppError::missing_fields("Please enter", &missing));
        }

        self.vault.set_authenticated(true)?;
        log::info!(
            "authenticated with {} ({:?})",
            self.config.service_code,
            self.config.auth.auth_type
        );
        Ok(())
    }

    /// Returns the provider address the browser must be sent to.
    pub fn begin_redirect(&self) -> AppResult<String> {
        if !self.config.auth.is_redirect_oauth() {
            return Err(AppError::configuration(format!(
                "Service `{}` does not use the OAuth2 redirect flow.",
                self.config.service_code
            )));
        }

        let client_id = self
            .vault
            .get_text(CLIENT_ID)
            .ok_or_else(|| AppError::auth("Please enter your Client ID"))?;

        let (url, state) = oauth::build_authorization_url(&self.config.auth, &client_id)?;
        self.vault.set_pending_state(Some(&state))?;
        log::info!("redirecting to identity provider for {}", self.config.service_code);
        Ok(url)
    }

    /// Consumes the provider's return address; yields the address with artifacts removed.
    pub async fn complete_redirect(&self, return_url: &str, now_ms: i64) -> AppResult<String> {
        let parsed = oauth::parse_redirect_return(return_url)?;
        let Some(artifact) = parsed.artifact else {
            return Err(AppError::auth(
                "Return address carries neither a code nor an access token.",
            ));
        };

        let expected_state = self.vault.pending_state();
        let returned_state = match &artifact {
            RedirectArtifact::Code { state, .. } | RedirectArtifact::AccessToken { state, .. } => {
                state.clone()
            }
        };
        if let (Some(expected), Some(returned)) = (&expected_state, &returned_state)
            && expected != returned
        {
            self.vault.set_pending_state(None)?;
            return Err(AppError::auth(
                "OAuth state mismatch. Aborting login for security.",
            ));
        }

        let grant = match artifact {
            RedirectArtifact::Code { code, .. } => {
                let client_id = self.vault.get_text(CLIENT_ID);
                let client_secret = self.vault.get_text(CLIENT_SECRET);
                let exchanged = oauth::exchange_code(
                    self.http.as_ref(),
                    &self.config.base_url,
                    &code,
                    self.config.auth.redirect_uri.as_deref(),
                    client_id.as_deref(),
                    client_secret.as_deref(),
                )
                .await;
                match exchanged {
                    Ok(grant) => grant,
                    Err(err) => {
                        self.vault.set_pending_state(None)?;
                        return Err(err);
                    }
                }
            }
            RedirectArtifact::AccessToken {
                access_token,
                token_type,
                expires_in,
                ..
            } => TokenGrant {
                access_token,
                token_type: Some(token_type.unwrap_or_else(|| "Bearer".to_string())),
                expires_in,
                ..TokenGrant::default()
            },
        };

        self.vault.apply_token_grant(grant, now_ms)?;
        self.vault.set_pending_state(None)?;
        self.vault.set_authenticated(true)?;
        log::info!("authenticated with {} (OAuth2)", self.config.service_code);

        Ok(parsed.cleaned_url)
    }

    /// One tick of background renewal.
    ///
    /// A failed renewal clears the vault; the user has to sign in again.
    pub async fn check_refresh(&self, now_ms: i64) -> AppResult<RefreshOutcome> {
        if self.config.auth.auth_type != AuthType::OAuth2 || !self.vault.is_authenticated() {
            return Ok(RefreshOutcome::Inactive);
        }

        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            self.vault.get_text(REFRESH_TOKEN),
            self.vault.get_text(CLIENT_ID),
            self.vault.get_text(CLIENT_SECRET),
        ) else {
            return Ok(RefreshOutcome::Inactive);
        };

        let Some(expires_at) = self.vault.expires_at() else {
            return Ok(RefreshOutcome::NotDue);
        };
        let buffer_ms = i64::try_from(REFRESH_BUFFER.as_millis()).unwrap_or(i64::MAX);
        if now_ms <= expires_at.saturating_sub(buffer_ms) {
            return Ok(RefreshOutcome::NotDue);
        }

        log::info!("access token for {} expires soon, refreshing", self.config.service_code);
        match oauth::refresh_access_token(
            self.http.as_ref(),
            &self.config.base_url,
            &refresh_token,
            &client_id,
            &client_secret,
        )
        .await
        {
            Ok(grant) => {
                self.vault.apply_token_grant(grant, now_ms)?;
                Ok(RefreshOutcome::Refreshed)
            }
            Err(err) => {
                log::warn!("token refresh failed, ending session: {err}");
                self.vault.clear()?;
                Err(AppError::auth("Session expired. Please log in again."))
            }
        }
    }

    pub fn logout(&self) -> AppResult<()> {
        self.vault.clear()?;
        log::info!("logged out of {}", self.config.service_code);
        Ok(())
    }

    pub fn config(&self) -> &ServiceConfiguration {
        &self.config
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::engine::executor::tests::FakeTransport;
    use crate::error::ErrorKind;
    use crate::features::auth::vault::{ACCESS_TOKEN, EXPIRES_AT};
    use crate::storage::MemoryStorage;
    use serde_json::{Value, json};

    const NOW: i64 = 1_700_000_000_000;
    const MINUTE: i64 = 60_000;

    fn controller(code: &str) -> (AuthFlowController, Arc<CredentialVault>, Arc<FakeTransport>) {
        let config = ConfigStore::bundled().unwrap().get(code).unwrap();
        let vault = Arc::new(CredentialVault::open(Arc::new(MemoryStorage::new())));
        let http = Arc::new(FakeTransport::default());
        let controller = AuthFlowController::new(config, vault.clone(), http.clone());
        (controller, vault, http)
    }

    fn signed_in_oauth(vault: &CredentialVault, expires_at: i64) {
        vault.set(CLIENT_ID, json!("cid")).unwrap();
        vault.set(CLIENT_SECRET, json!("secret")).unwrap();
        vault.set(ACCESS_TOKEN, json!("old")).unwrap();
        vault.set(REFRESH_TOKEN, json!("r1")).unwrap();
        vault.set(EXPIRES_AT, json!(expires_at)).unwrap();
        vault.set_authenticated(true).unwrap();
    }

    #[test]
    fn api_key_auth_needs_required_fields() {
        let (controller, vault, http) = controller("airtable");

        let err = controller.authenticate().unwrap_err();
        assert!(err.is(ErrorKind::Validation));
        assert_eq!(err.message, "Please enter: Personal Access Token");
        assert_eq!(controller.state(), AuthState::Unauthenticated);

        vault.set("apiKey", json!("pat123")).unwrap();
        controller.authenticate().unwrap();
        assert_eq!(controller.state(), AuthState::Authenticated);
        assert!(http.sent().is_empty());
    }

    #[test]
    fn redirect_requires_client_id() {
        let (controller, vault, _) = controller("googlesheets");

        let err = controller.begin_redirect().unwrap_err();
        assert_eq!(err.message, "Please enter your Client ID");

        vault.set(CLIENT_ID, json!("cid")).unwrap();
        let url = controller.begin_redirect().unwrap();
        assert!(url.contains("client_id=cid"));
        assert_eq!(controller.state(), AuthState::Authenticating);
    }

    #[tokio::test]
    async fn code_return_is_exchanged_at_backend() {
        let (controller, vault, http) = controller("googlesheets");
        vault.set(CLIENT_ID, json!("cid")).unwrap();
        vault.set(CLIENT_SECRET, json!("secret")).unwrap();
        controller.begin_redirect().unwrap();
        let state = vault.pending_state().unwrap();
        http.respond(
            200,
            json!({"access_token": "a1", "refresh_token": "r1", "expires_in": 3600}),
        );

        let cleaned = controller
            .complete_redirect(
                &format!("http://127.0.0.1:45455/callback?code=xyz&state={state}"),
                NOW,
            )
            .await
            .unwrap();

        assert_eq!(cleaned, "http://127.0.0.1:45455/callback");
        assert_eq!(controller.state(), AuthState::Authenticated);
        assert_eq!(vault.get_text(ACCESS_TOKEN).as_deref(), Some("a1"));
        assert_eq!(vault.expires_at(), Some(NOW + 3_600_000));
        let sent = http.sent();
        assert_eq!(sent[0].url, "http://localhost:5000/oauth/callback");
        assert_eq!(
            sent[0].body,
            Some(json!({
                "code": "xyz",
                "redirect_uri": "http://127.0.0.1:45455/callback",
                "client_id": "cid",
                "client_secret": "secret"
            }))
        );
    }

    #[tokio::test]
    async fn fragment_token_is_accepted_directly() {
        let (controller, vault, http) = controller("gmail");

        controller
            .complete_redirect("https://app.test/apiblock#access_token=tok", NOW)
            .await
            .unwrap();

        assert!(vault.is_authenticated());
        assert_eq!(vault.get_text(ACCESS_TOKEN).as_deref(), Some("tok"));
        assert_eq!(vault.get_text("token_type").as_deref(), Some("Bearer"));
        assert!(http.sent().is_empty());
    }

    #[tokio::test]
    async fn state_mismatch_aborts() {
        let (controller, vault, http) = controller("googlesheets");
        vault.set(CLIENT_ID, json!("cid")).unwrap();
        controller.begin_redirect().unwrap();

        let err = controller
            .complete_redirect("http://127.0.0.1:45455/callback?code=xyz&state=forged", NOW)
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::Auth));
        assert!(!vault.is_authenticated());
        assert!(http.sent().is_empty());
    }

    #[tokio::test]
    async fn refresh_runs_inside_buffer() {
        let (controller, vault, http) = controller("googlesheets");
        signed_in_oauth(&vault, NOW + 5 * MINUTE);
        http.respond(200, json!({"access_token": "new", "expires_in": 3600}));

        let outcome = controller.check_refresh(NOW).await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(vault.get_text(ACCESS_TOKEN).as_deref(), Some("new"));
        assert_eq!(vault.get_text(REFRESH_TOKEN).as_deref(), Some("r1"));
        let sent = http.sent();
        assert_eq!(sent[0].url, "http://localhost:5000/oauth/refresh");
        assert_eq!(
            sent[0].body,
            Some(json!({"refresh_token": "r1", "client_id": "cid", "client_secret": "secret"}))
        );
    }

    #[tokio::test]
    async fn failed_refresh_forces_reauthentication() {
        let (controller, vault, http) = controller("googlesheets");
        signed_in_oauth(&vault, NOW + 5 * MINUTE);
        http.respond(401, json!({"error": "invalid_grant"}));

        let err = controller.check_refresh(NOW).await.unwrap_err();

        assert!(err.is(ErrorKind::Auth));
        assert_eq!(err.message, "Session expired. Please log in again.");
        assert!(!vault.is_authenticated());
        assert!(vault.values().is_empty());
        assert_eq!(controller.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn refresh_waits_outside_buffer() {
        let (controller, vault, http) = controller("googlesheets");
        signed_in_oauth(&vault, NOW + 30 * MINUTE);

        assert_eq!(controller.check_refresh(NOW).await.unwrap(), RefreshOutcome::NotDue);
        assert!(http.sent().is_empty());
    }

    #[tokio::test]
    async fn stored_expiry_at_the_i64_floor_is_due() {
        let (controller, vault, http) = controller("googlesheets");
        signed_in_oauth(&vault, i64::MIN);
        http.respond(200, json!({"access_token": "fresh", "expires_in": 3600}));

        assert_eq!(controller.check_refresh(NOW).await.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(vault.expires_at(), Some(NOW + 60 * MINUTE));
    }

    #[tokio::test]
    async fn refresh_is_inactive_without_refresh_token() {
        let (controller, vault, _) = controller("googlesheets");
        signed_in_oauth(&vault, NOW);
        vault.set(REFRESH_TOKEN, Value::Null).unwrap();

        assert_eq!(
            controller.check_refresh(NOW).await.unwrap(),
            RefreshOutcome::Inactive
        );
    }
}

//! Explicit lifetime for one service screen: init wires the components, teardown
//! stops background work.

use crate::config::{ConfigStore, ServiceConfiguration};
use crate::engine::http::HttpTransport;
use crate::error::{AppError, AppResult};
use crate::features::auth::flow::AuthFlowController;
use crate::features::auth::refresh::{REFRESH_INTERVAL, RefreshTask};
use crate::features::auth::vault::CredentialVault;
use crate::features::records::{Notice, Notifier, RecordViewController};
use crate::storage::{
    FileStorage, LocalStorage, MemoryStorage, SERVICE_CODE_KEY, SecretStorage,
    clear_session_slices, read_slice, write_slice,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Credentials live in `secrets`; every other slice in `state`.
#[derive(Clone)]
pub struct Storages {
    pub secrets: Arc<dyn LocalStorage>,
    pub state: Arc<dyn LocalStorage>,
    /// Encrypted secrets file, when secrets are persisted.
    pub secret_location: Option<PathBuf>,
}

impl Storages {
    pub fn persistent(config_dir: &Path) -> Self {
        let secrets = SecretStorage::new(config_dir.to_path_buf());
        let info = secrets.info();
        log::debug!(
            "secrets in {} (keyring {}/{})",
            info.file_path.display(),
            info.service,
            info.account
        );

        Self {
            secrets: Arc::new(secrets),
            state: Arc::new(FileStorage::new(config_dir)),
            secret_location: Some(info.file_path),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            secrets: Arc::new(MemoryStorage::new()),
            state: Arc::new(MemoryStorage::new()),
            secret_location: None,
        }
    }

    pub fn selected_service(&self) -> Option<String> {
        read_slice::<Option<String>>(self.state.as_ref(), SERVICE_CODE_KEY)
            .filter(|code| !code.is_empty())
    }

    fn clear_session(&self) -> AppResult<()> {
        clear_session_slices(self.secrets.as_ref())?;
        clear_session_slices(self.state.as_ref())
    }
}

/// Marks `code` as the active service; switching services drops the previous session.
pub fn select_service(
    store: &ConfigStore,
    storages: &Storages,
    code: &str,
) -> AppResult<Arc<ServiceConfiguration>> {
    let config = store.get(code)?;
    let previous = storages.selected_service();

    if previous.as_deref() != Some(config.service_code.as_str()) {
        if let Some(previous) = &previous {
            log::info!("switching service from {previous} to {}", config.service_code);
        }
        storages.clear_session()?;
    }

    write_slice(storages.state.as_ref(), SERVICE_CODE_KEY, &config.service_code)?;
    Ok(config)
}

pub fn active_service(store: &ConfigStore, storages: &Storages) -> AppResult<Arc<ServiceConfiguration>> {
    let code = storages.selected_service().ok_or_else(|| {
        AppError::configuration("No service selected. Run `apiblock use <service>` first.")
    })?;
    store.get(&code)
}

pub struct Session {
    pub config: Arc<ServiceConfiguration>,
    pub vault: Arc<CredentialVault>,
    pub auth: Arc<AuthFlowController>,
    pub records: RecordViewController,
    notifier: Arc<dyn Notifier>,
    refresh: Option<RefreshTask>,
}

impl Session {
    pub fn init(
        config: Arc<ServiceConfiguration>,
        storages: &Storages,
        http: Arc<dyn HttpTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let vault = Arc::new(CredentialVault::open(storages.secrets.clone()));
        let auth = Arc::new(AuthFlowController::new(
            config.clone(),
            vault.clone(),
            http.clone(),
        ));
        let records = RecordViewController::new(
            config.clone(),
            vault.clone(),
            http,
            storages.state.clone(),
            notifier.clone(),
        );

        Self {
            config,
            vault,
            auth,
            records,
            notifier,
            refresh: None,
        }
    }

    /// Starts background token renewal if the session can be renewed and none is running.
    pub fn start_refresh(&mut self) {
        if self.refresh.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if !self.vault.is_authenticated() || !self.config.auth.is_redirect_oauth() {
            return;
        }

        let notifier = self.notifier.clone();
        self.refresh = Some(RefreshTask::spawn(
            self.auth.clone(),
            REFRESH_INTERVAL,
            move |event| match event {
                Ok(()) => notifier.notify(Notice::Info, "Access token refreshed automatically"),
                Err(err) => notifier.notify(Notice::Warning, &err.message),
            },
        ));
    }

    pub fn teardown(mut self) {
        if let Some(task) = self.refresh.take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::tests::FakeTransport;
    use crate::features::records::controller::tests::RecordingNotifier;
    use crate::storage::INPUT_VALUES_KEY;
    use serde_json::json;

    #[tokio::test]
    async fn switching_service_clears_session_slices() {
        let store = ConfigStore::bundled().unwrap();
        let storages = Storages::ephemeral();
        let http: Arc<dyn HttpTransport> = Arc::new(FakeTransport::default());
        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());

        let config = select_service(&store, &storages, "airtable").unwrap();
        let mut session = Session::init(config, &storages, http.clone(), notifier.clone());
        session.vault.set("apiKey", json!("pat123")).unwrap();
        session.records.set_input("baseId", json!("app1")).await.unwrap();
        session.teardown();

        let again = select_service(&store, &storages, "airtable").unwrap();
        let session = Session::init(again, &storages, http.clone(), notifier.clone());
        assert_eq!(session.vault.get_text("apiKey").as_deref(), Some("pat123"));
        session.teardown();

        select_service(&store, &storages, "gmail").unwrap();
        assert_eq!(storages.selected_service().as_deref(), Some("gmail"));
        assert!(storages.state.get_item(INPUT_VALUES_KEY).unwrap().is_none());
        let vault = CredentialVault::open(storages.secrets.clone());
        assert!(vault.values().is_empty());
    }

    #[test]
    fn unknown_service_keeps_current_selection() {
        let store = ConfigStore::bundled().unwrap();
        let storages = Storages::ephemeral();
        select_service(&store, &storages, "airtable").unwrap();

        assert!(select_service(&store, &storages, "nope").is_err());
        assert_eq!(
            active_service(&store, &storages).unwrap().service_code,
            "airtable"
        );
    }

    #[test]
    fn active_service_requires_selection() {
        let store = ConfigStore::bundled().unwrap();
        let err = active_service(&store, &Storages::ephemeral()).err().unwrap();
        assert!(err.message.contains("apiblock use"));
    }
}

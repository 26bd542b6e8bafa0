use crate::config::models::{AuthFlow, AuthType, ServiceConfiguration};
use crate::error::{AppError, AppResult};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const SERVICES_ENV: &str = "APIBLOCK_SERVICES";
const BUNDLED_SERVICES: &str = include_str!("../../config/services.json");

/// Read-only set of service configurations, looked up by service code.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    services: Vec<Arc<ServiceConfiguration>>,
}

impl ConfigStore {
    /// Picks the services document: explicit path, then `APIBLOCK_SERVICES`, then the bundled one.
    pub fn resolve(path_override: Option<&Path>) -> AppResult<Self> {
        if let Some(path) = path_override {
            return Self::load(path);
        }

        match env::var(SERVICES_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim())),
            _ => Self::bundled(),
        }
    }

    pub fn bundled() -> AppResult<Self> {
        Self::from_json(BUNDLED_SERVICES)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::configuration(format!(
                "Failed to read services document {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        let parsed: Vec<ServiceConfiguration> = serde_json::from_str(raw).map_err(|err| {
            AppError::configuration(format!("Failed to decode services document: {err}"))
        })?;

        let mut seen = HashSet::new();
        for service in &parsed {
            if !seen.insert(service.service_code.as_str()) {
                return Err(AppError::configuration(format!(
                    "Duplicate service code `{}`.",
                    service.service_code
                )));
            }
            validate_service(service)?;
        }

        Ok(Self {
            services: parsed.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn get(&self, service_code: &str) -> AppResult<Arc<ServiceConfiguration>> {
        self.services
            .iter()
            .find(|service| service.service_code == service_code)
            .cloned()
            .ok_or_else(|| {
                AppError::configuration(format!(
                    "No service configuration found for `{service_code}`."
                ))
            })
    }

    pub fn services(&self) -> &[Arc<ServiceConfiguration>] {
        &self.services
    }
}

fn validate_service(service: &ServiceConfiguration) -> AppResult<()> {
    let code = &service.service_code;
    let mut keys = HashSet::new();
    for input in &service.inputs {
        if !keys.insert(input.key.as_str()) {
            return Err(AppError::configuration(format!(
                "Service `{code}` declares input `{}` more than once.",
                input.key
            )));
        }
    }

    for input in &service.inputs {
        if let Some(dependency) = input.depends_on.as_deref()
            && !keys.contains(dependency)
        {
            return Err(AppError::configuration(format!(
                "Input `{}` of service `{code}` depends on undeclared input `{dependency}`.",
                input.key
            )));
        }

        if input.is_dynamic_dropdown() && input.data_source.is_none() {
            log::warn!(
                "dynamic dropdown `{}` of service `{code}` has no dataSource; it will stay empty",
                input.key
            );
        }
    }

    if service.auth.auth_type == AuthType::OAuth2 && service.auth.flow == AuthFlow::Redirect {
        if service.auth.auth_url.is_none() {
            return Err(AppError::configuration(format!(
                "Service `{code}` uses OAuth2 redirect flow without authUrl."
            )));
        }
        if service.auth.redirect_uri.is_none() {
            return Err(AppError::configuration(format!(
                "Service `{code}` uses OAuth2 redirect flow without redirectUri."
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{FieldType, OperationName, RowAction};
    use crate::error::ErrorKind;

    #[test]
    fn bundled_document_loads() {
        let store = ConfigStore::bundled().unwrap();
        let airtable = store.get("airtable").unwrap();

        assert_eq!(airtable.auth.auth_type, AuthType::ApiKey);
        assert_eq!(
            airtable.operation(OperationName::Fetch).unwrap().response_field.as_deref(),
            Some("records")
        );
        assert!(airtable.action_enabled(RowAction::Delete));
        assert!(store.get("googlesheets").unwrap().auth.is_redirect_oauth());
    }

    #[test]
    fn config_fields_keep_declared_order() {
        let store = ConfigStore::from_json(
            r#"[{
                "servicecode": "demo",
                "inputs": [
                    {"key": "Name", "label": "Name"},
                    {"key": "baseId", "label": "Base"},
                    {"key": "Email", "label": "Email", "type": "email"},
                    {"key": "tableName", "label": "Table"},
                    {"key": "query", "label": "Query"}
                ]
            }]"#,
        )
        .unwrap();
        let service = store.get("demo").unwrap();

        let config_keys: Vec<&str> = service
            .config_fields()
            .iter()
            .map(|field| field.key.as_str())
            .collect();
        assert_eq!(config_keys, vec!["baseId", "tableName", "query"]);

        let data_keys: Vec<&str> = service
            .data_fields()
            .iter()
            .map(|field| field.key.as_str())
            .collect();
        assert_eq!(data_keys, vec!["Name", "Email"]);
        assert_eq!(service.display_fields(), vec!["Name", "Email"]);
        assert_eq!(service.input("Email").unwrap().field_type, FieldType::Email);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = ConfigStore::from_json(
            r#"[{"servicecode": "demo", "inputs": [{"key": "tableName", "label": "Table", "dependsOn": "baseId"}]}]"#,
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
        assert!(err.message.contains("baseId"));
    }

    #[test]
    fn duplicate_input_keys_are_rejected() {
        let err = ConfigStore::from_json(
            r#"[{"servicecode": "demo", "inputs": [{"key": "a", "label": "A"}, {"key": "a", "label": "B"}]}]"#,
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
    }

    #[test]
    fn unknown_field_type_is_a_configuration_error() {
        let err = ConfigStore::from_json(
            r#"[{"servicecode": "demo", "inputs": [{"key": "a", "label": "A", "type": "slider"}]}]"#,
        )
        .unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
    }

    #[test]
    fn lookup_of_unknown_service_fails() {
        let store = ConfigStore::bundled().unwrap();
        assert!(store.get("dropbox").unwrap_err().is(ErrorKind::Configuration));
    }
}

use crate::config::{AuthMethod, AuthType, OperationName, ServiceConfiguration, Values};
use crate::engine::http::{HttpRequest, HttpTransport};
use crate::engine::template::{self, PayloadContext, is_blank, value_to_text};
use crate::error::{AppError, AppResult};
use crate::features::auth::vault::CredentialVault;
use serde_json::Value;

const BASE_URL_TOKENS: [&str; 2] = ["{baseurl}", "{baseUrl}"];

/// Runs one declared operation: resolve, call once, unwrap.
pub struct OperationExecutor<'a> {
    config: &'a ServiceConfiguration,
    vault: &'a CredentialVault,
    http: &'a dyn HttpTransport,
}

impl<'a> OperationExecutor<'a> {
    pub fn new(
        config: &'a ServiceConfiguration,
        vault: &'a CredentialVault,
        http: &'a dyn HttpTransport,
    ) -> Self {
        Self {
            config,
            vault,
            http,
        }
    }

    pub async fn execute(
        &self,
        name: OperationName,
        input_values: &Values,
        runtime_params: &Values,
    ) -> AppResult<Value> {
        let request = self.build_request(name, input_values, runtime_params)?;
        log::debug!("{name}: {:?} {}", request.method, request.url);

        let response = self.http.send(request).await?.ensure_success()?;

        let operation = self.operation(name)?;
        Ok(match operation.response_field.as_deref() {
            Some(field) => match response.body.get(field) {
                Some(Value::Null) | None => Value::Array(Vec::new()),
                Some(value) => value.clone(),
            },
            None => response.body,
        })
    }

    /// Everything up to the network call; fails before any I/O on config, validation or auth problems.
    pub fn build_request(
        &self,
        name: OperationName,
        input_values: &Values,
        runtime_params: &Values,
    ) -> AppResult<HttpRequest> {
        let operation = self.operation(name)?;

        let missing: Vec<String> = operation
            .required_fields
            .iter()
            .filter(|key| input_values.get(key.as_str()).is_none_or(is_blank))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(AppError::missing_fields("Missing required fields", &missing));
        }

        let auth_values = self.vault.values();
        let mut values = input_values.clone();
        values.extend(auth_values);
        values.extend(runtime_params.clone());

        let url = template::resolve_url(&self.expand_base_url(&operation.url), &values);
        let mut request = HttpRequest::new(operation.method, url);

        if let Some(payload) = &operation.payload {
            let data_fields = self.config.data_fields();
            let context = PayloadContext {
                values: &values,
                data_fields: &data_fields,
                input_values,
            };
            request = request.json(template::resolve_payload(payload, &context));
        }

        if operation.auth_method == Some(AuthMethod::Header) {
            let field = operation
                .auth_field
                .clone()
                .unwrap_or_else(|| self.default_auth_field());
            let token = self
                .vault
                .get(&field)
                .filter(|value| !is_blank(value))
                .map(|value| value_to_text(&value))
                .ok_or_else(|| {
                    AppError::auth(format!(
                        "Missing credential `{field}`. Run `apiblock login` first."
                    ))
                })?;
            request = request.bearer(&token);
        }

        Ok(request)
    }

    fn operation(&self, name: OperationName) -> AppResult<&'a crate::config::OperationConfig> {
        self.config.operation(name).ok_or_else(|| {
            AppError::configuration(format!("Operation {name} not configured"))
        })
    }

    fn expand_base_url(&self, template: &str) -> String {
        BASE_URL_TOKENS
            .iter()
            .fold(template.to_string(), |url, token| {
                url.replace(token, self.config.base_url.trim_end_matches('/'))
            })
    }

    fn default_auth_field(&self) -> String {
        match self.config.auth.auth_type {
            AuthType::OAuth2 => "access_token".to_string(),
            AuthType::ApiKey | AuthType::None => self
                .config
                .auth
                .fields
                .first()
                .map(|field| field.key.clone())
                .unwrap_or_else(|| "apiKey".to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ConfigStore, HttpMethod};
    use crate::engine::http::HttpResponse;
    use crate::error::ErrorKind;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Records requests and answers from a queue of canned responses.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<AppResult<HttpResponse>>>,
    }

    impl FakeTransport {
        pub fn respond(&self, status: u16, body: Value) -> &Self {
            let status_text = match status {
                200 => "OK",
                401 => "Unauthorized",
                404 => "Not Found",
                500 => "Internal Server Error",
                _ => "",
            };
            self.responses.lock().unwrap().push_back(Ok(HttpResponse {
                status,
                status_text: status_text.to_string(),
                body,
            }));
            self
        }

        pub fn fail(&self, err: AppError) -> &Self {
            self.responses.lock().unwrap().push_back(Err(err));
            self
        }

        pub fn sent(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> AppResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::remote("no canned response")))
        }
    }

    pub(crate) fn values(raw: Value) -> Values {
        match raw {
            Value::Object(map) => map,
            _ => Values::new(),
        }
    }

    fn airtable() -> Arc<ServiceConfiguration> {
        ConfigStore::bundled().unwrap().get("airtable").unwrap()
    }

    fn vault_with(auth: Value) -> CredentialVault {
        let vault = CredentialVault::open(Arc::new(MemoryStorage::new()));
        for (key, value) in values(auth) {
            vault.set(&key, value).unwrap();
        }
        vault
    }

    #[tokio::test]
    async fn fetch_unwraps_response_field() {
        let config = airtable();
        let vault = vault_with(json!({"apiKey": "pat123"}));
        let http = FakeTransport::default();
        http.respond(200, json!({"records": [{"id": 1, "fields": {"name": "A"}}]}));
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "app1", "tableName": "Tasks"}));
        let data = executor
            .execute(OperationName::Fetch, &inputs, &Values::new())
            .await
            .unwrap();

        assert_eq!(data, json!([{"id": 1, "fields": {"name": "A"}}]));
        let sent = http.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, HttpMethod::Get);
        assert_eq!(sent[0].url, "https://api.airtable.com/v0/app1/Tasks");
        assert_eq!(sent[0].header("Authorization"), Some("Bearer pat123"));
        assert!(sent[0].body.is_none());
    }

    #[tokio::test]
    async fn missing_response_field_yields_empty_list() {
        let config = airtable();
        let vault = vault_with(json!({"apiKey": "pat123"}));
        let http = FakeTransport::default();
        http.respond(200, json!({"offset": "x"}));
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "app1", "tableName": "Tasks"}));
        let data = executor
            .execute(OperationName::Fetch, &inputs, &Values::new())
            .await
            .unwrap();

        assert_eq!(data, json!([]));
    }

    #[tokio::test]
    async fn runtime_params_override_inputs() {
        let config = airtable();
        let vault = vault_with(json!({"apiKey": "pat123"}));
        let http = FakeTransport::default();
        http.respond(200, json!({"id": "rec9"}));
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "app1", "tableName": "Tasks", "recordId": "stale", "Name": "Milk", "Quantity": "2"}));
        let runtime = values(json!({"recordId": "rec9"}));
        executor
            .execute(OperationName::Update, &inputs, &runtime)
            .await
            .unwrap();

        let sent = http.sent();
        assert_eq!(sent[0].method, HttpMethod::Patch);
        assert_eq!(sent[0].url, "https://api.airtable.com/v0/app1/Tasks/rec9");
        assert_eq!(
            sent[0].body,
            Some(json!({"fields": {"Name": "Milk", "Quantity": 2}, "typecast": true}))
        );
    }

    #[tokio::test]
    async fn missing_required_field_never_calls_out() {
        let config = airtable();
        let vault = vault_with(json!({"apiKey": "pat123"}));
        let http = FakeTransport::default();
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "app1", "tableName": ""}));
        let err = executor
            .execute(OperationName::Fetch, &inputs, &Values::new())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::Validation));
        assert_eq!(err.message, "Missing required fields: tableName");
        assert!(http.sent().is_empty());
    }

    #[tokio::test]
    async fn undeclared_operation_is_a_configuration_error() {
        let config = ConfigStore::bundled().unwrap().get("gmail").unwrap();
        let vault = vault_with(json!({"access_token": "t"}));
        let http = FakeTransport::default();
        let executor = OperationExecutor::new(&config, &vault, &http);

        let err = executor
            .execute(OperationName::Delete, &Values::new(), &Values::new())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::Configuration));
        assert_eq!(err.message, "Operation delete not configured");
        assert!(http.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_an_auth_error() {
        let config = airtable();
        let vault = vault_with(json!({}));
        let http = FakeTransport::default();
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "app1", "tableName": "Tasks"}));
        let err = executor
            .execute(OperationName::Fetch, &inputs, &Values::new())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::Auth));
        assert!(http.sent().is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_not_retried() {
        let config = airtable();
        let vault = vault_with(json!({"apiKey": "pat123"}));
        let http = FakeTransport::default();
        http.respond(500, Value::Null).respond(200, json!({"records": []}));
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "app1", "tableName": "Tasks"}));
        let err = executor
            .execute(OperationName::Fetch, &inputs, &Values::new())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::RemoteCall));
        assert_eq!(err.status, Some(500));
        assert_eq!(err.message, "API call failed: 500 Internal Server Error");
        assert_eq!(http.sent().len(), 1);
    }

    #[tokio::test]
    async fn values_array_payload_keeps_column_alignment() {
        let config = ConfigStore::bundled().unwrap().get("googlesheets").unwrap();
        let vault = vault_with(json!({"access_token": "ya29"}));
        let http = FakeTransport::default();
        http.respond(200, json!({"updates": {}}));
        let executor = OperationExecutor::new(&config, &vault, &http);

        let inputs = values(json!({"baseId": "sheet1", "tableName": "Sheet 1", "Name": "Ada", "Age": "36"}));
        executor
            .execute(OperationName::Create, &inputs, &Values::new())
            .await
            .unwrap();

        let sent = http.sent();
        assert_eq!(
            sent[0].url,
            "https://sheets.googleapis.com/v4/spreadsheets/sheet1/values/Sheet%201:append?valueInputOption=USER_ENTERED"
        );
        assert_eq!(sent[0].body, Some(json!({"values": [["Ada", "", "36"]]})));
        assert_eq!(sent[0].header("Authorization"), Some("Bearer ya29"));
    }
}

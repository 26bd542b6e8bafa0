use crate::config::{AuthType, HttpMethod, InputField, ServiceConfiguration, Values};
use crate::engine::http::{HttpRequest, HttpTransport};
use crate::engine::template::{self, is_blank, value_to_text};
use crate::error::AppResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropdownOption {
    pub label: String,
    pub value: String,
}

/// Resolved options per dynamic-dropdown field key.
pub type DropdownData = BTreeMap<String, Vec<DropdownOption>>;

pub struct DropdownLoader<'a> {
    config: &'a ServiceConfiguration,
    http: &'a dyn HttpTransport,
}

impl<'a> DropdownLoader<'a> {
    pub fn new(config: &'a ServiceConfiguration, http: &'a dyn HttpTransport) -> Self {
        Self { config, http }
    }

    /// Fetches the options of `field` and stores them under its key.
    ///
    /// Fields without a data source are left alone and yield no options.
    pub async fn load(
        &self,
        field: &InputField,
        input_values: &Values,
        auth_values: &Values,
        data: &mut DropdownData,
    ) -> AppResult<Vec<DropdownOption>> {
        let Some(source) = &field.data_source else {
            return Ok(Vec::new());
        };

        let url = template::resolve_url(&source.url, input_values);
        let mut request = HttpRequest::new(HttpMethod::Get, url);
        if let Some(token) = self.api_key(auth_values) {
            request = request.bearer(&token);
        }
        log::debug!("loading options for `{}` from {}", field.key, request.url);

        let response = self.http.send(request).await?.ensure_success()?;
        let options: Vec<DropdownOption> =
            extract_items(&response.body, source.response_field.as_deref())
                .iter()
                .map(|item| DropdownOption {
                    label: option_text(item.get(&source.label_field)),
                    value: option_text(item.get(&source.value_field)),
                })
                .collect();

        data.insert(field.key.clone(), options.clone());
        Ok(options)
    }

    fn api_key(&self, auth_values: &Values) -> Option<String> {
        if self.config.auth.auth_type != AuthType::ApiKey {
            return None;
        }
        let key_field = self.config.auth.fields.first()?;
        auth_values
            .get(&key_field.key)
            .filter(|value| !is_blank(value))
            .map(value_to_text)
    }
}

/// Locates the option list in a data-source response.
///
/// Precedence: declared `responseField`, then `bases`, then `tables`, then the
/// body itself when it is an array, else nothing. Keys present without an
/// array value fall through to the next candidate.
pub fn extract_items(body: &Value, response_field: Option<&str>) -> Vec<Value> {
    let found = match response_field {
        Some(field) => body.get(field).and_then(Value::as_array),
        None => ["bases", "tables"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_array))
            .or_else(|| body.as_array()),
    };

    found.cloned().unwrap_or_default()
}

fn option_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(value) => value_to_text(value),
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Named runtime values (form inputs, credentials, action parameters).
pub type Values = serde_json::Map<String, Value>;

/// Input keys that select *where* records live rather than *what* a record holds.
pub const CONFIG_FIELD_KEYS: [&str; 3] = ["baseId", "tableName", "query"];

/// Input slot holding the value half of a `key_value` field; the key half is
/// stored under the field's own key.
pub const KEY_VALUE_SLOT: &str = "Value";

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfiguration {
    #[serde(rename = "servicecode")]
    pub service_code: String,
    #[serde(rename = "baseurl", alias = "baseUrl", default)]
    pub base_url: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub inputs: Vec<InputField>,
    #[serde(default)]
    pub operations: BTreeMap<OperationName, OperationConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

impl ServiceConfiguration {
    pub fn display_name(&self) -> &str {
        [&self.name, &self.service]
            .into_iter()
            .find(|label| !label.is_empty())
            .unwrap_or(&self.service_code)
    }

    pub fn config_fields(&self) -> Vec<&InputField> {
        self.inputs
            .iter()
            .filter(|input| input.is_config_field())
            .collect()
    }

    pub fn data_fields(&self) -> Vec<&InputField> {
        self.inputs
            .iter()
            .filter(|input| !input.is_config_field())
            .collect()
    }

    pub fn has_key_value_field(&self) -> bool {
        self.inputs
            .iter()
            .any(|field| field.field_type == FieldType::KeyValue)
    }

    pub fn input(&self, key: &str) -> Option<&InputField> {
        self.inputs.iter().find(|input| input.key == key)
    }

    pub fn operation(&self, name: OperationName) -> Option<&OperationConfig> {
        self.operations.get(&name)
    }

    pub fn display_fields(&self) -> Vec<String> {
        match &self.output.fields {
            Some(fields) => fields.clone(),
            None => self
                .data_fields()
                .into_iter()
                .map(|field| field.key.clone())
                .collect(),
        }
    }

    pub fn action_enabled(&self, action: RowAction) -> bool {
        self.output.actions.contains(&action)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    ApiKey,
    #[serde(rename = "OAUTH2")]
    OAuth2,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthFlow {
    #[default]
    Manual,
    Redirect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Code,
    Token,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub flow: AuthFlow,
    #[serde(default)]
    pub fields: Vec<AuthField>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Option<String>,
    #[serde(default)]
    pub response_type: ResponseType,
}

impl AuthConfig {
    pub fn is_redirect_oauth(&self) -> bool {
        self.auth_type == AuthType::OAuth2 && self.flow == AuthFlow::Redirect
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Closed set of form control types understood by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Textarea,
    Checkbox,
    DynamicDropdown,
    KeyValue,
    Json,
    Email,
    Password,
    Date,
    Url,
    Tel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub data_source: Option<DataSource>,
    #[serde(default)]
    pub key_options: Vec<KeyOption>,
    #[serde(default)]
    pub value_field_label: Option<String>,
    #[serde(default = "default_true")]
    pub visible: bool,
}

impl InputField {
    pub fn is_config_field(&self) -> bool {
        CONFIG_FIELD_KEYS.contains(&self.key.as_str())
    }

    pub fn is_dynamic_dropdown(&self) -> bool {
        self.field_type == FieldType::DynamicDropdown
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub url: String,
    pub label_field: String,
    pub value_field: String,
    #[serde(default)]
    pub response_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationName {
    Fetch,
    Create,
    Update,
    Delete,
}

impl Display for OperationName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationName::Fetch => "fetch",
            OperationName::Create => "create",
            OperationName::Update => "update",
            OperationName::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Header,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    pub url: String,
    #[serde(default, deserialize_with = "deserialize_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
    #[serde(default)]
    pub auth_field: Option<String>,
    #[serde(default)]
    pub response_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Edit,
    Delete,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub actions: Vec<RowAction>,
}

fn default_true() -> bool {
    true
}

fn deserialize_method<'de, D>(deserializer: D) -> Result<HttpMethod, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(HttpMethod::Get),
        "POST" => Ok(HttpMethod::Post),
        "PUT" => Ok(HttpMethod::Put),
        "PATCH" => Ok(HttpMethod::Patch),
        "DELETE" => Ok(HttpMethod::Delete),
        other => Err(serde::de::Error::custom(format!(
            "unsupported HTTP method `{other}`"
        ))),
    }
}

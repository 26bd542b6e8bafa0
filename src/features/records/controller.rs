use crate::config::{InputField, KEY_VALUE_SLOT, OperationName, ServiceConfiguration, Values};
use crate::engine::dropdown::{DropdownData, DropdownLoader, DropdownOption};
use crate::engine::executor::OperationExecutor;
use crate::engine::http::HttpTransport;
use crate::engine::template::{is_blank, value_to_text};
use crate::error::{AppError, AppResult};
use crate::features::auth::vault::CredentialVault;
use crate::storage::{EDITING_ID_KEY, INPUT_VALUES_KEY, LocalStorage, read_slice, write_slice};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

const RECORD_ID_PARAM: &str = "recordId";
const RESULT_KEYS: [&str; 3] = ["records", "data", "result"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Success,
    Info,
    Warning,
}

/// Transient user-facing messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice, message: &str);
}

/// Asks the user to approve a destructive action.
pub trait Confirmation {
    fn confirm(&self, prompt: &str) -> AppResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: String,
    pub fields: Values,
}

impl Record {
    /// `record.fields` when present, else the record object itself; array rows
    /// are mapped onto the data fields by position.
    fn from_row(index: usize, row: &Value, data_fields: &[&InputField]) -> Self {
        let id = match row.get("id") {
            Some(value) if !value.is_null() => value_to_text(value),
            _ => index.to_string(),
        };

        let fields = match row {
            Value::Object(object) => match object.get("fields") {
                Some(Value::Object(fields)) => fields.clone(),
                _ => object.clone(),
            },
            Value::Array(cells) => data_fields
                .iter()
                .zip(cells)
                .map(|(field, cell)| (field.key.clone(), cell.clone()))
                .collect(),
            _ => Values::new(),
        };

        Self { id, fields }
    }
}

/// Form state, record list and CRUD actions for one service screen.
pub struct RecordViewController {
    config: Arc<ServiceConfiguration>,
    vault: Arc<CredentialVault>,
    http: Arc<dyn HttpTransport>,
    storage: Arc<dyn LocalStorage>,
    notifier: Arc<dyn Notifier>,
    input_values: Values,
    editing_id: Option<String>,
    dropdown_data: DropdownData,
    records: Vec<Record>,
    loading: bool,
    error: Option<String>,
}

impl RecordViewController {
    pub fn new(
        config: Arc<ServiceConfiguration>,
        vault: Arc<CredentialVault>,
        http: Arc<dyn HttpTransport>,
        storage: Arc<dyn LocalStorage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let input_values = read_slice(storage.as_ref(), INPUT_VALUES_KEY);
        let editing_id = read_slice(storage.as_ref(), EDITING_ID_KEY);

        Self {
            config,
            vault,
            http,
            storage,
            notifier,
            input_values,
            editing_id,
            dropdown_data: DropdownData::new(),
            records: Vec::new(),
            loading: false,
            error: None,
        }
    }

    pub fn config(&self) -> &ServiceConfiguration {
        &self.config
    }

    pub fn input_values(&self) -> &Values {
        &self.input_values
    }

    pub fn editing_id(&self) -> Option<&str> {
        self.editing_id.as_deref()
    }

    pub fn dropdown_options(&self, key: &str) -> &[DropdownOption] {
        self.dropdown_data.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Stores one input value and refreshes the dropdowns that depend on it.
    pub async fn set_input(&mut self, key: &str, value: Value) -> AppResult<()> {
        if key == KEY_VALUE_SLOT && self.config.input(key).is_none() && self.config.has_key_value_field()
        {
            self.input_values.insert(KEY_VALUE_SLOT.to_string(), value);
            return self.persist_inputs();
        }

        let field = self.config.input(key).ok_or_else(|| {
            AppError::configuration(format!(
                "Field `{key}` is not declared for {}.",
                self.config.service_code
            ))
        })?;
        let cleared = is_blank(&value);
        self.input_values.insert(field.key.clone(), value);
        self.persist_inputs()?;

        let dependents: Vec<InputField> = self
            .config
            .inputs
            .iter()
            .filter(|input| input.is_dynamic_dropdown())
            .filter(|input| input.depends_on.as_deref() == Some(key))
            .cloned()
            .collect();

        for dependent in dependents {
            if cleared {
                self.dropdown_data.insert(dependent.key.clone(), Vec::new());
            } else if self.vault.is_authenticated() {
                self.load_dropdown(&dependent).await?;
            }
        }
        Ok(())
    }

    /// Loads every dropdown without a dependency, and dependent ones whose parent is set.
    pub async fn load_independent_dropdowns(&mut self) -> AppResult<()> {
        if !self.vault.is_authenticated() {
            return Ok(());
        }

        let dropdowns: Vec<InputField> = self
            .config
            .inputs
            .iter()
            .filter(|input| input.is_dynamic_dropdown())
            .cloned()
            .collect();

        for field in dropdowns.iter().filter(|field| field.depends_on.is_none()) {
            self.load_dropdown(field).await?;
        }
        for field in dropdowns.iter().filter(|field| field.depends_on.is_some()) {
            let parent_set = field
                .depends_on
                .as_deref()
                .and_then(|parent| self.input_values.get(parent))
                .is_some_and(|value| !is_blank(value));
            if parent_set {
                self.load_dropdown(field).await?;
            } else {
                self.dropdown_data.insert(field.key.clone(), Vec::new());
            }
        }
        Ok(())
    }

    /// Loads the options of a single dropdown field by key.
    pub async fn load_options(&mut self, key: &str) -> AppResult<Vec<DropdownOption>> {
        let field = self
            .config
            .input(key)
            .filter(|input| input.is_dynamic_dropdown())
            .cloned()
            .ok_or_else(|| {
                AppError::configuration(format!("`{key}` is not a dynamic dropdown field."))
            })?;
        if !self.vault.is_authenticated() {
            return Err(AppError::auth("Please log in first."));
        }
        self.load_dropdown(&field).await?;
        Ok(self.dropdown_options(key).to_vec())
    }

    async fn load_dropdown(&mut self, field: &InputField) -> AppResult<()> {
        self.loading = true;
        let auth_values = self.vault.values();
        let loader = DropdownLoader::new(&self.config, self.http.as_ref());
        let result = loader
            .load(field, &self.input_values, &auth_values, &mut self.dropdown_data)
            .await;
        self.loading = false;

        result.map(|_| ()).map_err(|err| {
            log::warn!("options for `{}` failed: {err}", field.key);
            self.fail(AppError::new(
                err.kind,
                format!("Failed to load {} options", field.label),
            ))
        })
    }

    /// Replaces the record list with the backend's; keeps the old list on failure.
    pub async fn fetch_records(&mut self) -> AppResult<usize> {
        self.loading = true;
        self.error = None;
        let result = self.execute(OperationName::Fetch, &Values::new()).await;
        self.loading = false;

        let body = result.map_err(|err| self.fail(err))?;
        let data_fields = self.config.data_fields();
        self.records = normalize_records(body)
            .iter()
            .enumerate()
            .map(|(index, row)| Record::from_row(index, row, &data_fields))
            .collect();

        let count = self.records.len();
        self.notifier
            .notify(Notice::Success, &format!("Loaded {count} records"));
        Ok(count)
    }

    /// Creates, or updates the record being edited, then reloads the list.
    pub async fn submit(&mut self) -> AppResult<()> {
        let missing: Vec<String> = self
            .config
            .data_fields()
            .into_iter()
            .filter(|field| field.required)
            .filter(|field| self.input_values.get(&field.key).is_none_or(is_blank))
            .map(|field| field.label.clone())
            .collect();
        if !missing.is_empty() {
            let err = AppError::missing_fields("Please fill in", &missing);
            self.notifier.notify(Notice::Warning, &err.message);
            return Err(self.fail(err));
        }

        let (operation, params) = match &self.editing_id {
            Some(id) => (OperationName::Update, record_params(id)),
            None => (OperationName::Create, Values::new()),
        };

        self.loading = true;
        self.error = None;
        let result = self.execute(operation, &params).await;
        self.loading = false;
        result.map_err(|err| self.fail(err))?;

        let message = if operation == OperationName::Update {
            "Record updated successfully!"
        } else {
            "Record created successfully!"
        };
        self.notifier.notify(Notice::Success, message);

        self.clear_form()?;
        self.fetch_records().await.map(|_| ())
    }

    /// Deletes after confirmation; returns `false` when the user declined.
    pub async fn delete(&mut self, id: &str, confirmation: &dyn Confirmation) -> AppResult<bool> {
        if !confirmation.confirm("Are you sure you want to delete this record?")? {
            return Ok(false);
        }

        self.loading = true;
        self.error = None;
        let result = self.execute(OperationName::Delete, &record_params(id)).await;
        self.loading = false;
        result.map_err(|err| self.fail(err))?;

        self.notifier.notify(Notice::Success, "Record deleted!");
        self.fetch_records().await?;
        Ok(true)
    }

    /// Copies the record at `index` into the form and marks it as being edited.
    pub fn begin_edit(&mut self, index: usize) -> AppResult<()> {
        let record = self.records.get(index).cloned().ok_or_else(|| {
            AppError::validation(format!("No record at position {}.", index + 1))
        })?;

        for field in self.config.data_fields() {
            if let Some(value) = record.fields.get(&field.key).filter(|value| !value.is_null()) {
                self.input_values.insert(field.key.clone(), value.clone());
            }
        }
        self.editing_id = Some(record.id);
        self.persist_inputs()?;
        self.persist_editing_id()
    }

    /// Position of the record with `id` in the current list.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|record| record.id == id)
    }

    pub fn reset(&mut self) -> AppResult<()> {
        self.error = None;
        self.clear_form()
    }

    fn clear_form(&mut self) -> AppResult<()> {
        for field in self.config.data_fields() {
            self.input_values
                .insert(field.key.clone(), Value::String(String::new()));
        }
        self.editing_id = None;
        self.persist_inputs()?;
        self.persist_editing_id()
    }

    async fn execute(&self, operation: OperationName, params: &Values) -> AppResult<Value> {
        OperationExecutor::new(&self.config, &self.vault, self.http.as_ref())
            .execute(operation, &self.input_values, params)
            .await
    }

    fn fail(&mut self, err: AppError) -> AppError {
        self.error = Some(err.message.clone());
        err
    }

    fn persist_inputs(&self) -> AppResult<()> {
        write_slice(self.storage.as_ref(), INPUT_VALUES_KEY, &self.input_values)
    }

    fn persist_editing_id(&self) -> AppResult<()> {
        write_slice(self.storage.as_ref(), EDITING_ID_KEY, &self.editing_id)
    }
}

fn record_params(id: &str) -> Values {
    let mut params = Values::new();
    params.insert(RECORD_ID_PARAM.to_string(), Value::String(id.to_string()));
    params
}

/// An array is taken as-is, else the first of `records`, `data`, `result` that is one.
fn normalize_records(body: Value) -> Vec<Value> {
    match body {
        Value::Array(rows) => rows,
        Value::Object(mut object) => RESULT_KEYS
            .iter()
            .find_map(|key| match object.remove(*key) {
                Some(Value::Array(rows)) => Some(rows),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

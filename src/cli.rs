use crate::config::FieldType;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "apiblock",
    bin_name = "apiblock",
    version,
    about = "Configuration-driven CRUD console for third-party data services"
)]
pub struct Cli {
    /// Service configuration document (defaults to $APIBLOCK_SERVICES, then the bundled one).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Keep session state in memory only.
    #[arg(long, global = true)]
    pub ephemeral: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List configured services.
    Services(JsonArgs),
    /// Select the active service.
    Use(UseArgs),
    /// Show the active service and session state.
    Status(JsonArgs),
    /// Authenticate with the active service.
    Login(LoginArgs),
    /// Drop stored credentials for the active service.
    Logout,
    /// Manage form input values.
    Input(InputArgs),
    /// Load the options of a dynamic dropdown field.
    Options(OptionsArgs),
    /// List and modify records.
    Records(RecordsArgs),
    /// Interactive session with background token refresh.
    Shell(ShellArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct UseArgs {
    pub service: String,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Credential field value, for example `--set apiKey=pat123`.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub values: Vec<(String, String)>,
    #[arg(long)]
    pub no_browser: bool,
    /// Provider return address, pasted from the browser.
    #[arg(long, value_name = "URL")]
    pub callback_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct InputArgs {
    #[command(subcommand)]
    pub command: InputCommand,
}

#[derive(Debug, Subcommand)]
pub enum InputCommand {
    /// Store one or more input values.
    Set(InputSetArgs),
    /// Print the stored input values.
    Show(JsonArgs),
    /// Clear data fields and leave edit mode.
    Reset,
}

#[derive(Debug, Args)]
pub struct InputSetArgs {
    #[arg(value_name = "KEY=VALUE", required = true, value_parser = parse_assignment)]
    pub values: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct OptionsArgs {
    pub field: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct RecordsArgs {
    #[command(subcommand)]
    pub command: RecordsCommand,
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommand {
    /// Fetch and print records.
    List(JsonArgs),
    /// Create a record from the form values.
    Add(RecordWriteArgs),
    /// Update an existing record.
    Edit(RecordEditArgs),
    /// Delete a record.
    Delete(RecordDeleteArgs),
}

#[derive(Debug, Args)]
pub struct RecordWriteArgs {
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub values: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct RecordEditArgs {
    pub id: String,
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub values: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct RecordDeleteArgs {
    pub id: String,
    /// Skip the confirmation prompt.
    #[arg(long)]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct ShellArgs {
    /// Service to select before starting.
    pub service: Option<String>,
}

pub fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Converts typed command-line text into the value a form field holds.
pub fn field_value(field_type: FieldType, raw: &str) -> Value {
    match field_type {
        FieldType::Checkbox => Value::Bool(matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1" | "on"
        )),
        FieldType::Json | FieldType::KeyValue => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        }
        FieldType::Text
        | FieldType::Number
        | FieldType::Textarea
        | FieldType::DynamicDropdown
        | FieldType::Email
        | FieldType::Password
        | FieldType::Date
        | FieldType::Url
        | FieldType::Tel => Value::String(raw.to_string()),
    }
}

mod cli;
mod config;
mod engine;
mod error;
mod features;
mod session;
mod shell;
mod storage;
mod ui;

use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::cli::{
    Cli, Command, InputCommand, JsonArgs, LoginArgs, OptionsArgs, RecordDeleteArgs,
    RecordEditArgs, RecordWriteArgs, RecordsCommand, field_value,
};
use crate::config::{AuthType, ConfigStore, FieldType, KEY_VALUE_SLOT};
use crate::engine::{HttpTransport, ReqwestTransport};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::features::auth::flow::AuthState;
use crate::features::auth::login::{self, LoginOptions, LoginOutcome};
use crate::features::records::RecordViewController;
use crate::features::records::view::render_table;
use crate::session::{Session, Storages, active_service, select_service};
use crate::storage::ensure_config_dir;
use crate::ui::{
    PromptConfirmation, TerminalNotifier, is_interactive_terminal, prompt_secret_input,
    prompt_visible_input,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let exit_code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", format!("Error: {}", err.message).red());
            if err.is(ErrorKind::Auth) {
                eprintln!("{}", "Run `apiblock login` to sign in.".bright_black());
            }
            err.code
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> AppResult<()> {
    let cli = Cli::parse();
    let store = ConfigStore::resolve(cli.config.as_deref())?;
    let storages = if cli.ephemeral {
        Storages::ephemeral()
    } else {
        Storages::persistent(&ensure_config_dir()?)
    };

    match cli.command {
        Command::Services(args) => handle_services(&store, &storages, args),
        Command::Use(args) => {
            let config = select_service(&store, &storages, &args.service)?;
            println!("Using {} ({}).", config.display_name(), config.service_code);
            Ok(())
        }
        Command::Shell(args) => {
            if let Some(code) = args.service.as_deref() {
                select_service(&store, &storages, code)?;
            }
            let mut session = open_session(&store, &storages)?;
            let result = shell::run(&mut session).await;
            session.teardown();
            result
        }
        command => {
            let mut session = open_session(&store, &storages)?;
            let result = dispatch(&mut session, &storages, command).await;
            session.teardown();
            result
        }
    }
}

fn open_session(store: &ConfigStore, storages: &Storages) -> AppResult<Session> {
    let config = active_service(store, storages)?;
    let http: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
    Ok(Session::init(
        config,
        storages,
        http,
        Arc::new(TerminalNotifier),
    ))
}

async fn dispatch(session: &mut Session, storages: &Storages, command: Command) -> AppResult<()> {
    match command {
        Command::Status(args) => handle_status(session, storages, args),
        Command::Login(args) => handle_login(session, args).await,
        Command::Logout => {
            session.auth.logout()?;
            println!("{}", "Logged out.".green());
            Ok(())
        }
        Command::Input(args) => match args.command {
            InputCommand::Set(args) => {
                apply_assignments(&mut session.records, args.values).await?;
                println!("{}", "Input values saved.".green());
                Ok(())
            }
            InputCommand::Show(args) => handle_input_show(&session.records, args),
            InputCommand::Reset => {
                session.records.reset()?;
                println!("{}", "Form reset.".green());
                Ok(())
            }
        },
        Command::Options(args) => handle_options(session, args).await,
        Command::Records(args) => {
            require_authenticated(session)?;
            match args.command {
                RecordsCommand::List(args) => handle_records_list(&mut session.records, args).await,
                RecordsCommand::Add(args) => handle_records_add(&mut session.records, args).await,
                RecordsCommand::Edit(args) => handle_records_edit(&mut session.records, args).await,
                RecordsCommand::Delete(args) => {
                    handle_records_delete(&mut session.records, args).await
                }
            }
        }
        Command::Services(_) | Command::Use(_) | Command::Shell(_) => Err(AppError::generic(
            "Command is handled before a session is opened.",
        )),
    }
}

#[derive(Serialize)]
struct ServiceSummary<'a> {
    code: &'a str,
    id: Option<&'a Value>,
    name: &'a str,
    description: &'a str,
    auth: AuthType,
    operations: Vec<String>,
    active: bool,
}

fn handle_services(store: &ConfigStore, storages: &Storages, args: JsonArgs) -> AppResult<()> {
    let active = storages.selected_service();
    let summaries: Vec<ServiceSummary<'_>> = store
        .services()
        .iter()
        .map(|config| ServiceSummary {
            code: &config.service_code,
            id: config.id.as_ref(),
            name: config.display_name(),
            description: &config.description,
            auth: config.auth.auth_type,
            operations: config.operations.keys().map(ToString::to_string).collect(),
            active: active.as_deref() == Some(config.service_code.as_str()),
        })
        .collect();

    if args.json {
        return print_json(&summaries);
    }

    for summary in &summaries {
        let marker = if summary.active { "*".green() } else { " ".normal() };
        println!(
            "{marker} {:<14} {} {}",
            summary.code.bold(),
            summary.name,
            format!("({})", summary.operations.join(", ")).bright_black()
        );
        if !summary.description.is_empty() {
            println!("    {}", summary.description.bright_black());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusOutput {
    service: String,
    name: String,
    auth_type: AuthType,
    authenticated: bool,
    authenticating: bool,
    expires_at: Option<i64>,
    credentials: Vec<String>,
    editing_id: Option<String>,
    input_values: serde_json::Map<String, Value>,
    secret_store: Option<String>,
}

fn handle_status(session: &Session, storages: &Storages, args: JsonArgs) -> AppResult<()> {
    let state = session.auth.state();
    let credentials = session
        .config
        .auth
        .fields
        .iter()
        .filter(|field| session.vault.get_text(&field.key).is_some())
        .map(|field| field.key.clone())
        .collect();
    let secret_store = storages
        .secret_location
        .as_ref()
        .map(|path| path.display().to_string());

    let output = StatusOutput {
        service: session.config.service_code.clone(),
        name: session.config.display_name().to_string(),
        auth_type: session.config.auth.auth_type,
        authenticated: state == AuthState::Authenticated,
        authenticating: state == AuthState::Authenticating,
        expires_at: session.vault.expires_at(),
        credentials,
        editing_id: session.records.editing_id().map(str::to_string),
        input_values: session.records.input_values().clone(),
        secret_store,
    };

    if args.json {
        return print_json(&output);
    }

    println!("Service: {} ({})", output.name.bold(), output.service);
    let state_label = match state {
        AuthState::Authenticated => "authenticated".green(),
        AuthState::Authenticating => "waiting for provider redirect".yellow(),
        AuthState::Unauthenticated => "not authenticated".red(),
    };
    println!("Auth: {:?}, {state_label}", output.auth_type);
    if let Some(expires_at) = output.expires_at {
        println!("Token expires at: {expires_at} (ms since epoch)");
    }
    if let Some(editing_id) = &output.editing_id {
        println!("Editing record: {editing_id}");
    }
    if let Some(path) = &output.secret_store {
        println!("{}", format!("Secrets: {path}").bright_black());
    }
    Ok(())
}

async fn handle_login(session: &mut Session, args: LoginArgs) -> AppResult<()> {
    for (key, raw) in args.values {
        let field = session
            .config
            .auth
            .fields
            .iter()
            .find(|field| field.key == key)
            .ok_or_else(|| {
                AppError::validation(format!(
                    "`{key}` is not a credential field of {}.",
                    session.config.service_code
                ))
            })?;
        session.vault.set(&field.key, field_value(field.field_type, &raw))?;
    }

    if args.callback_url.is_none() && is_interactive_terminal() {
        prompt_missing_credentials(session)?;
    }

    let outcome = login::run(
        &session.auth,
        LoginOptions {
            no_browser: args.no_browser,
            callback_url: args.callback_url,
        },
    )
    .await?;

    match outcome {
        LoginOutcome::Authenticated => {
            println!(
                "{}",
                format!("Authenticated with {}.", session.config.display_name()).green()
            );
            session.records.load_independent_dropdowns().await
        }
        LoginOutcome::AwaitingCallback { .. } => {
            println!(
                "After approving access, run `apiblock login --callback-url <address>` with the address your browser landed on."
            );
            Ok(())
        }
    }
}

pub(crate) fn prompt_missing_credentials(session: &Session) -> AppResult<()> {
    for field in &session.config.auth.fields {
        if session.vault.get_text(&field.key).is_some() {
            continue;
        }
        let raw = if field.field_type == FieldType::Password {
            prompt_secret_input(&field.label)?
        } else {
            prompt_visible_input(&field.label, None)?
        };
        if !raw.is_empty() {
            session.vault.set(&field.key, field_value(field.field_type, &raw))?;
        }
    }
    Ok(())
}

fn require_authenticated(session: &Session) -> AppResult<()> {
    if session.vault.is_authenticated() {
        Ok(())
    } else {
        Err(AppError::auth(
            "Not authenticated. Run `apiblock login` first.",
        ))
    }
}

async fn apply_assignments(
    records: &mut RecordViewController,
    values: Vec<(String, String)>,
) -> AppResult<()> {
    for (key, raw) in values {
        let field_type = match records.config().input(&key) {
            Some(field) => field.field_type,
            None if key == KEY_VALUE_SLOT && records.config().has_key_value_field() => {
                FieldType::Text
            }
            None => {
                return Err(AppError::validation(format!(
                    "Unknown input field `{key}`."
                )));
            }
        };
        records.set_input(&key, field_value(field_type, &raw)).await?;
    }
    Ok(())
}

fn handle_input_show(records: &RecordViewController, args: JsonArgs) -> AppResult<()> {
    if args.json {
        return print_json(records.input_values());
    }

    let config = records.config();
    let grouped = config
        .config_fields()
        .into_iter()
        .map(|field| ("config", field))
        .chain(config.data_fields().into_iter().map(|field| ("data", field)));
    for (kind, field) in grouped {
        let value = records
            .input_values()
            .get(&field.key)
            .map(display_value)
            .unwrap_or_default();
        println!(
            "{:<16} {} {}",
            field.key,
            value,
            format!("[{kind}{}]", if field.required { ", required" } else { "" })
                .bright_black()
        );
    }
    if let Some(id) = records.editing_id() {
        println!("{}", format!("Editing record {id}").yellow());
    }
    Ok(())
}

async fn handle_options(session: &mut Session, args: OptionsArgs) -> AppResult<()> {
    let options = session.records.load_options(&args.field).await?;
    if args.json {
        return print_json(&options);
    }

    if options.is_empty() {
        println!("{}", "No options available.".bright_black());
    }
    for option in options {
        println!("{:<32} {}", option.label, option.value.bright_black());
    }
    Ok(())
}

async fn handle_records_list(records: &mut RecordViewController, args: JsonArgs) -> AppResult<()> {
    records.fetch_records().await?;
    if args.json {
        return print_json(records.records());
    }
    println!("{}", render_table(records.config(), records.records()));
    Ok(())
}

async fn handle_records_add(
    records: &mut RecordViewController,
    args: RecordWriteArgs,
) -> AppResult<()> {
    if records.editing_id().is_some() {
        records.reset()?;
    }
    let prompt = args.values.is_empty() && is_interactive_terminal();
    apply_assignments(records, args.values).await?;
    if prompt {
        prompt_data_fields(records).await?;
    }
    records.submit().await
}

async fn handle_records_edit(
    records: &mut RecordViewController,
    args: RecordEditArgs,
) -> AppResult<()> {
    records.fetch_records().await?;
    let index = records
        .position_of(&args.id)
        .ok_or_else(|| AppError::validation(format!("Record `{}` not found.", args.id)))?;
    records.begin_edit(index)?;

    let prompt = args.values.is_empty() && is_interactive_terminal();
    apply_assignments(records, args.values).await?;
    if prompt {
        prompt_data_fields(records).await?;
    }
    records.submit().await
}

async fn handle_records_delete(
    records: &mut RecordViewController,
    args: RecordDeleteArgs,
) -> AppResult<()> {
    let confirmation = PromptConfirmation {
        assume_yes: args.yes,
    };
    if !records.delete(&args.id, &confirmation).await? {
        println!("Cancelled.");
    }
    Ok(())
}

/// Prompts for every data field, prefilled with the current value.
pub(crate) async fn prompt_data_fields(records: &mut RecordViewController) -> AppResult<()> {
    let fields: Vec<(String, String, FieldType)> = records
        .config()
        .data_fields()
        .into_iter()
        .map(|field| {
            let label = if field.required {
                format!("{} *", field.label)
            } else {
                field.label.clone()
            };
            (field.key.clone(), label, field.field_type)
        })
        .collect();

    for (key, label, field_type) in fields {
        let current = records.input_values().get(&key).map(display_value);
        let raw = prompt_visible_input(&label, current.as_deref().filter(|text| !text.is_empty()))?;
        records.set_input(&key, field_value(field_type, &raw)).await?;
    }
    Ok(())
}

pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> AppResult<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::generic(format!("Failed to render JSON output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

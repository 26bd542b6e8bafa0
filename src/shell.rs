//! Menu-driven session. Stays open across actions so background token refresh can run.

use crate::cli::field_value;
use crate::config::{FieldType, KEY_VALUE_SLOT, RowAction};
use crate::engine::template::value_to_text;
use crate::error::{AppError, AppResult};
use crate::features::auth::flow::AuthState;
use crate::features::auth::login::{self, LoginOptions, LoginOutcome};
use crate::features::records::view::render_table;
use crate::session::Session;
use crate::ui::{PromptConfirmation, is_interactive_terminal, prompt_select, prompt_visible_input};
use crate::{display_value, prompt_data_fields, prompt_missing_credentials};
use colored::Colorize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Fetch,
    Add,
    Edit,
    Delete,
    SetInput,
    Reset,
    Login,
    Logout,
    Quit,
}

impl Action {
    fn label(self) -> &'static str {
        match self {
            Action::Fetch => "Fetch records",
            Action::Add => "Add record",
            Action::Edit => "Edit record",
            Action::Delete => "Delete record",
            Action::SetInput => "Set input value",
            Action::Reset => "Reset form",
            Action::Login => "Log in",
            Action::Logout => "Log out",
            Action::Quit => "Quit",
        }
    }
}

pub async fn run(session: &mut Session) -> AppResult<()> {
    if !is_interactive_terminal() {
        return Err(AppError::validation(
            "The shell needs an interactive terminal.",
        ));
    }

    if session.vault.is_authenticated() {
        on_authenticated(session).await;
    }

    loop {
        print_header(session);
        let actions = available_actions(session);
        let labels: Vec<String> = actions.iter().map(|action| action.label().to_string()).collect();
        let Some(choice) = prompt_select("Action", &labels)? else {
            break;
        };
        let action = actions[choice];
        if action == Action::Quit {
            break;
        }

        if let Err(err) = perform(session, action).await {
            eprintln!("{}", format!("Error: {}", err.message).red());
        }
    }
    Ok(())
}

fn available_actions(session: &Session) -> Vec<Action> {
    if !session.vault.is_authenticated() {
        return vec![Action::Login, Action::SetInput, Action::Quit];
    }

    let mut actions = vec![Action::Fetch, Action::Add];
    if session.config.action_enabled(RowAction::Edit) {
        actions.push(Action::Edit);
    }
    if session.config.action_enabled(RowAction::Delete) {
        actions.push(Action::Delete);
    }
    actions.extend([Action::SetInput, Action::Reset, Action::Logout, Action::Quit]);
    actions
}

async fn perform(session: &mut Session, action: Action) -> AppResult<()> {
    match action {
        Action::Fetch => {
            session.records.fetch_records().await?;
            println!("{}", render_table(session.records.config(), session.records.records()));
            Ok(())
        }
        Action::Add => {
            if session.records.editing_id().is_some() {
                session.records.reset()?;
            }
            prompt_data_fields(&mut session.records).await?;
            session.records.submit().await
        }
        Action::Edit => {
            let Some(index) = pick_record(session, "Record to edit")? else {
                return Ok(());
            };
            session.records.begin_edit(index)?;
            prompt_data_fields(&mut session.records).await?;
            session.records.submit().await
        }
        Action::Delete => {
            let Some(index) = pick_record(session, "Record to delete")? else {
                return Ok(());
            };
            let id = session.records.records()[index].id.clone();
            let confirmation = PromptConfirmation { assume_yes: false };
            session.records.delete(&id, &confirmation).await.map(|_| ())
        }
        Action::SetInput => set_input(session).await,
        Action::Reset => session.records.reset(),
        Action::Login => {
            prompt_missing_credentials(session)?;
            match login::run(&session.auth, LoginOptions::default()).await? {
                LoginOutcome::Authenticated => {
                    on_authenticated(session).await;
                    Ok(())
                }
                LoginOutcome::AwaitingCallback { .. } => {
                    let pasted = prompt_visible_input("Address your browser landed on", None)?;
                    login::run(
                        &session.auth,
                        LoginOptions {
                            no_browser: true,
                            callback_url: Some(pasted),
                        },
                    )
                    .await?;
                    on_authenticated(session).await;
                    Ok(())
                }
            }
        }
        Action::Logout => {
            session.auth.logout()?;
            println!("{}", "Logged out.".green());
            Ok(())
        }
        Action::Quit => Ok(()),
    }
}

async fn on_authenticated(session: &mut Session) {
    session.start_refresh();
    if let Err(err) = session.records.load_independent_dropdowns().await {
        eprintln!("{}", format!("Error: {}", err.message).red());
    }
}

fn pick_record(session: &Session, prompt: &str) -> AppResult<Option<usize>> {
    let records = session.records.records();
    if records.is_empty() {
        println!("{}", "No records loaded. Fetch records first.".bright_black());
        return Ok(None);
    }

    let first_column = session.config.display_fields().into_iter().next();
    let labels: Vec<String> = records
        .iter()
        .map(|record| {
            let summary = first_column
                .as_ref()
                .and_then(|column| record.fields.get(column))
                .map(value_to_text)
                .unwrap_or_default();
            format!("{}  {summary}", record.id)
        })
        .collect();
    prompt_select(prompt, &labels)
}

async fn set_input(session: &mut Session) -> AppResult<()> {
    let fields: Vec<_> = session
        .config
        .inputs
        .iter()
        .filter(|field| field.visible)
        .cloned()
        .collect();
    let labels: Vec<String> = fields
        .iter()
        .map(|field| {
            let current = session
                .records
                .input_values()
                .get(&field.key)
                .map(display_value)
                .unwrap_or_default();
            format!("{}  {}", field.label, current.bright_black())
        })
        .collect();
    let Some(choice) = prompt_select("Field", &labels)? else {
        return Ok(());
    };
    let field = &fields[choice];

    if let Some(parent) = field.depends_on.as_deref() {
        let parent_set = session
            .records
            .input_values()
            .get(parent)
            .is_some_and(|value| !display_value(value).is_empty());
        if !parent_set {
            return Err(AppError::validation(format!(
                "Choose a value for `{parent}` first."
            )));
        }
    }

    let current = session
        .records
        .input_values()
        .get(&field.key)
        .map(display_value);
    let value = match field.field_type {
        FieldType::DynamicDropdown => {
            let options = session.records.dropdown_options(&field.key).to_vec();
            let labels: Vec<String> = options.iter().map(|option| option.label.clone()).collect();
            match prompt_select(&field.label, &labels)? {
                Some(index) => Value::String(options[index].value.clone()),
                None if options.is_empty() => {
                    let raw = prompt_visible_input(&field.label, current.as_deref())?;
                    field_value(field.field_type, &raw)
                }
                None => return Ok(()),
            }
        }
        FieldType::KeyValue => {
            let labels: Vec<String> = field
                .key_options
                .iter()
                .map(|option| option.label.clone())
                .collect();
            let key = match prompt_select(&field.label, &labels)? {
                Some(index) => field.key_options[index].value.clone(),
                None if labels.is_empty() => prompt_visible_input(&field.label, current.as_deref())?,
                None => return Ok(()),
            };
            let value_label = field.value_field_label.as_deref().unwrap_or("Enter value");
            let entered = prompt_visible_input(value_label, None)?;
            session
                .records
                .set_input(KEY_VALUE_SLOT, Value::String(entered))
                .await?;
            Value::String(key)
        }
        FieldType::Text
        | FieldType::Number
        | FieldType::Textarea
        | FieldType::Checkbox
        | FieldType::Json
        | FieldType::Email
        | FieldType::Password
        | FieldType::Date
        | FieldType::Url
        | FieldType::Tel => {
            let raw = prompt_visible_input(&field.label, current.as_deref())?;
            field_value(field.field_type, &raw)
        }
    };

    session.records.set_input(&field.key, value).await
}

fn print_header(session: &Session) {
    let state = match session.auth.state() {
        AuthState::Authenticated => "authenticated".green(),
        AuthState::Authenticating => "waiting for provider redirect".yellow(),
        AuthState::Unauthenticated => "not authenticated".red(),
    };
    println!();
    println!("{} [{state}]", session.config.display_name().bold());
    if let Some(id) = session.records.editing_id() {
        println!("{}", format!("Editing record {id}").yellow());
    }
    if session.records.is_loading() {
        println!("{}", "Loading…".bright_black());
    }
    if let Some(error) = session.records.error() {
        println!("{}", error.red());
    }
}

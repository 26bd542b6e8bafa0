use crate::error::{AppError, AppResult};
use crate::features::records::{Confirmation, Notice, Notifier};
use colored::Colorize;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password, Select};
use std::io::{self, IsTerminal};

pub fn prompt_theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

pub fn is_interactive_terminal() -> bool {
    io::stdin().is_terminal() && io::stderr().is_terminal()
}

/// Writes transient notices to stderr so stdout stays machine-readable.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice, message: &str) {
        log::info!("notice: {message}");
        let line = match notice {
            Notice::Success => message.green(),
            Notice::Info => message.normal(),
            Notice::Warning => message.yellow(),
        };
        eprintln!("{line}");
    }
}

pub struct PromptConfirmation {
    /// Answer yes without asking (`--yes`).
    pub assume_yes: bool,
}

impl Confirmation for PromptConfirmation {
    fn confirm(&self, prompt: &str) -> AppResult<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        if !is_interactive_terminal() {
            return Err(AppError::validation(
                "Confirmation required. Re-run with --yes in non-interactive mode.",
            ));
        }

        Confirm::with_theme(&prompt_theme())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|err| AppError::generic(format!("Failed to read confirmation input: {err}")))
    }
}

pub fn prompt_visible_input(prompt: &str, default: Option<&str>) -> AppResult<String> {
    let theme = prompt_theme();
    let mut input = Input::<String>::with_theme(&theme)
        .with_prompt(prompt)
        .allow_empty(true);
    if let Some(value) = default {
        input = input.default(value.to_string());
    }

    input
        .interact_text()
        .map(|value| value.trim().to_string())
        .map_err(|err| AppError::validation(format!("Failed to read {prompt}: {err}")))
}

pub fn prompt_secret_input(prompt: &str) -> AppResult<String> {
    let theme = prompt_theme();
    Password::with_theme(&theme)
        .with_prompt(prompt)
        .allow_empty_password(false)
        .interact()
        .map_err(|err| AppError::validation(format!("Failed to read {prompt}: {err}")))
}

/// Returns the chosen index, or `None` when there is nothing to choose from.
pub fn prompt_select(prompt: &str, items: &[String]) -> AppResult<Option<usize>> {
    if items.is_empty() {
        return Ok(None);
    }

    Select::with_theme(&prompt_theme())
        .with_prompt(prompt)
        .items(items)
        .default(0)
        .interact_opt()
        .map_err(|err| AppError::validation(format!("Failed to read {prompt}: {err}")))
}

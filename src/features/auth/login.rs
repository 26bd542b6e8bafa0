use crate::config::ResponseType;
use crate::error::{AppError, AppResult};
use crate::features::auth::callback::{CALLBACK_TIMEOUT, CallbackServer};
use crate::features::auth::flow::{AuthFlowController, now_millis};
use std::process::Command;

#[derive(Debug, Default)]
pub struct LoginOptions {
    pub no_browser: bool,
    /// Return address pasted by the user instead of waiting on the loopback server.
    pub callback_url: Option<String>,
}

#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated,
    /// Sign-in continues with `login --callback-url` once the provider redirects.
    AwaitingCallback { authorization_url: String },
}

pub async fn run(auth: &AuthFlowController, options: LoginOptions) -> AppResult<LoginOutcome> {
    let config = auth.config();
    if !config.auth.is_redirect_oauth() {
        auth.authenticate()?;
        return Ok(LoginOutcome::Authenticated);
    }

    if let Some(return_url) = options.callback_url {
        auth.complete_redirect(&return_url, now_millis()).await?;
        return Ok(LoginOutcome::Authenticated);
    }

    let redirect_uri = config
        .auth
        .redirect_uri
        .clone()
        .ok_or_else(|| AppError::configuration("OAuth2 redirect flow requires redirectUri."))?;

    // Implicit grants put the token in the fragment, which never reaches a server.
    let listen = config.auth.response_type == ResponseType::Code;
    let callback_server = if listen {
        Some(CallbackServer::bind(&redirect_uri, CALLBACK_TIMEOUT)?)
    } else {
        None
    };

    let authorization_url = auth.begin_redirect()?;
    if options.no_browser {
        println!("Open this URL to continue login:\n{authorization_url}");
    } else if let Err(err) = open_browser(&authorization_url) {
        eprintln!(
            "Could not open browser automatically ({err}). Open this URL manually:\n{authorization_url}"
        );
    }

    let Some(callback_server) = callback_server else {
        return Ok(LoginOutcome::AwaitingCallback { authorization_url });
    };

    let return_url = tokio::task::spawn_blocking(move || callback_server.wait_for_return())
        .await
        .map_err(|err| AppError::auth(format!("Callback listener stopped: {err}")))??;

    auth.complete_redirect(&return_url, now_millis()).await?;
    Ok(LoginOutcome::Authenticated)
}

fn open_browser(url: &str) -> Result<(), String> {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else if cfg!(target_os = "windows") {
        ("cmd", vec!["/C", "start", "", url])
    } else if cfg!(target_os = "linux") {
        ("xdg-open", vec![url])
    } else {
        return Err("Unsupported platform for automatic browser launch.".to_string());
    };

    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|err| err.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{program} exited with status {status}"))
    }
}

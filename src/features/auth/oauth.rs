use crate::config::{AuthConfig, HttpMethod, ResponseType};
use crate::engine::http::{HttpRequest, HttpTransport};
use crate::error::{AppError, AppResult};
use crate::features::auth::vault::TokenGrant;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, RedirectUrl, Scope};
use serde_json::json;
use url::Url;

const CALLBACK_PATH: &str = "oauth/callback";
const REFRESH_PATH: &str = "oauth/refresh";

/// What the identity provider left in the return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectArtifact {
    Code {
        code: String,
        state: Option<String>,
    },
    AccessToken {
        access_token: String,
        token_type: Option<String>,
        expires_in: Option<i64>,
        state: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectReturn {
    pub artifact: Option<RedirectArtifact>,
    /// The return address with query and fragment stripped.
    pub cleaned_url: String,
}

/// Builds the provider authorization URL and the CSRF state it carries.
pub fn build_authorization_url(auth: &AuthConfig, client_id: &str) -> AppResult<(String, String)> {
    let auth_url = auth
        .auth_url
        .clone()
        .ok_or_else(|| AppError::configuration("OAuth2 redirect flow requires authUrl."))?;
    let redirect_uri = auth
        .redirect_uri
        .clone()
        .ok_or_else(|| AppError::configuration("OAuth2 redirect flow requires redirectUri."))?;

    let auth_url = AuthUrl::new(auth_url).map_err(|err| {
        AppError::configuration(format!("Invalid OAuth authorization URL: {err}"))
    })?;
    let redirect = RedirectUrl::new(redirect_uri)
        .map_err(|err| AppError::configuration(format!("Invalid redirectUri: {err}")))?;

    let client = BasicClient::new(ClientId::new(client_id.to_string()))
        .set_auth_uri(auth_url)
        .set_redirect_uri(redirect);

    let scopes = auth
        .scopes
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(|scope| Scope::new(scope.to_string()));

    let mut request = client
        .authorize_url(CsrfToken::new_random)
        .add_scopes(scopes)
        // Ask for a refresh token on every consent so background renewal works.
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .add_extra_param("include_granted_scopes", "true");
    if auth.response_type == ResponseType::Token {
        request = request.use_implicit_flow();
    }

    let (url, csrf_token) = request.url();
    Ok((url.to_string(), csrf_token.secret().to_string()))
}

pub fn parse_redirect_return(return_url: &str) -> AppResult<RedirectReturn> {
    let mut parsed = Url::parse(return_url)
        .map_err(|err| AppError::auth(format!("Invalid redirect address: {err}")))?;

    let query: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let fragment: Vec<(String, String)> = parsed
        .fragment()
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    let lookup = |pairs: &[(String, String)], name: &str| {
        pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };

    if let Some(error) = lookup(&query, "error").or_else(|| lookup(&fragment, "error")) {
        let description = lookup(&query, "error_description")
            .or_else(|| lookup(&fragment, "error_description"))
            .map(|text| format!(": {text}"))
            .unwrap_or_default();
        return Err(AppError::auth(format!(
            "Identity provider returned {error}{description}"
        )));
    }

    let artifact = if let Some(code) = lookup(&query, "code") {
        Some(RedirectArtifact::Code {
            code,
            state: lookup(&query, "state"),
        })
    } else {
        lookup(&fragment, "access_token").map(|access_token| RedirectArtifact::AccessToken {
            access_token,
            token_type: lookup(&fragment, "token_type"),
            expires_in: lookup(&fragment, "expires_in").and_then(|raw| raw.parse().ok()),
            state: lookup(&fragment, "state"),
        })
    };

    parsed.set_query(None);
    parsed.set_fragment(None);

    Ok(RedirectReturn {
        artifact,
        cleaned_url: parsed.to_string(),
    })
}

/// Trades an authorization code at the service backend's token endpoint.
pub async fn exchange_code(
    http: &dyn HttpTransport,
    base_url: &str,
    code: &str,
    redirect_uri: Option<&str>,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> AppResult<TokenGrant> {
    let request = HttpRequest::new(HttpMethod::Post, backend_url(base_url, CALLBACK_PATH)).json(
        json!({
            "code": code,
            "redirect_uri": redirect_uri,
            "client_id": client_id,
            "client_secret": client_secret,
        }),
    );
    request_grant(http, request, "OAuth token exchange failed").await
}

pub async fn refresh_access_token(
    http: &dyn HttpTransport,
    base_url: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> AppResult<TokenGrant> {
    let request = HttpRequest::new(HttpMethod::Post, backend_url(base_url, REFRESH_PATH)).json(
        json!({
            "refresh_token": refresh_token,
            "client_id": client_id,
            "client_secret": client_secret,
        }),
    );
    request_grant(http, request, "OAuth token refresh failed").await
}

async fn request_grant(
    http: &dyn HttpTransport,
    request: HttpRequest,
    context: &str,
) -> AppResult<TokenGrant> {
    let response = http
        .send(request)
        .await
        .and_then(|response| response.ensure_success())
        .map_err(|err| AppError::auth(format!("{context}: {}", err.message)))?;

    serde_json::from_value(response.body)
        .map_err(|err| AppError::auth(format!("{context}: unexpected token response: {err}")))
}

fn backend_url(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthFlow, AuthType};

    fn google_auth(response_type: ResponseType) -> AuthConfig {
        AuthConfig {
            auth_type: AuthType::OAuth2,
            flow: AuthFlow::Redirect,
            fields: Vec::new(),
            auth_url: Some("https://accounts.example.test/o/oauth2/auth".to_string()),
            redirect_uri: Some("http://127.0.0.1:45455/callback".to_string()),
            scopes: Some("sheets.read sheets.write".to_string()),
            response_type,
        }
    }

    #[test]
    fn authorization_url_carries_client_and_scopes() {
        let (url, state) = build_authorization_url(&google_auth(ResponseType::Code), "cid").unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        assert!(url.starts_with("https://accounts.example.test/o/oauth2/auth?"));
        assert_eq!(get("client_id"), Some("cid"));
        assert_eq!(get("redirect_uri"), Some("http://127.0.0.1:45455/callback"));
        assert_eq!(get("response_type"), Some("code"));
        assert_eq!(get("scope"), Some("sheets.read sheets.write"));
        assert_eq!(get("access_type"), Some("offline"));
        assert_eq!(get("prompt"), Some("consent"));
        assert_eq!(get("state"), Some(state.as_str()));
    }

    #[test]
    fn implicit_flow_requests_token() {
        let (url, _) = build_authorization_url(&google_auth(ResponseType::Token), "cid").unwrap();
        assert!(url.contains("response_type=token"));
    }

    #[test]
    fn code_return_is_parsed_and_cleaned() {
        let parsed =
            parse_redirect_return("http://127.0.0.1:45455/callback?code=4%2Fabc&state=s1").unwrap();
        assert_eq!(
            parsed.artifact,
            Some(RedirectArtifact::Code {
                code: "4/abc".to_string(),
                state: Some("s1".to_string())
            })
        );
        assert_eq!(parsed.cleaned_url, "http://127.0.0.1:45455/callback");
    }

    #[test]
    fn fragment_token_is_parsed() {
        let parsed = parse_redirect_return(
            "https://app.test/apiblock#access_token=tok&token_type=bearer&expires_in=3599",
        )
        .unwrap();
        assert_eq!(
            parsed.artifact,
            Some(RedirectArtifact::AccessToken {
                access_token: "tok".to_string(),
                token_type: Some("bearer".to_string()),
                expires_in: Some(3599),
                state: None,
            })
        );
        assert_eq!(parsed.cleaned_url, "https://app.test/apiblock");
    }

    #[test]
    fn provider_error_is_an_auth_error() {
        let err = parse_redirect_return("http://x.test/cb?error=access_denied").unwrap_err();
        assert_eq!(err.message, "Identity provider returned access_denied");
    }

    #[test]
    fn plain_address_has_no_artifact() {
        let parsed = parse_redirect_return("http://x.test/cb").unwrap();
        assert!(parsed.artifact.is_none());
    }
}

//! Login endpoints.
//!
//! Implements resource-owner authentication for the authorization flow:
//! - Login page (GET) with the flow parameters threaded through the form
//! - Login submission (POST): verifies credentials against the user store,
//!   establishes the signed session cookie and re-enters the authorize
//!   endpoint so consent resolution runs with a fresh session.

use crate::entity::client;
use crate::oauth2::session::session_cookie;
use crate::oauth2::state::OAuth2State;
use askama::Template;
use axum::{
    Form,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use sea_orm::EntityTrait;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Login page template.
#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    // OAuth2 flow parameters threaded through the form
    client_id: String,
    redirect_uri: String,
    scope: String,
    state: String,
    nonce: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    // Display information
    email: String,
    error: Option<String>,
    client_name: Option<String>,
}

/// Query parameters for the login page.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub login_hint: Option<String>,
    pub error: Option<String>,
}

/// Form data for login submission.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginForm {
    // OAuth2 flow parameters
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    // Credentials
    pub email: String,
    pub password: String,
}

/// Creates the login router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(login_page))
        .routes(routes!(login_submit))
}

/// Display the login page.
#[tracing::instrument(skip(state, params))]
#[utoipa::path(
    get,
    path = "/connect/login",
    tag = super::OAUTH2_TAG,
    operation_id = "Login Page",
    summary = "Display the login form",
    description = "Renders the login form for the authorization flow. Typically reached \
                   by redirect from `/connect/authorize` when no session exists.",
    params(
        ("client_id" = String, Query, description = "The client identifier."),
        ("redirect_uri" = String, Query, description = "Validated redirect URI of the flow."),
        ("scope" = Option<String>, Query, description = "Space-separated requested scopes."),
        ("state" = Option<String>, Query, description = "Opaque CSRF value."),
        ("nonce" = Option<String>, Query, description = "Replay protection value."),
        ("code_challenge" = Option<String>, Query, description = "PKCE code challenge."),
        ("code_challenge_method" = Option<String>, Query, description = "PKCE challenge method."),
        ("login_hint" = Option<String>, Query, description = "Email address to pre-fill."),
        ("error" = Option<String>, Query, description = "Error message to display."),
    ),
    responses(
        (status = 200, description = "Login page HTML"),
        (status = 500, description = "Internal server error"),
    )
)]
async fn login_page(State(state): State<OAuth2State>, Query(params): Query<LoginQuery>) -> Response {
    // Look up client for display name
    let client_name = match client::Entity::find_by_id(&params.client_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(c)) => Some(c.name),
        _ => None,
    };

    let template = LoginTemplate {
        client_id: params.client_id,
        redirect_uri: params.redirect_uri,
        scope: params.scope.unwrap_or_else(|| "openid".to_string()),
        state: params.state.unwrap_or_default(),
        nonce: params.nonce,
        code_challenge: params.code_challenge,
        code_challenge_method: params.code_challenge_method,
        email: params.login_hint.unwrap_or_default(),
        error: params.error,
        client_name,
    };

    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render login template: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Handle login form submission.
#[tracing::instrument(skip(state, form), fields(email = %form.email))]
#[utoipa::path(
    post,
    path = "/connect/login",
    tag = super::OAUTH2_TAG,
    operation_id = "Login Submit",
    summary = "Submit login credentials",
    description = "Authenticates the resource owner against the user store. On success, \
                   sets the session cookie and resumes the authorization request.",
    request_body(
        content = LoginForm,
        content_type = "application/x-www-form-urlencoded",
        description = "Credentials and flow parameters"
    ),
    responses(
        (status = 303, description = "Redirect back into the authorize endpoint, or to the login page with an error"),
    )
)]
async fn login_submit(State(state): State<OAuth2State>, Form(form): Form<LoginForm>) -> Response {
    let email = form.email.trim().to_lowercase();

    if email.is_empty() || !email.contains('@') {
        return redirect_to_login_with_error(&form, "Please enter a valid email address");
    }
    if form.password.is_empty() {
        return redirect_to_login_with_error(&form, "Please enter your password");
    }

    // The user store is an oracle: inactive accounts, missing passwords and
    // bad passwords are all the same generic failure to the browser.
    let user = match state.users.authenticate(&email, &form.password).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            return redirect_to_login_with_error(&form, "Invalid email or password");
        }
        Err(e) => {
            tracing::error!("Authentication lookup failed: {}", e);
            return redirect_to_login_with_error(&form, "An error occurred. Please try again.");
        }
    };

    if let Err(e) = state.users.record_login(&user.id).await {
        tracing::warn!("Failed to update last_login_at: {}", e);
    }

    tracing::info!(user_id = %user.id, client_id = %form.client_id, "User authenticated");

    // Resume the authorize request with a fresh session cookie.
    let cookie_value = state
        .sessions
        .mint_session(&user.id, time::Duration::seconds(state.config.session_ttl_secs));
    let cookie = session_cookie(
        &cookie_value,
        time::Duration::seconds(state.config.session_ttl_secs),
    );

    let mut url = format!(
        "/connect/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        urlencoding::encode(&form.client_id),
        urlencoding::encode(&form.redirect_uri),
        urlencoding::encode(&form.scope),
        urlencoding::encode(&form.state),
    );
    if let Some(ref nonce) = form.nonce {
        url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }
    if let Some(ref challenge) = form.code_challenge {
        url.push_str(&format!(
            "&code_challenge={}&code_challenge_method={}",
            urlencoding::encode(challenge),
            urlencoding::encode(form.code_challenge_method.as_deref().unwrap_or("plain"))
        ));
    }

    ([(header::SET_COOKIE, cookie)], Redirect::to(&url)).into_response()
}

/// Redirect back to the login page with an error message.
fn redirect_to_login_with_error(form: &LoginForm, error: &str) -> Response {
    let mut url = format!(
        "/connect/login?client_id={}&redirect_uri={}&scope={}&state={}&error={}",
        urlencoding::encode(&form.client_id),
        urlencoding::encode(&form.redirect_uri),
        urlencoding::encode(&form.scope),
        urlencoding::encode(&form.state),
        urlencoding::encode(error),
    );

    if !form.email.is_empty() {
        url.push_str(&format!("&login_hint={}", urlencoding::encode(&form.email)));
    }
    if let Some(ref challenge) = form.code_challenge {
        url.push_str(&format!(
            "&code_challenge={}",
            urlencoding::encode(challenge)
        ));
    }
    if let Some(ref method) = form.code_challenge_method {
        url.push_str(&format!(
            "&code_challenge_method={}",
            urlencoding::encode(method)
        ));
    }
    if let Some(ref nonce) = form.nonce {
        url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }

    Redirect::to(&url).into_response()
}

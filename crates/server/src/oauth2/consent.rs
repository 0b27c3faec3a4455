//! Consent endpoints.
//!
//! The consent screen shows the requesting client and the scopes it asked
//! for, and lets the resource owner approve once or approve-and-remember.
//! Remembered approvals become permanent authorizations whose scope set
//! only ever grows on re-consent; one-off approvals are recorded as ad-hoc
//! grants backing just this flow.
//!
//! All flow state travels in an HMAC-signed consent token; a forged or
//! expired token never reaches the database.

use crate::entity::{authorization, client, user};
use crate::oauth2::endpoints::{AuthorizeRequest, code_redirect, mint_auth_code};
use crate::oauth2::session::SessionKeys;
use crate::oauth2::state::OAuth2State;
use askama::Template;
use axum::{
    Form,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Scope information for display.
#[derive(Debug, Clone)]
pub struct ScopeInfo {
    pub name: String,
    pub description: String,
}

/// Get human-readable scope information.
fn get_scope_info(scope: &str) -> ScopeInfo {
    match scope {
        "openid" => ScopeInfo {
            name: "OpenID".to_string(),
            description: "Verify your identity".to_string(),
        },
        "email" => ScopeInfo {
            name: "Email".to_string(),
            description: "Access your email address".to_string(),
        },
        "profile" => ScopeInfo {
            name: "Profile".to_string(),
            description: "Access your profile information".to_string(),
        },
        _ => ScopeInfo {
            name: scope.to_string(),
            description: format!("Access to {}", scope),
        },
    }
}

/// Consent page template.
#[derive(Template)]
#[template(path = "consent.html")]
struct ConsentTemplate {
    user_email: String,
    client_name: String,
    scopes: Vec<ScopeInfo>,
    consent_token: String,
}

/// Flow state carried through the consent round-trip, HMAC-signed.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsentData {
    pub user_id: String,
    pub user_email: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub expires_at: i64,
}

impl ConsentData {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc().unix_timestamp() > self.expires_at
    }

    pub fn scopes_list(&self) -> Vec<String> {
        self.scope.split_whitespace().map(String::from).collect()
    }
}

/// URL of the consent page for a signed consent payload.
pub fn consent_redirect_url(keys: &SessionKeys, data: &ConsentData) -> String {
    format!("/connect/consent?token={}", keys.sign(data))
}

/// Query parameters for the consent page.
#[derive(Debug, Deserialize)]
pub struct ConsentQuery {
    pub token: String,
}

/// Form data for consent submission.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentForm {
    pub consent_token: String,
    /// "approve" or "deny"
    pub action: String,
    /// Present when the user chose to remember this approval
    pub remember: Option<String>,
}

/// Creates the consent router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(consent_page))
        .routes(routes!(consent_submit))
}

/// Display the consent page.
#[tracing::instrument(skip(state, params))]
#[utoipa::path(
    get,
    path = "/connect/consent",
    tag = super::OAUTH2_TAG,
    operation_id = "Consent Page",
    summary = "Display the consent screen",
    description = "Renders the screen where the resource owner approves or denies the \
                   client's request. The signed consent token carries the flow state and \
                   expires after 10 minutes.",
    params(
        ("token" = String, Query, description = "Signed consent token carrying the flow state."),
    ),
    responses(
        (status = 200, description = "Consent page HTML"),
        (status = 200, description = "Error page HTML if the token is invalid or expired"),
    )
)]
async fn consent_page(
    State(state): State<OAuth2State>,
    Query(params): Query<ConsentQuery>,
) -> Response {
    let consent_data: ConsentData = match state.sessions.verify(&params.token) {
        Some(data) => data,
        None => {
            return render_error("Invalid consent request. Please try signing in again.");
        }
    };

    if consent_data.is_expired() {
        return render_error("This consent request has expired. Please try signing in again.");
    }

    let client = match client::Entity::find_by_id(&consent_data.client_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(c)) => c,
        Ok(None) => {
            return render_error("Unknown application. Please try signing in again.");
        }
        Err(e) => {
            tracing::error!("Database error looking up client: {}", e);
            return render_error("An error occurred. Please try again.");
        }
    };

    let scopes: Vec<ScopeInfo> = consent_data
        .scope
        .split_whitespace()
        .map(get_scope_info)
        .collect();

    let template = ConsentTemplate {
        user_email: consent_data.user_email,
        client_name: client.name,
        scopes,
        consent_token: params.token,
    };

    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render consent template: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Handle consent form submission.
#[tracing::instrument(skip(state, form))]
#[utoipa::path(
    post,
    path = "/connect/consent",
    tag = super::OAUTH2_TAG,
    operation_id = "Consent Submit",
    summary = "Submit the consent decision",
    description = "On approval, records the grant (permanent when remembered), mints an \
                   authorization code and redirects back to the client. On denial, \
                   redirects with `access_denied`.",
    request_body(
        content = ConsentForm,
        content_type = "application/x-www-form-urlencoded",
        description = "Consent decision and signed token"
    ),
    responses(
        (status = 303, description = "Redirect to client with authorization code or error"),
        (status = 200, description = "Error page HTML if the token is invalid or expired"),
    )
)]
async fn consent_submit(State(state): State<OAuth2State>, Form(form): Form<ConsentForm>) -> Response {
    let consent_data: ConsentData = match state.sessions.verify(&form.consent_token) {
        Some(data) => data,
        None => {
            return render_error("Invalid consent request. Please try signing in again.");
        }
    };

    if consent_data.is_expired() {
        return render_error("This consent request has expired. Please try signing in again.");
    }

    if form.action == "deny" {
        let mut redirect_url = consent_data.redirect_uri.clone();
        redirect_url.push_str(if redirect_url.contains('?') { "&" } else { "?" });
        redirect_url
            .push_str("error=access_denied&error_description=User%20denied%20the%20request");
        if !consent_data.state.is_empty() {
            redirect_url.push_str(&format!(
                "&state={}",
                urlencoding::encode(&consent_data.state)
            ));
        }
        return Redirect::to(&redirect_url).into_response();
    }

    let client = match client::Entity::find_by_id(&consent_data.client_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(c)) if c.enabled => c,
        Ok(_) => return render_error("Unknown application. Please try signing in again."),
        Err(e) => {
            tracing::error!("Database error looking up client: {}", e);
            return render_error("An error occurred. Please try again.");
        }
    };

    let remember = form.remember.as_deref().is_some_and(|v| v == "on" || v == "true");
    let authorization_id = match record_grant(&state, &consent_data, remember).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("Failed to record consent grant: {}", e);
            return render_error("An error occurred. Please try again.");
        }
    };

    let authorize_params = AuthorizeRequest {
        response_type: "code".to_string(),
        client_id: consent_data.client_id.clone(),
        redirect_uri: Some(consent_data.redirect_uri.clone()),
        scope: Some(consent_data.scope.clone()),
        state: Some(consent_data.state.clone()),
        nonce: consent_data.nonce.clone(),
        code_challenge: consent_data.code_challenge.clone(),
        code_challenge_method: consent_data.code_challenge_method.clone(),
        prompt: None,
        login_hint: None,
    };
    let code = match mint_auth_code(
        &state,
        &client,
        &consent_data.user_id,
        Some(authorization_id),
        &consent_data.redirect_uri,
        &consent_data.scope,
        &authorize_params,
    )
    .await
    {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Failed to create authorization code: {}", e);
            return render_error("An error occurred. Please try again.");
        }
    };

    // Update last login time
    if let Ok(Some(found)) = user::Entity::find_by_id(&consent_data.user_id)
        .one(state.db.as_ref())
        .await
    {
        let mut active_user: user::ActiveModel = found.into();
        active_user.last_login_at = Set(Some(OffsetDateTime::now_utc()));
        if let Err(e) = active_user.update(state.db.as_ref()).await {
            tracing::warn!("Failed to update last_login_at: {}", e);
        }
    }

    tracing::info!(
        user_id = %consent_data.user_id,
        client_id = %consent_data.client_id,
        remembered = remember,
        "User granted consent"
    );

    let state_param = (!consent_data.state.is_empty()).then_some(consent_data.state.as_str());
    code_redirect(&consent_data.redirect_uri, &code, state_param)
}

/// Record the consent decision, returning the grant id backing this flow.
///
/// A remembered approval creates the (unique) permanent grant or expands
/// its scope set in place; a one-off approval writes an ad-hoc grant.
async fn record_grant(
    state: &OAuth2State,
    consent: &ConsentData,
    remember: bool,
) -> Result<String, sea_orm::DbErr> {
    let now = OffsetDateTime::now_utc();
    let scopes = consent.scopes_list();

    if remember {
        let existing = authorization::Entity::find()
            .filter(authorization::Column::UserId.eq(&consent.user_id))
            .filter(authorization::Column::ClientId.eq(&consent.client_id))
            .filter(authorization::Column::Kind.eq(authorization::KIND_PERMANENT))
            .filter(authorization::Column::Status.eq(authorization::STATUS_VALID))
            .one(state.db.as_ref())
            .await?;

        if let Some(grant) = existing {
            let merged = grant.merged_scope(&scopes);
            if merged != grant.scope {
                authorization::Entity::update_many()
                    .col_expr(authorization::Column::Scope, Expr::value(&merged))
                    .col_expr(authorization::Column::UpdatedAt, Expr::value(now))
                    .filter(authorization::Column::Id.eq(&grant.id))
                    .filter(authorization::Column::Status.eq(authorization::STATUS_VALID))
                    .exec(state.db.as_ref())
                    .await?;
            }
            return Ok(grant.id);
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let kind = if remember {
        authorization::KIND_PERMANENT
    } else {
        authorization::KIND_AD_HOC
    };
    let grant = authorization::ActiveModel {
        id: Set(id.clone()),
        user_id: Set(consent.user_id.clone()),
        client_id: Set(consent.client_id.clone()),
        kind: Set(kind.to_string()),
        scope: Set(consent.scope.clone()),
        status: Set(authorization::STATUS_VALID.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    };
    grant.insert(state.db.as_ref()).await?;
    Ok(id)
}

/// Render a simple error page.
fn render_error(message: &str) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Error - Sign in</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
</head>
<body>
    <main style="max-width: 32rem; margin: 4rem auto; font-family: sans-serif;">
        <h1>Something went wrong</h1>
        <p>{}</p>
        <p><a href="/">Return to homepage</a></p>
    </main>
</body>
</html>"#,
        message
    );
    Html(html).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys::new(b"0123456789abcdef0123456789abcdef")
    }

    fn sample_consent() -> ConsentData {
        ConsentData {
            user_id: "user-1".into(),
            user_email: "user@example.org".into(),
            client_id: "client-1".into(),
            redirect_uri: "https://app/cb".into(),
            scope: "openid profile".into(),
            state: "abc".into(),
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            expires_at: (OffsetDateTime::now_utc() + time::Duration::minutes(10))
                .unix_timestamp(),
        }
    }

    #[test]
    fn consent_token_roundtrip() {
        let data = sample_consent();
        let url = consent_redirect_url(&keys(), &data);
        let token = url.split("token=").nth(1).unwrap();
        let decoded: ConsentData = keys().verify(token).expect("verify");
        assert_eq!(decoded.user_id, "user-1");
        assert!(!decoded.is_expired());
    }

    #[test]
    fn forged_consent_token_rejected() {
        let data = sample_consent();
        let token = keys().sign(&data);
        let other = SessionKeys::new(b"another-secret-another-secret-32");
        assert!(other.verify::<ConsentData>(&token).is_none());
    }
}

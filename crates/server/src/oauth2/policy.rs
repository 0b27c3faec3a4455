//! Per-client security policy enforcement.
//!
//! Policy is an ordered list of pure rule evaluators. Each rule inspects
//! the incoming request against the registered client and returns the
//! first violation found; evaluation short-circuits. Every violation
//! carries a stable rule code for audit alongside the protocol error the
//! client sees.

use crate::entity::client;
use crate::error::ProtocolError;

pub const RULE_SPA_REQUIRE_PKCE: &str = "RULE_SPA_REQUIRE_PKCE";
pub const RULE_REDIRECT_EXACT_MATCH: &str = "RULE_REDIRECT_EXACT_MATCH";
pub const RULE_GRANT_NOT_ALLOWED: &str = "RULE_GRANT_NOT_ALLOWED";
pub const RULE_PASSWORD_RESTRICTED: &str = "RULE_PASSWORD_RESTRICTED";
pub const RULE_PASSWORD_SCOPE_RESTRICTED: &str = "RULE_PASSWORD_SCOPE_RESTRICTED";

/// Where in the protocol the check runs. Authorize-time validation does not
/// cover token-time grant switching, so the token endpoint re-validates
/// against the grant type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authorize,
    Token,
}

/// The slice of an incoming request that policy rules evaluate.
#[derive(Debug, Clone)]
pub struct PolicyRequest<'a> {
    pub stage: Stage,
    /// Grant type being exercised ("authorization_code" for the authorize
    /// endpoint's code response type)
    pub grant_type: &'a str,
    pub redirect_uri: Option<&'a str>,
    pub code_challenge: Option<&'a str>,
    pub requested_scopes: &'a [String],
}

/// A failed policy rule: the stable code for audit plus the protocol error
/// reported to the client.
#[derive(Debug, Clone)]
pub struct RuleViolation {
    pub rule: &'static str,
    pub error: ProtocolError,
}

type Rule = fn(&PolicyRequest<'_>, &client::Model) -> Option<RuleViolation>;

/// Evaluation order matters: the first failing rule wins.
const RULES: &[Rule] = &[
    rule_spa_require_pkce,
    rule_redirect_exact_match,
    rule_grant_not_allowed,
    rule_password_restricted,
    rule_password_scope_restricted,
];

/// Evaluate all rules in order, returning the first violation.
pub fn enforce(
    request: &PolicyRequest<'_>,
    client: &client::Model,
) -> Result<(), RuleViolation> {
    for rule in RULES {
        if let Some(violation) = rule(request, client) {
            return Err(violation);
        }
    }
    Ok(())
}

fn rule_spa_require_pkce(
    request: &PolicyRequest<'_>,
    client: &client::Model,
) -> Option<RuleViolation> {
    if request.stage == Stage::Authorize
        && client.require_pkce
        && request.code_challenge.is_none()
    {
        return Some(RuleViolation {
            rule: RULE_SPA_REQUIRE_PKCE,
            error: ProtocolError::InvalidRequest(
                "code_challenge is required for this client".to_string(),
            ),
        });
    }
    None
}

fn rule_redirect_exact_match(
    request: &PolicyRequest<'_>,
    client: &client::Model,
) -> Option<RuleViolation> {
    if request.stage != Stage::Authorize {
        return None;
    }
    if let Some(uri) = request.redirect_uri
        && !client.is_redirect_uri_allowed(uri)
    {
        return Some(RuleViolation {
            rule: RULE_REDIRECT_EXACT_MATCH,
            error: ProtocolError::InvalidRequest("redirect_uri is not registered".to_string()),
        });
    }
    None
}

fn rule_grant_not_allowed(
    request: &PolicyRequest<'_>,
    client: &client::Model,
) -> Option<RuleViolation> {
    if !client.is_grant_type_allowed(request.grant_type) {
        return Some(RuleViolation {
            rule: RULE_GRANT_NOT_ALLOWED,
            error: ProtocolError::UnauthorizedClient(format!(
                "grant type '{}' is not allowed for this client",
                request.grant_type
            )),
        });
    }
    None
}

fn rule_password_restricted(
    request: &PolicyRequest<'_>,
    client: &client::Model,
) -> Option<RuleViolation> {
    if request.grant_type != client::GRANT_PASSWORD {
        return None;
    }
    if client.is_public || !client.password_grant_enabled {
        return Some(RuleViolation {
            rule: RULE_PASSWORD_RESTRICTED,
            error: ProtocolError::UnauthorizedClient(
                "password grant is restricted to enabled integration clients".to_string(),
            ),
        });
    }
    None
}

fn rule_password_scope_restricted(
    request: &PolicyRequest<'_>,
    client: &client::Model,
) -> Option<RuleViolation> {
    if request.grant_type != client::GRANT_PASSWORD {
        return None;
    }
    let allowed = client.password_scopes_list();
    let offending = request
        .requested_scopes
        .iter()
        .find(|s| !allowed.contains(s));
    if let Some(scope) = offending {
        return Some(RuleViolation {
            rule: RULE_PASSWORD_SCOPE_RESTRICTED,
            error: ProtocolError::InvalidScope(format!(
                "scope '{}' is not allowed for the password grant",
                scope
            )),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn spa_client() -> client::Model {
        let now = OffsetDateTime::now_utc();
        client::Model {
            id: "spa-1".into(),
            secret: None,
            name: "SPA".into(),
            redirect_uris: r#"["https://app/cb"]"#.into(),
            grant_types: "authorization_code refresh_token".into(),
            scopes: "openid profile".into(),
            is_public: true,
            require_pkce: true,
            enabled: true,
            password_grant_enabled: false,
            password_scopes: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn integration_client() -> client::Model {
        let mut c = spa_client();
        c.id = "backend-1".into();
        c.secret = Some("s3cret".into());
        c.is_public = false;
        c.require_pkce = false;
        c.grant_types = "client_credentials password".into();
        c.password_grant_enabled = true;
        c.password_scopes = Some("api:read".into());
        c
    }

    fn authorize_request<'a>(
        code_challenge: Option<&'a str>,
        redirect_uri: Option<&'a str>,
        scopes: &'a [String],
    ) -> PolicyRequest<'a> {
        PolicyRequest {
            stage: Stage::Authorize,
            grant_type: client::GRANT_AUTHORIZATION_CODE,
            redirect_uri,
            code_challenge,
            requested_scopes: scopes,
        }
    }

    #[test]
    fn missing_pkce_fails_first() {
        let scopes = vec!["openid".to_string()];
        // The redirect is also bad, but the PKCE rule runs first.
        let req = authorize_request(None, Some("https://evil/cb"), &scopes);
        let violation = enforce(&req, &spa_client()).unwrap_err();
        assert_eq!(violation.rule, RULE_SPA_REQUIRE_PKCE);
        assert_eq!(violation.error.code(), "invalid_request");
    }

    #[test]
    fn redirect_must_match_bit_for_bit() {
        let scopes = vec!["openid".to_string()];
        let req = authorize_request(Some("challenge"), Some("https://app/cb/"), &scopes);
        let violation = enforce(&req, &spa_client()).unwrap_err();
        assert_eq!(violation.rule, RULE_REDIRECT_EXACT_MATCH);

        let ok = authorize_request(Some("challenge"), Some("https://app/cb"), &scopes);
        assert!(enforce(&ok, &spa_client()).is_ok());
    }

    #[test]
    fn grant_outside_allow_list_rejected() {
        let scopes = vec![];
        let req = PolicyRequest {
            stage: Stage::Token,
            grant_type: client::GRANT_CLIENT_CREDENTIALS,
            redirect_uri: None,
            code_challenge: None,
            requested_scopes: &scopes,
        };
        let violation = enforce(&req, &spa_client()).unwrap_err();
        assert_eq!(violation.rule, RULE_GRANT_NOT_ALLOWED);
        assert_eq!(violation.error.code(), "unauthorized_client");
    }

    #[test]
    fn password_grant_needs_integration_client() {
        let scopes = vec!["api:read".to_string()];
        let req = PolicyRequest {
            stage: Stage::Token,
            grant_type: client::GRANT_PASSWORD,
            redirect_uri: None,
            code_challenge: None,
            requested_scopes: &scopes,
        };

        let mut spa = spa_client();
        spa.grant_types = "password".into();
        let violation = enforce(&req, &spa).unwrap_err();
        assert_eq!(violation.rule, RULE_PASSWORD_RESTRICTED);

        assert!(enforce(&req, &integration_client()).is_ok());
    }

    #[test]
    fn password_scopes_outside_allow_list_rejected() {
        let scopes = vec!["api:read".to_string(), "api:write".to_string()];
        let req = PolicyRequest {
            stage: Stage::Token,
            grant_type: client::GRANT_PASSWORD,
            redirect_uri: None,
            code_challenge: None,
            requested_scopes: &scopes,
        };
        let violation = enforce(&req, &integration_client()).unwrap_err();
        assert_eq!(violation.rule, RULE_PASSWORD_SCOPE_RESTRICTED);
        assert_eq!(violation.error.code(), "invalid_scope");
    }

    #[test]
    fn token_stage_skips_authorize_only_rules() {
        let scopes = vec![];
        let req = PolicyRequest {
            stage: Stage::Token,
            grant_type: client::GRANT_AUTHORIZATION_CODE,
            redirect_uri: None,
            code_challenge: None,
            requested_scopes: &scopes,
        };
        assert!(enforce(&req, &spa_client()).is_ok());
    }
}

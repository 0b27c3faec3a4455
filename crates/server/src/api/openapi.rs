//! OpenAPI/Utoipa configuration.

use crate::api::{admin::ADMIN_TAG, health::MISC_TAG};
use crate::oauth2::OAUTH2_TAG;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, OAuth2, Scopes, SecurityScheme},
};

/// Security addon for OpenAPI documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    #[tracing::instrument(skip(self, openapi))]
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            // Bearer access token (userinfo) / admin token (admin API)
            let bearer = HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .description(Some(
                    "Access token from the `/connect/token` endpoint, or the admin token \
                     for `/api/admin/*` endpoints.",
                ))
                .build();
            components.add_security_scheme("bearer_auth", SecurityScheme::Http(bearer));

            // OAuth2 Authorization Code flow
            let oauth2 = OAuth2::new([utoipa::openapi::security::Flow::AuthorizationCode(
                utoipa::openapi::security::AuthorizationCode::new(
                    "/connect/authorize",
                    "/connect/token",
                    Scopes::from_iter([
                        ("openid", "OpenID Connect scope"),
                        ("email", "Access to user email"),
                        ("profile", "Access to user profile"),
                    ]),
                ),
            )]);
            components.add_security_scheme("OAuth2", SecurityScheme::OAuth2(oauth2));
        }
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "OIDC Provider API",
        version = "1.0.0",
        description = "OAuth2/OpenID-Connect authorization server: authorization, token \
                       issuance, key management and revocation."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = OAUTH2_TAG, description = "OAuth2/OIDC protocol endpoints"),
        (name = ADMIN_TAG, description = "Administration endpoints")
    )
)]
pub struct ApiDoc;

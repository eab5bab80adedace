use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

#[derive(OpenApi)]
/// Aggregated OpenAPI document of the progress server.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::progress::load_progress,
        crate::routes::progress::save_progress,
        crate::routes::progress::progress_history,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::health::HealthStatus,
            crate::dto::progress::Snapshot,
            crate::dto::progress::SaveProgressRequest,
            crate::services::active_tasks::ActiveTaskRecord,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "progress", description = "Activity progress snapshots"),
    )
)]
/// OpenAPI document of the progress server.
pub struct ApiDoc;

/// Registers the `bearer` security scheme referenced by the progress routes.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

// Control plane: HTTP boundary + process wiring
//
// Routes:
// - POST /messages                               user -> main thread
// - GET  /inbox, POST /inbox/{id}/respond        inbox reads and decisions
// - GET  /tasks, GET /tasks/{id}                 task reads
// - POST /tasks/{id}/plan-response               validated decision relays
// - POST /tasks/{id}/question-response
// - POST /tasks/{id}/start-implementation
// - POST /tasks/{id}/cancel                      workflow-first cancellation
// - POST /internal/tasks/{id}/complete           executor-job callback
// - GET  /events/{user_id}, /tasks/{id}/logs     SSE streams

pub mod api;
pub mod engine;
pub mod events;
pub mod state;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use engine::Engine;
pub use state::AppState;

/// Assemble the full application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::routes(state.clone()))
        .merge(events::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// OpenAPI documentation for the JSON routes
#[derive(OpenApi)]
#[openapi(paths(
    api::health,
    api::post_message,
    api::list_inbox,
    api::respond_inbox_item,
    api::list_tasks,
    api::get_task,
    api::plan_response,
    api::question_response,
    api::start_implementation,
    api::cancel_task,
    api::job_complete,
))]
pub struct ApiDoc;

use utoipa::OpenApi;

use crate::handlers::stream;
use crate::routes::{health, messages, projects, threads, usage};

#[derive(OpenApi)]
#[openapi(
    info(title = "Palaver API", description = "Streaming chat threads over HTTP"),
    paths(
        health::health_check,
        threads::create_thread,
        threads::list_threads,
        threads::get_thread,
        threads::update_thread,
        threads::delete_thread,
        messages::list_messages,
        stream::send_message_stream,
        stream::resend_message_stream,
        stream::edit_message_stream,
        stream::stop_stream,
        projects::create_project,
        projects::list_projects,
        usage::get_usage,
    ),
    components(schemas(
        health::HealthResponse,
        threads::CreateThreadRequest,
        threads::ThreadResponse,
        threads::ListThreadsResponse,
        threads::UpdateThreadRequest,
        messages::ListMessagesResponse,
        stream::SendMessageRequest,
        stream::ResendRequest,
        stream::EditRequest,
        projects::CreateProjectRequest,
        projects::ProjectResponse,
        usage::UsageResponse,
    )),
    tags(
        (name = "health"),
        (name = "threads"),
        (name = "messages", description = "Transcript and streaming turns"),
        (name = "projects"),
        (name = "usage", description = "Guest daily quota"),
    )
)]
pub struct ApiDoc;

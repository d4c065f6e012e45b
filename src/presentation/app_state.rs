// Application state for HTTP handlers
use crate::application::pipeline::PipelineService;
use crate::application::session_service::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineService,
    pub sessions: SessionService,
}

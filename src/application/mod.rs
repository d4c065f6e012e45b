// Application layer - Use cases and the live telemetry engine
pub mod analyzer;
pub mod config_generator;
pub mod live_engine;
pub mod pipeline;
pub mod report_service;
pub mod session_service;
pub mod validator;

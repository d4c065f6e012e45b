// Domain layer - Pure data types with no I/O
pub mod dashboard;
pub mod device;
pub mod document;
pub mod error;
pub mod history;
pub mod spring;
pub mod telemetry;

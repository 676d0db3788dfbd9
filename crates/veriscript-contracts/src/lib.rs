pub mod events;
pub mod projector;
pub mod report;
pub mod schema;

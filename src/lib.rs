pub mod api;
pub mod core;
pub mod history;
pub mod report;

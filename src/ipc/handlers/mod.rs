pub mod analytics;
pub mod classes;
pub mod core;
pub mod grading;
pub mod matrix;
pub mod scenarios;
pub mod setup;
pub mod test_setup;

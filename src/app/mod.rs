pub mod commands;
pub mod model;
pub mod queue;
pub mod runner;
pub mod task_store;
pub mod worker;

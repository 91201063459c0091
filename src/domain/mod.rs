pub mod models;
pub mod timer_engine;

pub mod bootstrap;
pub mod history;
pub mod lifecycle;
pub mod repository;
pub mod tags;

mod plan_repository;

pub use plan_repository::*;

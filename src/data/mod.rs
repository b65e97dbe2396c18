pub mod aov;
pub mod bigquery;
pub mod models;
pub mod repository;

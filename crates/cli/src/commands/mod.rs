pub mod health;
pub mod workloads;

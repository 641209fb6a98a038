pub mod catalog;
pub mod checker;
pub mod gateway;
pub mod jobs;
pub mod remediation;
pub mod scheduler;
pub mod stock;

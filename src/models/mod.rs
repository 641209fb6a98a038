pub mod job;
pub mod outcome;
pub mod product;

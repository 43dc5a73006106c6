pub mod drain;
pub mod purge;

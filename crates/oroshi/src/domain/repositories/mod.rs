pub mod offline;
pub mod queue;

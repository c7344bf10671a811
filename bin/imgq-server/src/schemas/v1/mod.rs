pub mod bookmark;
pub mod control;
pub mod generate;
pub mod queue;

pub mod clock;
pub mod command;
pub mod log;
pub mod term;
pub mod which;
pub mod wizard;

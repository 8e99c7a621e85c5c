pub mod error;
pub mod exec;
pub mod request;
pub mod state;
pub mod status;
pub mod submission;
pub mod tool;

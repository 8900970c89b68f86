pub mod cli;
pub mod config;
pub mod env_file;
pub mod error;
pub mod launcher;
pub mod matcher;
pub mod model;
pub mod port;
pub mod probe;
pub mod retry;
pub mod supervisor;
pub mod sys;
pub mod terminator;

pub mod config;
pub mod converge;
pub mod detect;
pub mod engine;
pub mod epic;
pub mod errors;
pub mod events;
pub mod host;
pub mod integrate;
pub mod phase;
pub mod prompts;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod status;
pub mod stream;
pub mod ui;
pub mod vcs;
pub mod worker;

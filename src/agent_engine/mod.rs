pub mod engine;
pub mod event_bus;
pub mod history;
pub mod loop_control;
pub mod parser;
pub mod prompts;
pub mod session;
pub mod state;
pub mod supervisor;

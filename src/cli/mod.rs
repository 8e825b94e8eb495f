pub mod agent_cmd;
pub mod config_cmd;
pub mod credits_cmd;
pub mod output;
pub mod renderer;
pub mod session;

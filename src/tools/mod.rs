pub mod command_router;
pub mod filesystem_tool;
pub mod process_tool;
pub mod session;
pub mod terminal_tool;

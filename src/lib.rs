pub mod config;
pub mod error;
pub mod tools;
pub mod utils;

pub use crate::config::Config;
pub use crate::error::AppError;
pub use crate::tools::session::{SessionHandle, SessionSummary};
pub use crate::tools::terminal_tool::TerminalManager;
pub use crate::utils::output_broker::TerminalEvent;

pub mod audit_logger;
pub mod history_ledger;
pub mod output_broker;
pub mod path_utils;
pub mod teardown;

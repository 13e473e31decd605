pub mod agent;
pub mod config_record;
pub mod multiplex_config;
pub mod operation_log;

pub use agent::Entity as Agent;
pub use config_record::Entity as ConfigRecord;
pub use multiplex_config::Entity as MultiplexConfig;
pub use operation_log::Entity as OperationLog;

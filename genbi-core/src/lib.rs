pub mod cancel;
pub mod config;
pub mod events;
pub mod generator;
pub mod kernel;
pub mod repair;
pub mod table;

pub use cancel::CancelToken;
pub use config::{ConfigError, Settings};
pub use events::{AskEvent, Progress};
pub use generator::{clean_sql, GenerateError, GeneratorConfig, SqlGenerator};
pub use kernel::{AskRequest, AskResponse, AskStream, GenbiKernel, KernelError};
pub use repair::{
    ExecutorProvider, FixRequest, QueryExecutor, RepairLoop, RepairOutcome, RepairRequest, RepairStatus,
    SqlRepairer, StaticExecutors,
};
pub use table::format_table;

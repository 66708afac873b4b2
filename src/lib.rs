//! Declarative HTTP/SQL test-step execution engine.
//!
//! Cases are ordered steps over frozen interface definitions. Each step
//! renders `$var` and `${fn(...)}` templates, runs its hooks, performs an
//! HTTP request or SQL statement, extracts variables and checks assertions,
//! retrying on assertion failure. [`sync`] keeps frozen step copies in line
//! with their live interfaces.

pub mod config;
pub mod error;
pub mod extract;
pub mod functions;
pub mod hooks;
pub mod http;
pub mod model;
pub mod runlog;
pub mod runner;
pub mod sql;
pub mod step;
pub mod sync;
pub mod validator;
pub mod variables;

pub use config::{load_environment, load_function_records, CaseLoader, EngineConfig};
pub use error::{EngineError, Result};
pub use functions::{load_functions, Callable, FunctionProvider, FunctionRegistry};
pub use model::*;
pub use runner::{CaseRunner, DefaultCaseRunner, StepContext};
pub use sql::{DefaultSqlConnector, SqlConnector, SqlMethod};
pub use step::StepSpec;
pub use sync::{StepRepository, SyncReconciler};
pub use variables::{Resolver, Strictness, VariablePool};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

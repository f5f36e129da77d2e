//! Persistence layer — libSQL-backed storage for published orders, rate
//! windows, the action log, keyword rules and runtime config.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ActionStats, ActionStatus, ActionType, OrderStatus, OrderStore, PublishedOrderRecord,
    WindowCheck, with_timeout,
};

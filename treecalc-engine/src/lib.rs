//! # treecalc engine
//!
//! Dependency-tracking calculation over a tree of named items. Items carry
//! calculation rules written in the expression language of
//! [`treecalc_expr`]; the engine compiles each rule into a canonical key,
//! shares one [`DataController`] per distinct key and computes values on
//! demand.
//!
//! ## Pipeline
//!
//! ```text
//! rule text -> parse -> substitute (canonical key, suppliers)
//!           -> DataController: make_result (operator, typed result)
//!                              calc_data (values, suspendible)
//! ```
//!
//! ## Key Features
//!
//! - **Canonical keys**: rules computing the same thing share a controller
//! - **Supplier tracking**: edits invalidate exactly what depends on them
//! - **Templates and meta functions**: `loop` and `iterate` unroll into items
//! - **Cooperative suspension**: long walks yield and resume from cached state
//! - **Content cache**: payloads can be shared across sessions
//!
//! # Example
//!
//! ```
//! use treecalc_engine::prelude::*;
//!
//! let mut session = Session::new();
//! let root = session.config_root();
//! let a = session.create_item(root, "a", NodeKind::Data(DataMeta::default())).unwrap();
//! session.set_expr(a, "1 + 2").unwrap();
//! assert_eq!(session.value("/a").unwrap(), Value::UInt32(3));
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cache;
pub mod calc;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod gc;
pub mod interest;
pub mod invalidation;
pub mod metrics;
pub mod oper;
pub mod props;
pub mod queue;
pub mod session;
pub mod storage;
pub mod suspend;
pub mod tree;

pub use cache::{CacheError, CacheKey, CacheStats, CalcCache};
pub use calc::{Compiled, MetaInfo, Substitution, SupplierSet};
pub use config::{Config, ConfigError, EngineConfig, ItemConfig, ItemKind};
pub use controller::{CalcOutcome, DataController, DcId, DcState, FutureData, VisitState};
pub use data::{Column, Value};
pub use error::{CalcError, FailRecord, Flow, Interrupt, Result};
pub use gc::GcStats;
pub use interest::{InterestCount, InterestGuard};
pub use metrics::{CalcMetrics, MetricsSnapshot};
pub use oper::{CostEstimate, OperGroup, OperRegistry, Operator};
pub use props::{get_prop, PropError};
pub use queue::{Commit, MetaQueue};
pub use session::Session;
pub use storage::{MemoryStorage, StorageError, StorageManager};
pub use suspend::{Blocker, Checkpoint, NoSuspend, SuspendTrigger};
pub use tree::{DataMeta, NodeId, NodeKind, Tree, UnitInfo};
pub use treecalc_expr::{parse_expr, Expr, Symbol};
pub use treecalc_types::{FailPhase, Timestamp, ValueType};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::controller::{CalcOutcome, DcId, DcState};
    pub use crate::data::{Column, Value};
    pub use crate::error::CalcError;
    pub use crate::session::Session;
    pub use crate::tree::{DataMeta, NodeId, NodeKind, UnitInfo};
    pub use treecalc_expr::Expr;
    pub use treecalc_types::ValueType;
}

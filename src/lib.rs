//! # Cubist
//!
//! An in-memory multidimensional OLAP engine: sparse cubes addressed by
//! tuples of dimension-element identifiers, hierarchical dimensions with
//! weighted consolidation, cell formulas ("rules"), point and area queries
//! with aggregation and splashing, and crash-safe journaled persistence.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Area request
//!     ↓
//! [Plan construction]     → Source / Transformation / Rearrange /
//!     ↓                     Aggregation / Rule nodes
//! [Processors]            → ordered (key, value) streams
//!     ↓
//! [Cache]                 → fingerprint-keyed materialized areas
//!     ↓
//! Rows
//!
//! Cell write
//!     ↓
//! [Splash policy]         → base-cell edits
//!     ↓
//! [Lock undo capture]     → rollback journal (memory + spill file)
//!     ↓
//! [Storage snapshot swap] → readers keep their consistent view
//!     ↓
//! [Journal append]        → rotating change log, replayed on load
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cubist::{Config, Engine};
//! use cubist::dimension::ElementKind;
//! use cubist::splash::SplashMode;
//! use cubist::cell::CellValue;
//!
//! let engine = Engine::new(Config::load()?)?;
//!
//! let time = engine.create_dimension("time")?;
//! let jan = engine.add_element(time, "Jan", ElementKind::Numeric)?;
//! let feb = engine.add_element(time, "Feb", ElementKind::Numeric)?;
//! let q1 = engine.add_element(time, "Q1", ElementKind::Numeric)?;
//! engine.add_children(time, q1, &[(jan, 1.0), (feb, 1.0)])?;
//!
//! let sales = engine.create_cube("sales", &[time])?;
//! engine.cell_replace(sales, &[jan], CellValue::Numeric(10.0),
//!                     SplashMode::Equal, cubist::engine::SYSTEM_SESSION)?;
//!
//! let q1_total = engine.cell_value(sales, &[q1])?;
//! engine.save()?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ident` | packed ids, cell paths, lexicographic order |
//! | `area` | sorted id sets, per-dimension area selectors |
//! | `cell` | cell values with per-cell error markers |
//! | `stream` | ordered pull streams (`next`/`move_to`/`reset`) |
//! | `pool` | priority worker pool with thread groups |
//! | `dimension` | element table, consolidation DAG, base expansion |
//! | `cube` | cube metadata and the sparse numeric/string stores |
//! | `plan` | query plan nodes and processors |
//! | `splash` | policies for writes to consolidated coordinates |
//! | `rule` | rule parser, AST, per-cell evaluation |
//! | `cache` | fingerprint-keyed cache of consolidated areas |
//! | `lock` | area locks with bounded rollback journals |
//! | `persist` | sectioned CSV snapshots and the rotating journal |
//! | `session` | session registry feeding the lock sweep |
//! | `engine` | orchestration and the operation surface |

pub mod area;
pub mod cache;
pub mod cell;
pub mod config;
pub mod cube;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod ident;
pub mod lock;
pub mod persist;
pub mod plan;
pub mod pool;
pub mod rule;
pub mod session;
pub mod splash;
pub mod stream;
pub mod telemetry;

// Re-export the types most callers need
pub use crate::area::{Area, AreaSelector, DimSelector, Set};
pub use crate::cell::CellValue;
pub use crate::config::Config;
pub use crate::engine::{CellResult, Engine, SYSTEM_SESSION};
pub use crate::error::{EngineError, Result};
pub use crate::ident::{CubeId, DimensionId, IdentifierType, Key, LockId, RuleId, SessionId, NO_ID};
pub use crate::splash::SplashMode;

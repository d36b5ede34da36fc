// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # Stratus Migration Engine
//!
//! `stratus-migrate` is a CLI tool and library for moving an existing
//! backend project into Stratus: users with their password hashes, OAuth
//! identities, application data, row-level security policies and stored
//! files.
//!
//! ## Supported Sources
//!
//! | Source | Reads | Notes |
//! |--------|-------|-------|
//! | Supabase | Live Postgres (direct connection) | One transaction for all database writes |
//! | Firebase | `auth:export`, Firestore and RTDB JSON exports | Scrypt hashes kept for progressive re-hash |
//! | PocketBase | `pb_data/data.db` and `pb_data/storage` | Bcrypt hashes kept verbatim |
//!
//! Every source goes through the same lifecycle: `analyze` (read-only),
//! an optional confirmation, `migrate`, then `close`. A
//! [`ValidationSummary`] compares what was found with what was written.
//!
//! ## Quick Start
//!
//! ```bash
//! # Preview a Supabase project
//! stratus-migrate supabase --source postgres://postgres:pw@db.abc.supabase.co:5432/postgres --dry-run
//!
//! # Let the source type be detected
//! stratus-migrate from ./pb_data --target postgres://localhost/stratus
//!
//! # From a configuration file
//! stratus-migrate run --config migration.yaml
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: firebase
//!   auth_export: ./export/users.json
//!   firestore_export: ./export/firestore
//!
//! target:
//!   database_url: postgres://postgres:pw@localhost:5432/stratus
//!   storage_path: ./storage
//!
//! options:
//!   batch_size: 1000
//!   skip:
//!     storage: true
//! ```

#![warn(missing_docs)]

pub mod adapters;
pub mod config;
pub mod detect;
pub mod error;
pub mod json_stream;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod retry;
pub mod storage;
pub mod target;
pub mod ui;

pub use adapters::{create_adapter, create_adapter_for_locator, SourceAdapter};
pub use config::{MigrationConfig, MigrationOptions, SkipFlags, SourceConfig};
pub use detect::{detect_source, RelationalFlavor, SourceKind};
pub use error::{Error, Result};
pub use pipeline::{Console, Outcome, Pipeline, RunMode};
pub use report::{AnalysisReport, MigrationStats, ValidationSummary};

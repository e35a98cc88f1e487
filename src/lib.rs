//! voicebot - voice session pipeline
//!
//! Voice messages arrive grouped into sessions. Each message is transcribed,
//! then categorized; when every message of a session is processed the
//! session is finalized and handed to task creation.
//!
//! # Architecture
//!
//! Queue workers are fire-and-forget, so the store is the source of truth:
//! - Every job handler records its outcome (or a classified failure) on the
//!   record it worked on
//! - A periodic reconciliation pass re-derives what still needs doing from
//!   the stored flags and enqueues it again with stable dedup keys
//! - All queries are scoped to the current runtime so dev and prod can share
//!   one store
//!
//! # Modules
//!
//! - `store`: Document store, filters, runtime scope
//! - `queue`: Named job queues with dedup keys
//! - `transcription`: TRANSCRIBE handler and failure classification
//! - `categorization`: CATEGORIZE handler and session rollup
//! - `reconcile`: Reconciliation sweeps and the single-flight scheduler
//! - `finalize`: Session done flow and idle detection
//! - `maintenance`: Repair routines (close-idle, dedupe, backfill)
//! - `watchdog`: Dependency health check and restart
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run scheduler and workers
//! voicebot serve
//!
//! # One reconciliation pass, JSON output
//! voicebot reconcile --limit 5 --json
//!
//! # Close sessions idle for 6 hours
//! voicebot maintenance close-idle --hours 6 --apply
//! ```

pub mod adapters;
pub mod app;
pub mod categorization;
pub mod cli;
pub mod config;
pub mod domain;
pub mod finalize;
pub mod maintenance;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod transcription;
pub mod watchdog;
pub mod worker;

// Re-export main types at crate root for convenience
pub use app::App;
pub use domain::{Message, Session, SessionLogEvent};
pub use finalize::{complete_session_done_flow, DoneOutcome, DoneParams, DoneSource};
pub use queue::{JobQueue, JsonlJobQueue};
pub use reconcile::{PassOptions, PassResult, Reconciler, Scheduler};
pub use store::{Repo, RuntimeScope, SqliteStore};
pub use transcription::{TranscribeOutcome, TranscriptionWorker};

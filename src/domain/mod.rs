//! Domain types for the voice pipeline.
//!
//! This module contains the persisted records and job payloads:
//! - Session: a group of voice messages and its post-processing state
//! - Message: one audio message with transcription/categorization state
//! - ProcessorState: soft-lock sub-state of a post-processing step
//! - Jobs: job kinds, queue names, payloads and dedup keys

pub mod jobs;
pub mod message;
pub mod processor;
pub mod session;

// Re-export commonly used types
pub use jobs::{
    CategorizePayload, CreateTasksPayload, JobKind, QueueName, SessionEventPayload, SocketEvent,
    TranscribePayload,
};
pub use message::{ErrorContext, Message, TranscriptSegment};
pub use processor::{ProcessorState, CATEGORIZATION, CREATE_TASKS};
pub use session::{Session, SessionLogEvent, ERROR_SOURCE_TRANSCRIPTION};

//! # Taskmesh Queue
//!
//! Typed queue manager for the taskmesh orchestration core.
//!
//! A fixed set of named queues is each bound to one payload schema
//! (`agent_task`, `agent_response`, `dead_letter`). Enqueuing a message that
//! does not match its queue's schema fails before the broker is touched. Every
//! enqueued message gets a status record that workers and operators can query
//! and update independently of the queue's consumer.

pub mod manager;
pub mod record;
pub mod registration;

pub use manager::{DEFAULT_JOB_TIMEOUT, QueueManager};
pub use record::{Job, JobOutcome, JobRef, MessageRecord, QueueStats};
pub use registration::QueueRegistry;

//! The delivery dispatch pipeline.
//!
//! Updates enter through two paths: the shared webhook endpoint in
//! [`ingress`] (push) and per-bot poll loops in [`poller`] (pull). Both
//! feed the [`router`], which serializes per conversation slot and hands
//! work to the [`worker`] executor chain. The [`registry`] owns bot
//! identities and delivery-mode transitions, [`scheduler`] supervises the
//! poll loops, and [`health`] folds delivery outcomes into rolling
//! per-bot windows that can demote a flaky webhook back to polling.

pub mod error;
pub mod handler;
pub mod health;
pub mod ingress;
pub mod jobs;
pub mod poller;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod worker;

pub use error::{ApiError, DispatchError};
pub use handler::{HandlerContext, HandlerVerdict, UpdateHandler, default_chain};
pub use health::{DeliveryEvent, HealthAggregator, HealthRecorder};
pub use jobs::CleanupReport;
pub use registry::{DeliveryRegistry, ModeTransition, ResumeMode};
pub use router::UpdateRouter;
pub use scheduler::{PollControl, PollScheduler};
pub use server::IngressServer;
pub use worker::{ChainExecutor, ExecAck, UpdateExecutor};

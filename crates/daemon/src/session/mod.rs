//! Engine session management.
//!
//! This module spawns engine subprocesses, frames their output into lines,
//! correlates lines with waiting callers, and keeps the registry of live
//! sessions that commands are dispatched through.

pub mod dispatcher;
pub mod engine;
pub mod lines;
pub mod process;
pub mod registry;
pub mod replies;

pub use dispatcher::{CommandDispatcher, CommandReply};
pub use engine::{Session, SessionError, SessionId, SessionOptions, SessionStatus};
pub use lines::EngineLineCodec;
pub use process::{EngineCommand, ProcessError, ProcessEvent, ProcessExit, ProcessHandle};
pub use registry::{RemoveOutcome, SessionRegistry};
pub use replies::{EngineReply, ReplyQueue, Ticket};

//! # EngineHub Daemon Library
//!
//! Runs line-protocol chess engines (UCI-style, e.g. Pikafish) as managed
//! subprocesses and exposes them over a small HTTP/JSON API.
//!
//! ## Overview
//!
//! - **Engine Sessions**: Spawn engines, frame their output into lines, and
//!   answer each command with the next line the engine prints
//! - **Session Registry**: Track live sessions by id and drop them when their
//!   engine exits
//! - **Recognition Proxy**: Forward board photos to a remote recognition
//!   service
//! - **HTTP API**: axum routes over one shared service
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          HTTP API (axum)                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌───────────────────────────────┐  ┌───────────────────────┐   │
//! │  │       Command Dispatcher      │  │   Recognition Proxy   │   │
//! │  └───────────────────────────────┘  └───────────────────────┘   │
//! │                                                                 │
//! │  ┌───────────────────────────────┐                              │
//! │  │        Session Registry       │                              │
//! │  └───────────────────────────────┘                              │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │   Session    │  │ Reply Queue  │  │ Process + Line Codec │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, SessionRegistry};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = SessionRegistry::new(config.engine);
//!
//!     let session = registry.create(Some("/usr/local/bin/pikafish")).await?;
//!     let reply = session.request("isready", Duration::from_secs(1)).await?;
//!     println!("{}", reply.line);
//!
//!     registry.shutdown_all().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Engine processes, sessions, registry and dispatch
//! - [`recognition`]: Board image recognition proxy
//! - [`service`]: State shared by the HTTP handlers
//! - [`api`]: HTTP routes and server
//! - [`client`]: HTTP client for a running service

pub mod api;
pub mod client;
pub mod config;
pub mod recognition;
pub mod service;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    CommandDispatcher, CommandReply, EngineReply, RemoveOutcome, Session, SessionError, SessionId,
    SessionRegistry, SessionStatus,
};

pub use api::{ApiError, ApiServer};
pub use client::{ApiClient, ClientError};
pub use recognition::{ImageUpload, RecognitionError, RecognitionProxy, UpstreamReply};
pub use service::EngineService;

//! # zapret - traffic-shaping controller for Linux
//!
//! A host-resident controller that diverts selected egress flows into
//! numbered netfilter queues and supervises one userspace DPI-evasion worker
//! (nfqws) per queue. A declarative strategy file is compiled into paired
//! firewall rules and worker invocations; the two sides are brought up
//! atomically, kept in sync for the lifetime of a session, and torn down
//! cleanly, including after crashes and across reboots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  zapretctl (CLI)          zapretd (daemon)                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  IPC (length-framed JSON over a Unix socket)                 │
//! │    └── status / start / stop / restart / config / ...        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Session controller                                          │
//! │    └── idle → starting → active → stopping, one per process  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Strategy compiler                                           │
//! │    └── strategy file → (FilterRule, WorkerSpec) pairs        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Firewall reconciler (FirewallBackend trait)                 │
//! │    ├── NftablesBackend (tagged rules, preferred)             │
//! │    └── IptablesBackend (dedicated chain, fallback)           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Worker supervisor                                           │
//! │    └── one nfqws process per queue, cohort lifecycle         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cmd`] - Command execution abstraction (testable subprocess calls)
//! - [`config`] - Configuration parsing, env overrides, validation
//! - [`error`] - Closed error taxonomy with matchable kinds
//! - [`firewall`] - Firewall backend abstraction (nftables, iptables)
//! - [`ipc`] - Unix-socket request/response endpoint and client
//! - [`logging`] - Structured logging setup
//! - [`pidfile`] - Locked PID file guard
//! - [`process`] - Worker process supervision
//! - [`session`] - Session lifecycle control
//! - [`signal`] - Shutdown token and signal watcher
//! - [`strategy`] - Strategy file compilation

pub mod cmd;
pub mod config;
pub mod error;
pub mod firewall;
pub mod ipc;
pub mod logging;
pub mod pidfile;
pub mod process;
pub mod session;
pub mod signal;
pub mod strategy;

pub use config::Config;
pub use error::{error_kind, ErrorKind, ZapretError};
pub use session::{SessionController, SessionState};

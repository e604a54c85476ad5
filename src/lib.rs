// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This is a single-process simulation of a small replicated database that
//! combines two classic protocols:
//!
//!   - **Serializable Snapshot Isolation**: every transaction reads from
//!     the snapshot at its start time and is validated at commit, where
//!     first-committer-wins resolves write-write conflicts and a check of
//!     the read-write anti-dependency graph rejects the dangerous
//!     structures that would make the history non-serializable.
//!
//!   - **Available Copies** replication: writes go to every currently-up
//!     copy, reads are served by any up copy that can prove it observed
//!     every relevant prior write. Sites fail (losing their in-flight
//!     buffers, never their committed versions) and recover, at which
//!     point each replicated variable stays unreadable at that site until
//!     a fresh write commits there.
//!
//! The database holds twenty integer variables spread over ten sites:
//! odd-indexed variables live at a single home site, even-indexed ones are
//! replicated everywhere. Clients drive the system with a sequential
//! stream of commands (`begin`, `R`, `W`, `end`, `fail`, `recover`,
//! `dump`), one per line; every command advances a single logical clock by
//! one tick, and every timestamp in the system lives on that one axis.
//!
//! ## Shape of the implementation
//!
//!   - [Coordinator] is the single authority: it owns the clock, the ten
//!     [SiteStore]s, the active and committed [Transaction]s and the
//!     per-variable commit history, and implements read routing, write
//!     broadcast, commit validation and the failure/recovery protocol.
//!
//!   - A read that cannot be served because the needed sites are down
//!     parks its transaction in a data-only WAITING state; a later
//!     `recover` retries it. There are no threads, no awaiters and no
//!     locks anywhere -- the only concurrency in the system is the
//!     logical overlap of transaction lifetimes on the clock axis.
//!
//!   - Every operation returns typed [Event]s; the [run] loop renders
//!     them line-by-line, which is the whole external protocol.
//!
//! ## Caveats
//!
//! This is a simulation for studying the protocols, not a database:
//! storage is in-memory, "failure" is volatile buffer loss, there is no
//! transport, no durability, and no garbage collection of old versions or
//! of the committed-transaction log that cycle detection walks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Diagnostics for operations that are reported and then ignored: unknown
/// or duplicate transaction ids, malformed command lines, and the
/// internal should-not-occur case of an up site missing a version. None of
/// these abort anything; aborts are verdicts, not errors.
#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Transaction {0} not found")]
    TxnNotFound(String),
    #[error("Transaction {0} already exists")]
    DuplicateTxn(String),
    #[error("No version for {0}")]
    NoVersion(VarId),
    #[error("Invalid command format: {0}")]
    InvalidCommand(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("{verb} expects {expected} argument(s)")]
    WrongArity { verb: String, expected: usize },
    #[error("Invalid variable: {0}")]
    BadVariable(String),
    #[error("Invalid site: {0}")]
    BadSite(String),
    #[error("Invalid value: {0}")]
    BadValue(String),
}

mod clock;
mod coordinator;
mod dispatch;
mod event;
pub mod placement;
mod site;
mod transaction;
mod version;

pub use clock::{LogicalClock, Time};
pub use coordinator::Coordinator;
pub use dispatch::{parse_line, run, Command, Dispatcher};
pub use event::{AbortReason, Event, WaitCause};
pub use placement::{SiteId, VarId};
pub use site::{FailureInterval, SiteStore};
pub use transaction::{ReadInfo, Transaction, TxnId, TxnStatus, WaitInfo, WriteInfo};
pub use version::{Version, Writer};

// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Typed operation output. Every command produces a sequence of [Event]s
//! and each event renders as exactly one line of the textual protocol that
//! the test oracles consume, so the engine itself never touches stdout.

use crate::{Error, SiteId, Time, TxnId, VarId};
use serde::{Deserialize, Serialize};

/// Why a validating transaction was aborted.
#[derive(thiserror::Error, Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    #[error("Site failure")]
    SiteFailure,
    #[error("First-committer-wins")]
    FirstCommitterWins,
    #[error("RW-cycle")]
    RwCycle,
    #[error("No valid snapshot for {0}")]
    NoValidSnapshot(VarId),
}

/// Why a read left its transaction waiting.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitCause {
    SiteDown(SiteId),
    NoValidSite,
}

impl std::fmt::Display for WaitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitCause::SiteDown(site) => f.write_fmt(format_args!("site {} down", site)),
            WaitCause::NoValidSite => f.write_str("no valid site"),
        }
    }
}

/// One line of operation output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Begins {
        txn: TxnId,
        at: Time,
    },
    /// A successful read; `own_write` marks a value served from the
    /// transaction's own write buffer.
    ReadValue {
        var: VarId,
        value: i64,
        own_write: bool,
    },
    Waits {
        txn: TxnId,
        cause: WaitCause,
    },
    /// An operation arrived for a transaction that is already waiting.
    StillWaiting {
        txn: TxnId,
    },
    /// A write was buffered; `sites` lists the up sites that accepted it,
    /// possibly none.
    WriteAccepted {
        txn: TxnId,
        var: VarId,
        value: i64,
        sites: Vec<SiteId>,
    },
    Retry {
        txn: TxnId,
    },
    Commits {
        txn: TxnId,
    },
    Aborts {
        txn: TxnId,
        reason: AbortReason,
    },
    SiteFails {
        site: SiteId,
    },
    SiteRecovers {
        site: SiteId,
    },
    DumpHeader,
    DumpSite {
        site: SiteId,
        entries: Vec<(VarId, i64)>,
    },
    DumpFooter,
    /// A diagnostic; the operation it came from was ignored.
    Failed(Error),
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Begins { txn, at } => {
                f.write_fmt(format_args!("Transaction {} begins at time {}", txn, at))
            }
            Event::ReadValue {
                var,
                value,
                own_write,
            } => {
                if *own_write {
                    f.write_fmt(format_args!("{}: {} (RYOW)", var, value))
                } else {
                    f.write_fmt(format_args!("{}: {}", var, value))
                }
            }
            Event::Waits { txn, cause } => {
                f.write_fmt(format_args!("Transaction {} waits ({})", txn, cause))
            }
            Event::StillWaiting { txn } => {
                f.write_fmt(format_args!("Transaction {} is waiting", txn))
            }
            Event::WriteAccepted {
                txn,
                var,
                value,
                sites,
            } => {
                f.write_fmt(format_args!("W({}, {}, {}) -> sites:", txn, var, value))?;
                for site in sites {
                    f.write_fmt(format_args!(" {}", site))?;
                }
                Ok(())
            }
            Event::Retry { txn } => f.write_fmt(format_args!("Retry: {}", txn)),
            Event::Commits { txn } => f.write_fmt(format_args!("{} commits", txn)),
            Event::Aborts { txn, reason } => {
                f.write_fmt(format_args!("{} aborts ({})", txn, reason))
            }
            Event::SiteFails { site } => f.write_fmt(format_args!("Site {} fails", site)),
            Event::SiteRecovers { site } => f.write_fmt(format_args!("Site {} recovers", site)),
            Event::DumpHeader => f.write_str("\n=== DUMP ==="),
            Event::DumpSite { site, entries } => {
                f.write_fmt(format_args!("site {} - ", site))?;
                for (i, (var, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_fmt(format_args!("{}: {}", var, value))?;
                }
                Ok(())
            }
            Event::DumpFooter => f.write_str("============\n"),
            Event::Failed(e) => f.write_fmt(format_args!("Error: {}", e)),
        }
    }
}

// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Time, TxnId};
use serde::{Deserialize, Serialize};

/// Identifies who installed a committed version: either the synthetic
/// initial writer that populates every copy at time zero, or a committed
/// transaction.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Writer {
    Initial,
    Txn(TxnId),
}

impl std::fmt::Display for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Writer::Initial => f.write_str("INITIAL"),
            Writer::Txn(id) => f.write_fmt(format_args!("{}", id)),
        }
    }
}

/// One committed version of a variable at a site: a value, the commit
/// instant that installed it, and the writer's identity. Immutable once
/// appended; per variable at a site, versions form a sequence whose commit
/// times strictly increase.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub value: i64,
    pub commit_ts: Time,
    pub writer: Writer,
}

impl Version {
    pub fn new(value: i64, commit_ts: Time, writer: Writer) -> Self {
        Version {
            value,
            commit_ts,
            writer,
        }
    }

    /// The synthetic version every copy of a variable starts with.
    pub fn initial(value: i64) -> Self {
        Version {
            value,
            commit_ts: Time::ZERO,
            writer: Writer::Initial,
        }
    }
}

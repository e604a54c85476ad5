// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-transaction metadata. A transaction is identified by a client-chosen
//! string id and carries everything the commit-time validator needs: the
//! provenance of every read, the pending writes and where they were
//! buffered, which sites it depends on surviving, when it first touched
//! each site, and its read-write anti-dependency edges.
//!
//! The "waiting" state of a blocked read is data-only: a status tag plus a
//! [WaitInfo] descriptor. There are no threads or awaiters anywhere in the
//! system; the retry scheduler re-enters the blocked read when a candidate
//! site recovers.

use crate::{SiteId, Time, VarId, Writer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A transaction id, unique among live transactions. Edges in the RW graph
/// are keyed by `TxnId` rather than by transaction handles so the graph
/// tolerates references to transactions that have since aborted.
#[derive(Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub String);

impl TxnId {
    pub fn new(id: &str) -> Self {
        TxnId(id.to_string())
    }
}

impl std::fmt::Debug for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Active,
    Waiting,
    Committed,
    Aborted,
}

impl std::fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxnStatus::Active => "ACTIVE",
            TxnStatus::Waiting => "WAITING",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Provenance of one recorded read: which site served it, the value, and
/// the commit time and writer of the version read. The version commit time
/// feeds edge creation at other transactions' commits; the writer identity
/// is kept for diagnostics.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadInfo {
    pub site: SiteId,
    pub value: i64,
    pub version_ts: Time,
    pub writer: Writer,
}

/// One pending write: the latest value this transaction gave the variable,
/// and the sites where the write was accepted into a buffer.
#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInfo {
    pub value: i64,
    pub sites_applied: BTreeSet<SiteId>,
}

/// Descriptor of a blocked read: the variable it wanted and the sites whose
/// recovery might unblock it.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitInfo {
    pub var: VarId,
    pub candidate_sites: BTreeSet<SiteId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub start_ts: Time,
    pub commit_ts: Option<Time>,
    pub status: TxnStatus,

    /// At most one recorded read per variable; the first read wins. Reads
    /// of a variable the transaction has already written resolve from the
    /// write buffer and never land here.
    pub read_set: BTreeMap<VarId, ReadInfo>,
    pub write_set: BTreeMap<VarId, WriteInfo>,

    /// Union of every `sites_applied` set so far.
    pub write_sites: BTreeSet<SiteId>,

    /// Sites from which an unreplicated variable was read. The transaction
    /// depends on these exact sites surviving until it commits.
    pub critical_read_sites: BTreeSet<SiteId>,

    /// Clock value at the first operation that touched each site.
    pub first_access: BTreeMap<SiteId, Time>,

    /// Present exactly when `status == Waiting`.
    pub wait_info: Option<WaitInfo>,

    /// Incoming and outgoing RW anti-dependency edges. `out_rw` holds ids
    /// of transactions that overwrote something this one read; `in_rw` the
    /// reverse.
    pub in_rw: BTreeSet<TxnId>,
    pub out_rw: BTreeSet<TxnId>,
}

impl Transaction {
    pub fn new(id: TxnId, start_ts: Time) -> Self {
        Transaction {
            id,
            start_ts,
            commit_ts: None,
            status: TxnStatus::Active,
            read_set: BTreeMap::new(),
            write_set: BTreeMap::new(),
            write_sites: BTreeSet::new(),
            critical_read_sites: BTreeSet::new(),
            first_access: BTreeMap::new(),
            wait_info: None,
            in_rw: BTreeSet::new(),
            out_rw: BTreeSet::new(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.status == TxnStatus::Waiting
    }

    /// Record a read's provenance. First read of a variable wins; repeat
    /// reads of the same variable return the same snapshot anyway.
    pub fn record_read(&mut self, var: VarId, info: ReadInfo) {
        self.read_set.entry(var).or_insert(info);
    }

    /// Record or overwrite the pending value for `var`. Last write wins
    /// within a transaction; the applied-site set carries over until sites
    /// accept the fresh value.
    pub fn record_write(&mut self, var: VarId, value: i64) {
        self.write_set
            .entry(var)
            .or_insert_with(WriteInfo::default)
            .value = value;
    }

    /// Note that `site` accepted the buffered write of `var`.
    pub fn note_write_applied(&mut self, var: VarId, site: SiteId) {
        self.write_sites.insert(site);
        if let Some(w) = self.write_set.get_mut(&var) {
            w.sites_applied.insert(site);
        }
    }

    /// Stamp the first-access time for `site` if this is the first touch.
    pub fn note_first_access(&mut self, site: SiteId, now: Time) {
        self.first_access.entry(site).or_insert(now);
    }

    pub fn set_waiting(&mut self, var: VarId, candidate_sites: BTreeSet<SiteId>) {
        self.status = TxnStatus::Waiting;
        self.wait_info = Some(WaitInfo {
            var,
            candidate_sites,
        });
    }

    pub fn resume_from_waiting(&mut self) -> Option<WaitInfo> {
        self.status = TxnStatus::Active;
        self.wait_info.take()
    }
}

// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-site storage. Each site holds a multi-version store for the subset
//! of variables it hosts, a buffer of uncommitted writes keyed by
//! transaction, a per-variable read gate used by the recovery protocol, and
//! an up/down flag with the full history of failure intervals.
//!
//! Failure is volatile loss of the buffers only: committed versions always
//! survive. What a recovered site may *serve* is restricted instead -- a
//! replicated variable's gate stays closed until a fresh write commits at
//! this site, and the coordinator's continuity check refuses snapshots that
//! span a failure interval.

use crate::{placement, SiteId, Time, TxnId, VarId, Version, Writer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// One `[fail_time, recover_time)` outage. The interval at the tail is open
/// (`recover_time == None`) exactly while the site is down.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureInterval {
    pub fail_time: Time,
    pub recover_time: Option<Time>,
}

impl FailureInterval {
    /// Whether this outage overlaps the closed span `[from, to]`.
    fn overlaps(&self, from: Time, to: Time) -> bool {
        self.fail_time <= to
            && match self.recover_time {
                None => true,
                Some(r) => r > from,
            }
    }
}

pub struct SiteStore {
    site_id: SiteId,
    is_up: bool,

    /// Committed versions per hosted variable, in append order; commit
    /// times strictly increase within each sequence and the first entry is
    /// always the time-zero initial version.
    versions: BTreeMap<VarId, Vec<Version>>,

    /// Uncommitted writes, transaction then variable. Wiped wholesale by
    /// [SiteStore::fail].
    write_buffer: BTreeMap<TxnId, BTreeMap<VarId, i64>>,

    /// Read gates for the replicated variables hosted here. Closed on
    /// recovery; a gate reopens only when a new write of that variable
    /// commits at this site.
    replica_read_enabled: BTreeMap<VarId, bool>,

    failure_history: Vec<FailureInterval>,
}

impl SiteStore {
    /// A site starts up, hosting its share of the variables with their
    /// initial versions and every replica gate open.
    pub fn new(site_id: SiteId) -> Self {
        let mut versions = BTreeMap::new();
        let mut replica_read_enabled = BTreeMap::new();
        for var in placement::all_vars() {
            if placement::hosts(site_id, var) {
                versions.insert(var, vec![Version::initial(placement::initial_value(var))]);
                if placement::is_replicated(var) {
                    replica_read_enabled.insert(var, true);
                }
            }
        }
        SiteStore {
            site_id,
            is_up: true,
            versions,
            write_buffer: BTreeMap::new(),
            replica_read_enabled,
            failure_history: Vec::new(),
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn is_up(&self) -> bool {
        self.is_up
    }

    pub fn hosts(&self, var: VarId) -> bool {
        self.versions.contains_key(&var)
    }

    /// Whether a read of `var` may be served right now. Unreplicated
    /// variables are always readable while the site is up; replicated ones
    /// only while their gate is open.
    pub fn is_replica_readable(&self, var: VarId) -> bool {
        if !placement::is_replicated(var) {
            return true;
        }
        *self.replica_read_enabled.get(&var).unwrap_or(&false)
    }

    /// Snapshot read: the latest version of `var` committed at or before
    /// `snapshot_ts`, or `None` if the site does not host `var`, is down,
    /// or the variable's read gate is closed.
    pub fn read(&self, var: VarId, snapshot_ts: Time) -> Option<&Version> {
        if !self.is_up || !self.is_replica_readable(var) {
            return None;
        }
        self.latest_at_or_before(var, snapshot_ts)
    }

    /// The latest committed version of `var` at or before `ts`, ignoring
    /// liveness and gates. The coordinator pairs this with its own validity
    /// checks when routing replicated reads.
    pub fn latest_at_or_before(&self, var: VarId, ts: Time) -> Option<&Version> {
        self.versions
            .get(&var)?
            .iter()
            .rev()
            .find(|v| v.commit_ts <= ts)
    }

    /// Buffer an uncommitted write. Overwrites any prior buffered value for
    /// the same transaction and variable; committed versions are untouched.
    /// The coordinator only calls this while the site is up.
    pub fn buffer_write(&mut self, txn: &TxnId, var: VarId, value: i64) {
        debug_assert!(self.is_up);
        self.write_buffer
            .entry(txn.clone())
            .or_insert_with(BTreeMap::new)
            .insert(var, value);
    }

    /// Promote `txn`'s buffered writes to committed versions at
    /// `commit_ts`, reopening the gate of each replicated variable written.
    /// A no-op if the site holds no buffer for `txn` (e.g. it failed and
    /// lost the buffer since the write).
    pub fn commit(&mut self, txn: &TxnId, commit_ts: Time) {
        let writes = match self.write_buffer.remove(txn) {
            None => return,
            Some(w) => w,
        };
        for (var, value) in writes {
            let version = Version::new(value, commit_ts, Writer::Txn(txn.clone()));
            let chain = self.versions.entry(var).or_insert_with(Vec::new);
            debug_assert!(chain.last().map(|v| v.commit_ts < commit_ts).unwrap_or(true));
            chain.push(version);
            if placement::is_replicated(var) {
                self.replica_read_enabled.insert(var, true);
            }
        }
        trace!("site {} committed writes of {} at {:?}", self.site_id, txn, commit_ts);
    }

    /// Discard `txn`'s buffered writes. No version changes.
    pub fn abort(&mut self, txn: &TxnId) {
        self.write_buffer.remove(txn);
    }

    /// The site goes down: every in-flight buffer is lost, committed
    /// versions survive, and a new open failure interval is recorded.
    /// Idempotent: failing a down site changes nothing.
    pub fn fail(&mut self, now: Time) {
        if !self.is_up {
            return;
        }
        self.is_up = false;
        self.write_buffer.clear();
        self.failure_history.push(FailureInterval {
            fail_time: now,
            recover_time: None,
        });
    }

    /// The site comes back: the open interval closes and every replicated
    /// variable's gate shuts until a new write of it commits here.
    /// Unreplicated variables stay readable -- this was their only copy and
    /// its committed versions are intact.
    pub fn recover(&mut self, now: Time) {
        if self.is_up {
            return;
        }
        self.is_up = true;
        if let Some(open) = self.failure_history.last_mut() {
            if open.recover_time.is_none() {
                open.recover_time = Some(now);
            }
        }
        trace!(
            "site {} recovering at {:?}, closing {} read gates",
            self.site_id,
            now,
            self.replica_read_enabled.len()
        );
        for enabled in self.replica_read_enabled.values_mut() {
            *enabled = false;
        }
    }

    /// True iff no recorded failure interval overlaps `[from, to]`.
    pub fn was_up_continuously(&self, from: Time, to: Time) -> bool {
        !self.failure_history.iter().any(|i| i.overlaps(from, to))
    }

    pub fn failure_history(&self) -> &[FailureInterval] {
        &self.failure_history
    }

    /// Whether `txn` has writes buffered here.
    pub fn has_buffered_writes(&self, txn: &TxnId) -> bool {
        self.write_buffer.contains_key(txn)
    }

    /// The latest committed value of every hosted variable, in ascending
    /// variable order. Down sites still answer from committed state.
    pub fn committed_state(&self) -> Vec<(VarId, i64)> {
        self.versions
            .iter()
            .filter_map(|(var, chain)| chain.last().map(|v| (*var, v.value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: &str) -> TxnId {
        TxnId::new(id)
    }

    #[test]
    fn test_initial_population() {
        let s = SiteStore::new(SiteId(2));
        // All ten even variables, plus the odds homed here: 1 and 11.
        assert!(s.hosts(VarId(1)));
        assert!(s.hosts(VarId(11)));
        assert!(s.hosts(VarId(2)));
        assert!(!s.hosts(VarId(3)));
        let v = s.read(VarId(1), Time::ZERO).unwrap();
        assert_eq!(v.value, 10);
        assert_eq!(v.commit_ts, Time::ZERO);
        assert_eq!(v.writer, Writer::Initial);
    }

    #[test]
    fn test_snapshot_read_picks_latest_at_or_before() {
        let mut s = SiteStore::new(SiteId(1));
        s.buffer_write(&txn("T1"), VarId(2), 21);
        s.commit(&txn("T1"), Time(5));
        s.buffer_write(&txn("T2"), VarId(2), 22);
        s.commit(&txn("T2"), Time(9));

        assert_eq!(s.read(VarId(2), Time(4)).unwrap().value, 20);
        assert_eq!(s.read(VarId(2), Time(5)).unwrap().value, 21);
        assert_eq!(s.read(VarId(2), Time(8)).unwrap().value, 21);
        assert_eq!(s.read(VarId(2), Time(9)).unwrap().value, 22);
    }

    #[test]
    fn test_buffers_lost_on_failure() {
        let mut s = SiteStore::new(SiteId(1));
        s.buffer_write(&txn("T1"), VarId(2), 99);
        assert!(s.has_buffered_writes(&txn("T1")));
        s.fail(Time(3));
        assert!(!s.has_buffered_writes(&txn("T1")));
        // Committing after the failure is a no-op: the buffer is gone.
        s.recover(Time(4));
        s.commit(&txn("T1"), Time(5));
        assert_eq!(s.latest_at_or_before(VarId(2), Time(9)).unwrap().value, 20);
    }

    #[test]
    fn test_read_gate_lifecycle() {
        // Site 4 homes x3 and x13 besides the replicated evens.
        let mut s = SiteStore::new(SiteId(4));
        assert!(s.is_replica_readable(VarId(2)));
        s.fail(Time(1));
        assert_eq!(s.read(VarId(2), Time(1)), None);
        s.recover(Time(2));
        // Gate closed: replicated reads refused, unreplicated reads fine.
        assert!(!s.is_replica_readable(VarId(2)));
        assert_eq!(s.read(VarId(2), Time(2)), None);
        assert!(s.read(VarId(13), Time(2)).is_some());
        // First committed write of x2 here reopens its gate, and only its.
        s.buffer_write(&txn("T1"), VarId(2), 202);
        s.commit(&txn("T1"), Time(5));
        assert!(s.is_replica_readable(VarId(2)));
        assert!(!s.is_replica_readable(VarId(4)));
        assert_eq!(s.read(VarId(2), Time(5)).unwrap().value, 202);
    }

    #[test]
    fn test_was_up_continuously() {
        let mut s = SiteStore::new(SiteId(1));
        assert!(s.was_up_continuously(Time::ZERO, Time(100)));
        s.fail(Time(5));
        // Open interval overlaps everything from its start on.
        assert!(s.was_up_continuously(Time(1), Time(4)));
        assert!(!s.was_up_continuously(Time(1), Time(5)));
        assert!(!s.was_up_continuously(Time(6), Time(9)));
        s.recover(Time(8));
        // Closed interval [5, 8): up again from 8 onward.
        assert!(!s.was_up_continuously(Time(4), Time(6)));
        assert!(!s.was_up_continuously(Time(7), Time(7)));
        assert!(s.was_up_continuously(Time(8), Time(12)));
        assert!(s.was_up_continuously(Time(1), Time(4)));
    }

    #[test]
    fn test_failure_history_intervals() {
        let mut s = SiteStore::new(SiteId(1));
        s.fail(Time(2));
        s.recover(Time(4));
        s.fail(Time(7));
        let h = s.failure_history();
        assert_eq!(h.len(), 2);
        assert_eq!(h[0].fail_time, Time(2));
        assert_eq!(h[0].recover_time, Some(Time(4)));
        assert_eq!(h[1].fail_time, Time(7));
        assert_eq!(h[1].recover_time, None);
    }

    #[test]
    fn test_committed_state_orders_by_variable() {
        let mut s = SiteStore::new(SiteId(2));
        s.buffer_write(&txn("T1"), VarId(11), 111);
        s.commit(&txn("T1"), Time(3));
        let state = s.committed_state();
        let vars: Vec<u32> = state.iter().map(|(v, _)| v.0).collect();
        let mut sorted = vars.clone();
        sorted.sort_unstable();
        assert_eq!(vars, sorted);
        assert!(state.contains(&(VarId(11), 111)));
        assert!(state.contains(&(VarId(1), 10)));
    }
}

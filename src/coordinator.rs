// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The coordinator is the single authority over the whole simulated group:
//! it owns the logical clock, the ten site stores, the active and committed
//! transactions, and the per-variable commit history. Every operation ticks
//! the clock once and returns the [Event]s it produced.
//!
//! Reads are snapshot reads routed over available copies: an unreplicated
//! variable has exactly one home site (wait if it's down), a replicated one
//! may be served by any up site that can prove a trustworthy snapshot --
//! the site must hold a version at or before the reader's start time and
//! must have been up continuously from that version's commit to the start
//! time, which keeps freshly-recovered replicas out of the pool until a
//! new write lands on them.
//!
//! Writes broadcast to every up hosting site and stay buffered there until
//! commit. All contention resolves in [Coordinator::end]: the failure rule
//! (a depended-on site failed mid-transaction), first-committer-wins on
//! write sets, and the serializable-snapshot check for dangerous structures
//! in the read-write anti-dependency graph.

use crate::{
    placement, AbortReason, Error, Event, LogicalClock, ReadInfo, SiteId, SiteStore, Time,
    Transaction, TxnId, TxnStatus, VarId, WaitCause,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};

pub struct Coordinator {
    clock: LogicalClock,
    sites: BTreeMap<SiteId, SiteStore>,
    active: BTreeMap<TxnId, Transaction>,
    committed: Vec<Transaction>,

    /// Who committed each variable, and when, in commit order. Feeds the
    /// first-committer-wins check and the committer-path cycle probe.
    commit_history: BTreeMap<VarId, Vec<(TxnId, Time)>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Coordinator::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Coordinator {
            clock: LogicalClock::new(),
            sites: placement::all_sites()
                .map(|s| (s, SiteStore::new(s)))
                .collect(),
            active: BTreeMap::new(),
            committed: Vec::new(),
            commit_history: BTreeMap::new(),
        }
    }

    /// The instant of the most recent operation.
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    pub fn site(&self, id: SiteId) -> Option<&SiteStore> {
        self.sites.get(&id)
    }

    pub fn active_txn(&self, id: &str) -> Option<&Transaction> {
        self.active.get(&TxnId::new(id))
    }

    pub fn committed_txns(&self) -> &[Transaction] {
        &self.committed
    }

    pub fn begin(&mut self, id: &str) -> Vec<Event> {
        let now = self.clock.tick();
        let id = TxnId::new(id);
        if self.active.contains_key(&id) {
            return vec![Event::Failed(Error::DuplicateTxn(id.0))];
        }
        debug!("begin {} at {:?}", id, now);
        self.active.insert(id.clone(), Transaction::new(id.clone(), now));
        vec![Event::Begins { txn: id, at: now }]
    }

    pub fn read(&mut self, id: &str, var: VarId) -> Vec<Event> {
        self.clock.tick();
        let id = TxnId::new(id);
        let (waiting, start_ts, buffered) = match self.active.get(&id) {
            None => return vec![Event::Failed(Error::TxnNotFound(id.0))],
            Some(t) => (
                t.is_waiting(),
                t.start_ts,
                t.write_set.get(&var).map(|w| w.value),
            ),
        };
        if waiting {
            return vec![Event::StillWaiting { txn: id }];
        }
        // Read-your-own-write: resolve from the pending write, never from a
        // site, and do not record a read.
        if let Some(value) = buffered {
            return vec![Event::ReadValue {
                var,
                value,
                own_write: true,
            }];
        }
        let mut events = Vec::new();
        if placement::is_replicated(var) {
            self.read_replicated(&id, var, start_ts, &mut events);
        } else {
            self.read_unreplicated(&id, var, start_ts, &mut events);
        }
        events
    }

    pub fn write(&mut self, id: &str, var: VarId, value: i64) -> Vec<Event> {
        let now = self.clock.tick();
        let id = TxnId::new(id);
        match self.active.get(&id) {
            None => return vec![Event::Failed(Error::TxnNotFound(id.0))],
            Some(t) if t.is_waiting() => return vec![Event::StillWaiting { txn: id }],
            Some(_) => (),
        }
        // Broadcast to every up hosting site. A write with no up sites
        // still records locally; validation settles its fate at end.
        let mut applied = Vec::new();
        for sid in placement::placement(var) {
            if let Some(site) = self.sites.get_mut(&sid) {
                if site.is_up() {
                    site.buffer_write(&id, var, value);
                    applied.push(sid);
                }
            }
        }
        trace!("{} buffered {}={} at {} site(s)", id, var, value, applied.len());
        if let Some(txn) = self.active.get_mut(&id) {
            txn.record_write(var, value);
            for sid in &applied {
                txn.note_write_applied(var, *sid);
                txn.note_first_access(*sid, now);
            }
        }
        vec![Event::WriteAccepted {
            txn: id,
            var,
            value,
            sites: applied,
        }]
    }

    pub fn end(&mut self, id: &str) -> Vec<Event> {
        let now = self.clock.tick();
        let id = TxnId::new(id);
        let txn = match self.active.remove(&id) {
            None => return vec![Event::Failed(Error::TxnNotFound(id.0))],
            Some(t) => t,
        };
        if self.violates_failure_rule(&txn, now) {
            debug!("{} fails validation: depended-on site failed", id);
            return vec![self.finish_abort(txn, AbortReason::SiteFailure)];
        }
        if self.violates_first_committer_wins(&txn, now) {
            debug!("{} fails validation: lost first-committer-wins", id);
            return vec![self.finish_abort(txn, AbortReason::FirstCommitterWins)];
        }
        // Edges stay provisional through the cycle check; they are only
        // materialized below, alongside the commit itself.
        let readers = self.collect_rw_readers(&txn, now);
        if self.has_dangerous_structure(&txn, &readers) {
            debug!("{} fails validation: dangerous RW structure", id);
            return vec![self.finish_abort(txn, AbortReason::RwCycle)];
        }
        vec![self.finish_commit(txn, readers, now)]
    }

    pub fn fail(&mut self, site: SiteId) -> Vec<Event> {
        let now = self.clock.tick();
        if let Some(s) = self.sites.get_mut(&site) {
            s.fail(now);
        }
        vec![Event::SiteFails { site }]
    }

    /// Bring `site` back up, then retry every waiting transaction whose
    /// blocked read might now be servable. A retried read re-enters the
    /// ordinary routing and may succeed, wait again, or abort.
    pub fn recover(&mut self, site: SiteId) -> Vec<Event> {
        let now = self.clock.tick();
        let mut events = vec![Event::SiteRecovers { site }];
        if let Some(s) = self.sites.get_mut(&site) {
            s.recover(now);
        }

        let mut to_retry = Vec::new();
        for (id, txn) in &self.active {
            let info = match &txn.wait_info {
                None => continue,
                Some(i) => i,
            };
            if !info.candidate_sites.contains(&site) {
                continue;
            }
            let eligible = !placement::is_replicated(info.var)
                || !self.valid_snapshot_sites(txn.start_ts, info.var).is_empty();
            if eligible {
                to_retry.push((id.clone(), info.var, txn.start_ts));
            }
        }
        debug!("site {} recovery unblocks {} waiter(s)", site, to_retry.len());

        for (id, var, start_ts) in to_retry {
            events.push(Event::Retry { txn: id.clone() });
            if let Some(txn) = self.active.get_mut(&id) {
                txn.resume_from_waiting();
            }
            if placement::is_replicated(var) {
                self.read_replicated(&id, var, start_ts, &mut events);
            } else {
                self.read_unreplicated(&id, var, start_ts, &mut events);
            }
        }
        events
    }

    /// Committed state of every site, in site order. Down sites dump too:
    /// failure loses buffers, never committed versions.
    pub fn dump(&mut self) -> Vec<Event> {
        self.clock.tick();
        let mut events = vec![Event::DumpHeader];
        for (site, store) in &self.sites {
            events.push(Event::DumpSite {
                site: *site,
                entries: store.committed_state(),
            });
        }
        events.push(Event::DumpFooter);
        events
    }

    // Read routing.

    fn read_unreplicated(&mut self, id: &TxnId, var: VarId, start_ts: Time, events: &mut Vec<Event>) {
        let home = placement::home_site(var);
        let now = self.clock.now();
        let version = match self.sites.get(&home) {
            Some(site) if site.is_up() => site.read(var, start_ts).cloned(),
            _ => {
                debug!("{} blocks on {}: home site {} down", id, var, home);
                events.push(Event::Waits {
                    txn: id.clone(),
                    cause: WaitCause::SiteDown(home),
                });
                if let Some(txn) = self.active.get_mut(id) {
                    txn.set_waiting(var, std::iter::once(home).collect());
                }
                return;
            }
        };
        let v = match version {
            // An up home site always has a version at or before any start
            // time; reaching this is an internal invariant breach.
            None => {
                events.push(Event::Failed(Error::NoVersion(var)));
                return;
            }
            Some(v) => v,
        };
        if let Some(txn) = self.active.get_mut(id) {
            txn.record_read(
                var,
                ReadInfo {
                    site: home,
                    value: v.value,
                    version_ts: v.commit_ts,
                    writer: v.writer.clone(),
                },
            );
            txn.critical_read_sites.insert(home);
            txn.note_first_access(home, now);
        }
        events.push(Event::ReadValue {
            var,
            value: v.value,
            own_write: false,
        });
    }

    fn read_replicated(&mut self, id: &TxnId, var: VarId, start_ts: Time, events: &mut Vec<Event>) {
        let now = self.clock.now();
        let valid = self.valid_snapshot_sites(start_ts, var);
        if valid.is_empty() {
            // No up site can prove a trustworthy snapshot. Wait on the down
            // hosting sites that were up at our start time -- any other
            // site could never pass the continuity check for us, so
            // waiting on it would never resolve.
            let mut candidates = BTreeSet::new();
            for sid in placement::placement(var) {
                if let Some(site) = self.sites.get(&sid) {
                    if !site.is_up() && site.was_up_continuously(start_ts, start_ts) {
                        candidates.insert(sid);
                    }
                }
            }
            if candidates.is_empty() {
                debug!("{} has no snapshot source for {}, aborting", id, var);
                if let Some(txn) = self.active.remove(id) {
                    events.push(self.finish_abort(txn, AbortReason::NoValidSnapshot(var)));
                }
            } else {
                debug!("{} blocks on {}: no valid site yet", id, var);
                events.push(Event::Waits {
                    txn: id.clone(),
                    cause: WaitCause::NoValidSite,
                });
                if let Some(txn) = self.active.get_mut(id) {
                    txn.set_waiting(var, candidates);
                }
            }
            return;
        }
        // Smallest valid site id, for determinism.
        let chosen = match valid.into_iter().next() {
            None => return,
            Some(s) => s,
        };
        let version = self
            .sites
            .get(&chosen)
            .and_then(|s| s.latest_at_or_before(var, start_ts))
            .cloned();
        let v = match version {
            None => {
                events.push(Event::Failed(Error::NoVersion(var)));
                return;
            }
            Some(v) => v,
        };
        trace!("{} reads {} from site {} (version at {:?})", id, var, chosen, v.commit_ts);
        if let Some(txn) = self.active.get_mut(id) {
            txn.record_read(
                var,
                ReadInfo {
                    site: chosen,
                    value: v.value,
                    version_ts: v.commit_ts,
                    writer: v.writer.clone(),
                },
            );
            // Not a critical read: other copies can still serve history.
            txn.note_first_access(chosen, now);
        }
        events.push(Event::ReadValue {
            var,
            value: v.value,
            own_write: false,
        });
    }

    /// The up sites able to serve a snapshot of `var` at `start_ts`. An
    /// unreplicated variable's up home always qualifies. A replicated copy
    /// qualifies iff it holds a version at or before `start_ts` and the
    /// site stayed up from that version's commit through `start_ts`; a
    /// recovered site re-qualifies only once a newer commit lands on it.
    fn valid_snapshot_sites(&self, start_ts: Time, var: VarId) -> BTreeSet<SiteId> {
        let mut valid = BTreeSet::new();
        for sid in placement::placement(var) {
            let site = match self.sites.get(&sid) {
                None => continue,
                Some(s) => s,
            };
            if !site.is_up() {
                continue;
            }
            if !placement::is_replicated(var) {
                valid.insert(sid);
                continue;
            }
            if let Some(v) = site.latest_at_or_before(var, start_ts) {
                if site.was_up_continuously(v.commit_ts, start_ts) {
                    valid.insert(sid);
                }
            }
        }
        valid
    }

    // Commit-time validation.

    /// A transaction depending on a site -- it wrote there, or read the
    /// only copy of a variable there -- aborts if that site failed at or
    /// after the transaction's first touch of it.
    fn violates_failure_rule(&self, txn: &Transaction, now: Time) -> bool {
        for site_id in txn.write_sites.union(&txn.critical_read_sites) {
            let first = match txn.first_access.get(site_id) {
                None => continue,
                Some(t) => *t,
            };
            if let Some(site) = self.sites.get(site_id) {
                if site
                    .failure_history()
                    .iter()
                    .any(|i| i.fail_time >= first && i.fail_time < now)
                {
                    return true;
                }
            }
        }
        false
    }

    fn violates_first_committer_wins(&self, txn: &Transaction, now: Time) -> bool {
        txn.write_set.keys().any(|var| {
            self.commit_history
                .get(var)
                .map(|hist| {
                    hist.iter()
                        .any(|(_, ts)| *ts > txn.start_ts && *ts < now)
                })
                .unwrap_or(false)
        })
    }

    /// Everyone holding an anti-dependency into the committing `txn`: each
    /// transaction that read a variable `txn` is about to overwrite --
    /// every active reader, and every committed reader whose read predates
    /// this commit. The edges are returned, not installed.
    fn collect_rw_readers(&self, txn: &Transaction, now: Time) -> BTreeSet<TxnId> {
        let mut readers = BTreeSet::new();
        for var in txn.write_set.keys() {
            for (rid, r) in &self.active {
                if r.read_set.contains_key(var) {
                    readers.insert(rid.clone());
                }
            }
            for c in &self.committed {
                if c.id == txn.id {
                    continue;
                }
                if let Some(read) = c.read_set.get(var) {
                    if read.version_ts < now {
                        readers.insert(c.id.clone());
                    }
                }
            }
        }
        readers
    }

    /// Outgoing RW edges of `node`, viewed through the provisional edges of
    /// the committing `txn`: every tentative reader gains an edge into
    /// `txn`. Transactions that vanished (aborted) have no outgoing edges.
    fn out_edges_of(
        &self,
        node: &TxnId,
        txn: &Transaction,
        readers: &BTreeSet<TxnId>,
    ) -> Vec<TxnId> {
        let mut out: Vec<TxnId> = if *node == txn.id {
            txn.out_rw.iter().cloned().collect()
        } else if let Some(t) = self.active.get(node) {
            t.out_rw.iter().cloned().collect()
        } else if let Some(t) = self.committed.iter().rev().find(|t| t.id == *node) {
            t.out_rw.iter().cloned().collect()
        } else {
            Vec::new()
        };
        if readers.contains(node) {
            out.push(txn.id.clone());
        }
        out
    }

    /// The serializable-snapshot dangerous structure: a cycle through the
    /// committing transaction carrying at least two RW anti-dependency
    /// edges. Two probes: a DFS for a walk that leaves `txn` and returns to
    /// it over RW edges, and a path probe from `txn` to any concurrent
    /// prior committer of a variable `txn` writes, whose write-write
    /// dependency back into `txn` would close the loop.
    fn has_dangerous_structure(&self, txn: &Transaction, readers: &BTreeSet<TxnId>) -> bool {
        let mut visited = BTreeSet::new();
        if self.rw_walk_returns(&txn.id, txn, readers, &mut visited, 0) {
            return true;
        }
        for var in txn.write_set.keys() {
            if let Some(hist) = self.commit_history.get(var) {
                for (cid, cts) in hist {
                    if *cid == txn.id {
                        continue;
                    }
                    if *cts > txn.start_ts && self.rw_path_exists(&txn.id, cid, txn, readers) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn rw_walk_returns(
        &self,
        current: &TxnId,
        txn: &Transaction,
        readers: &BTreeSet<TxnId>,
        visited: &mut BTreeSet<TxnId>,
        edges: usize,
    ) -> bool {
        if *current == txn.id && edges >= 2 {
            return true;
        }
        if !visited.insert(current.clone()) {
            return false;
        }
        for next in self.out_edges_of(current, txn, readers) {
            if self.rw_walk_returns(&next, txn, readers, visited, edges + 1) {
                return true;
            }
        }
        false
    }

    fn rw_path_exists(
        &self,
        from: &TxnId,
        to: &TxnId,
        txn: &Transaction,
        readers: &BTreeSet<TxnId>,
    ) -> bool {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from.clone());
        queue.push_back(from.clone());
        while let Some(current) = queue.pop_front() {
            if current == *to {
                return true;
            }
            for next in self.out_edges_of(&current, txn, readers) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    // Commit and abort.

    fn finish_commit(
        &mut self,
        mut txn: Transaction,
        readers: BTreeSet<TxnId>,
        now: Time,
    ) -> Event {
        for site_id in &txn.write_sites {
            if let Some(site) = self.sites.get_mut(site_id) {
                if site.is_up() {
                    site.commit(&txn.id, now);
                }
            }
        }
        for var in txn.write_set.keys() {
            self.commit_history
                .entry(*var)
                .or_insert_with(Vec::new)
                .push((txn.id.clone(), now));
        }
        // Materialize the provisional edges: each reader points at us now.
        for reader in readers {
            if let Some(r) = self.active.get_mut(&reader) {
                r.out_rw.insert(txn.id.clone());
            } else if let Some(r) = self.committed.iter_mut().rev().find(|t| t.id == reader) {
                r.out_rw.insert(txn.id.clone());
            }
            txn.in_rw.insert(reader);
        }
        debug!("{} commits at {:?}", txn.id, now);
        txn.commit_ts = Some(now);
        txn.status = TxnStatus::Committed;
        // An ended-while-waiting transaction sheds its wait descriptor.
        txn.wait_info = None;
        let id = txn.id.clone();
        self.committed.push(txn);
        Event::Commits { txn: id }
    }

    /// Drop the transaction: buffered writes discarded at every site it
    /// wrote, no versions changed, no edges installed. Other transactions
    /// may retain stale edges naming this id; graph walks treat a missing
    /// id as having no outgoing edges.
    fn finish_abort(&mut self, mut txn: Transaction, reason: AbortReason) -> Event {
        for site_id in &txn.write_sites {
            if let Some(site) = self.sites.get_mut(site_id) {
                site.abort(&txn.id);
            }
        }
        debug!("{} aborts: {}", txn.id, reason);
        txn.status = TxnStatus::Aborted;
        Event::Aborts {
            txn: txn.id.clone(),
            reason,
        }
    }
}

// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use palimpsest::{run, Dispatcher, SiteId, Time, TxnStatus, VarId, Writer};

use std::io::Cursor;

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Feed a whole command script through the same run loop the binary uses
/// and return the output split into lines.
fn run_script(script: &str) -> Vec<String> {
    setup_tracing_subscriber();
    let mut out = Vec::new();
    run(Cursor::new(script), &mut out).expect("in-memory io");
    String::from_utf8(out)
        .expect("output is utf8")
        .lines()
        .map(str::to_string)
        .collect()
}

/// Like [run_script] but keeps the dispatcher around so tests can inspect
/// coordinator state afterwards.
fn dispatch_script(script: &str) -> (Dispatcher, Vec<String>) {
    setup_tracing_subscriber();
    let mut dispatcher = Dispatcher::new();
    let mut lines = Vec::new();
    for line in script.lines() {
        for event in dispatcher.dispatch_line(line) {
            for l in event.to_string().split('\n') {
                lines.push(l.to_string());
            }
        }
    }
    (dispatcher, lines)
}

const DEFAULT_EVENS: &str =
    "x2: 20, x4: 40, x6: 60, x8: 80, x10: 100, x12: 120, x14: 140, x16: 160, x18: 180, x20: 200";

#[test]
fn basic_commit_and_dump() {
    let lines = run_script(
        "begin(T1)\n\
         W(T1, x1, 101)\n\
         R(T1, x1)\n\
         end(T1)\n\
         dump()\n",
    );
    assert_eq!(lines[0], "Transaction T1 begins at time 1");
    assert_eq!(lines[1], "W(T1, x1, 101) -> sites: 2");
    assert_eq!(lines[2], "x1: 101 (RYOW)");
    assert_eq!(lines[3], "T1 commits");
    assert_eq!(lines[4], "");
    assert_eq!(lines[5], "=== DUMP ===");
    // Odd variables live only at even-numbered sites, so site 1 carries
    // just the replicated evens; site 2 additionally homes x1 and x11.
    assert_eq!(lines[6], format!("site 1 - {}", DEFAULT_EVENS));
    assert_eq!(
        lines[7],
        "site 2 - x1: 101, x2: 20, x4: 40, x6: 60, x8: 80, x10: 100, \
         x11: 110, x12: 120, x14: 140, x16: 160, x18: 180, x20: 200"
    );
    assert_eq!(lines[16], "============");
    assert_eq!(lines.len(), 18);
}

#[test]
fn first_committer_wins() {
    let lines = run_script(
        "begin(T1)\n\
         begin(T2)\n\
         W(T1, x2, 22)\n\
         W(T2, x2, 33)\n\
         end(T1)\n\
         end(T2)\n",
    );
    assert_eq!(
        lines,
        vec![
            "Transaction T1 begins at time 1",
            "Transaction T2 begins at time 2",
            "W(T1, x2, 22) -> sites: 1 2 3 4 5 6 7 8 9 10",
            "W(T2, x2, 33) -> sites: 1 2 3 4 5 6 7 8 9 10",
            "T1 commits",
            "T2 aborts (First-committer-wins)",
        ]
    );
}

#[test]
fn unreplicated_read_dies_with_its_site() {
    // x3 lives only at site 4; the reader depends on that exact site
    // surviving until commit.
    let lines = run_script(
        "begin(T1)\n\
         R(T1, x3)\n\
         fail(4)\n\
         end(T1)\n",
    );
    assert_eq!(lines[1], "x3: 30");
    assert_eq!(lines[2], "Site 4 fails");
    assert_eq!(lines[3], "T1 aborts (Site failure)");
}

#[test]
fn replicated_read_survives_failure() {
    let lines = run_script(
        "begin(T1)\n\
         R(T1, x2)\n\
         fail(4)\n\
         end(T1)\n",
    );
    assert_eq!(lines[1], "x2: 20");
    assert_eq!(lines[2], "Site 4 fails");
    assert_eq!(lines[3], "T1 commits");
}

#[test]
fn write_site_failure_aborts_writer() {
    let lines = run_script(
        "begin(T1)\n\
         W(T1, x2, 5)\n\
         fail(3)\n\
         end(T1)\n",
    );
    assert_eq!(lines[3], "T1 aborts (Site failure)");
}

#[test]
fn blocked_read_retries_after_recovery() {
    // The retried read first touches site 2 after its recovery, so the
    // failure interval predates the first access and the commit stands.
    let lines = run_script(
        "fail(2)\n\
         begin(T1)\n\
         R(T1, x1)\n\
         recover(2)\n\
         end(T1)\n",
    );
    assert_eq!(
        lines,
        vec![
            "Site 2 fails",
            "Transaction T1 begins at time 2",
            "Transaction T1 waits (site 2 down)",
            "Site 2 recovers",
            "Retry: T1",
            "x1: 10",
            "T1 commits",
        ]
    );
}

#[test]
fn recovered_replica_stays_gated_until_new_write() {
    let (d, lines) = dispatch_script(
        "fail(4)\n\
         begin(T1)\n\
         R(T1, x2)\n\
         end(T1)\n\
         recover(4)\n\
         begin(T2)\n\
         R(T2, x2)\n\
         end(T2)\n",
    );
    assert_eq!(lines[2], "x2: 20");
    assert_eq!(lines[3], "T1 commits");
    assert_eq!(lines[6], "x2: 20");
    assert_eq!(lines[7], "T2 commits");
    // Site 4 is up again but refuses replicated reads until a fresh write
    // of each variable commits there.
    let site = d.coordinator().site(SiteId(4)).expect("site 4 exists");
    assert!(site.is_up());
    assert!(!site.is_replica_readable(VarId(2)));
    assert_eq!(site.read(VarId(2), Time(100)), None);
    // Its only-copy variables x3 and x13 never gate.
    assert!(site.read(VarId(13), Time(100)).is_some());
}

#[test]
fn gate_reopens_on_first_committed_write() {
    let (d, lines) = dispatch_script(
        "fail(3)\n\
         recover(3)\n\
         begin(T1)\n\
         W(T1, x2, 99)\n\
         end(T1)\n\
         begin(T2)\n\
         R(T2, x2)\n",
    );
    assert_eq!(lines[3], "W(T1, x2, 99) -> sites: 1 2 3 4 5 6 7 8 9 10");
    assert_eq!(lines[4], "T1 commits");
    assert_eq!(lines[6], "x2: 99");
    let site = d.coordinator().site(SiteId(3)).expect("site 3 exists");
    assert!(site.is_replica_readable(VarId(2)));
    assert_eq!(site.read(VarId(2), Time(5)).map(|v| v.value), Some(99));
    // Only the written variable's gate reopened.
    assert!(!site.is_replica_readable(VarId(4)));
}

#[test]
fn write_skew_is_a_dangerous_structure() {
    let (d, lines) = dispatch_script(
        "begin(T1)\n\
         begin(T2)\n\
         R(T1, x2)\n\
         R(T2, x4)\n\
         W(T1, x4, 1)\n\
         W(T2, x2, 2)\n\
         end(T1)\n\
         end(T2)\n",
    );
    assert_eq!(lines[6], "T1 commits");
    assert_eq!(lines[7], "T2 aborts (RW-cycle)");
    // The edges computed while validating T2 were provisional: the abort
    // left T1's committed record without the tentative T1 -> T2 edge.
    let t1 = d
        .coordinator()
        .committed_txns()
        .iter()
        .find(|t| t.id.0 == "T1")
        .expect("T1 committed");
    assert!(t1.out_rw.is_empty());
    assert!(t1.in_rw.iter().any(|id| id.0 == "T2"));
}

#[test]
fn serial_read_modify_writes_are_not_dangerous() {
    // T2's write of x2 after T1's committed read-modify-write is a plain
    // serial history; the validator must not mistake the stale
    // anti-dependency for a cycle.
    let lines = run_script(
        "begin(T1)\n\
         R(T1, x2)\n\
         W(T1, x2, 21)\n\
         end(T1)\n\
         begin(T2)\n\
         W(T2, x2, 22)\n\
         end(T2)\n",
    );
    assert_eq!(lines[3], "T1 commits");
    assert_eq!(lines[6], "T2 commits");
}

#[test]
fn no_valid_snapshot_aborts_reader() {
    let script: String = (1..=10)
        .map(|s| format!("fail({})\n", s))
        .chain(std::iter::once("begin(T1)\nR(T1, x2)\n".to_string()))
        .collect();
    let lines = run_script(&script);
    assert_eq!(lines[10], "Transaction T1 begins at time 11");
    // Every copy was already down when T1 started, so no recovery can
    // ever yield a snapshot for it.
    assert_eq!(lines[11], "T1 aborts (No valid snapshot for x2)");
}

#[test]
fn reader_waits_for_any_copy_that_was_up_at_start() {
    let mut script = String::from("begin(T1)\n");
    for s in 1..=10 {
        script.push_str(&format!("fail({})\n", s));
    }
    script.push_str("R(T1, x2)\nrecover(5)\nend(T1)\n");
    let lines = run_script(&script);
    assert_eq!(lines[11], "Transaction T1 waits (no valid site)");
    assert_eq!(lines[12], "Site 5 recovers");
    // Site 5 was up continuously from the initial version through T1's
    // start, so its old snapshot is trustworthy despite the closed gate.
    assert_eq!(lines[13], "Retry: T1");
    assert_eq!(lines[14], "x2: 20");
    assert_eq!(lines[15], "T1 commits");
}

#[test]
fn operations_on_a_waiting_transaction_do_nothing() {
    let (d, lines) = dispatch_script(
        "fail(2)\n\
         begin(T1)\n\
         R(T1, x1)\n\
         R(T1, x2)\n\
         W(T1, x2, 9)\n",
    );
    assert_eq!(lines[2], "Transaction T1 waits (site 2 down)");
    assert_eq!(lines[3], "Transaction T1 is waiting");
    assert_eq!(lines[4], "Transaction T1 is waiting");
    // The ignored operations still ticked the clock and left no trace on
    // the transaction.
    assert_eq!(d.coordinator().now(), Time(5));
    let t1 = d.coordinator().active_txn("T1").expect("T1 active");
    assert!(t1.write_set.is_empty());
    assert!(t1.read_set.is_empty());
}

#[test]
fn read_your_own_write_sees_the_latest_value() {
    let lines = run_script(
        "begin(T1)\n\
         W(T1, x2, 1)\n\
         W(T1, x2, 2)\n\
         R(T1, x2)\n",
    );
    assert_eq!(lines[3], "x2: 2 (RYOW)");
}

#[test]
fn down_sites_still_dump_committed_state() {
    let lines = run_script("fail(4)\ndump()\n");
    assert_eq!(lines[0], "Site 4 fails");
    assert_eq!(
        lines[6],
        "site 4 - x2: 20, x3: 30, x4: 40, x6: 60, x8: 80, x10: 100, \
         x12: 120, x13: 130, x14: 140, x16: 160, x18: 180, x20: 200"
    );
}

#[test]
fn unknown_and_duplicate_transactions_are_diagnosed() {
    let lines = run_script(
        "R(TX, x2)\n\
         begin(T1)\n\
         begin(T1)\n\
         end(TZ)\n",
    );
    assert_eq!(lines[0], "Error: Transaction TX not found");
    assert_eq!(lines[1], "Transaction T1 begins at time 2");
    assert_eq!(lines[2], "Error: Transaction T1 already exists");
    assert_eq!(lines[3], "Error: Transaction TZ not found");
}

#[test]
fn read_provenance_is_recorded() {
    let (d, _) = dispatch_script("begin(T1)\nR(T1, x3)\nR(T1, x2)\n");
    let t1 = d.coordinator().active_txn("T1").expect("T1 active");

    let r3 = &t1.read_set[&VarId(3)];
    assert_eq!(r3.site, SiteId(4));
    assert_eq!(r3.value, 30);
    assert_eq!(r3.version_ts, Time(0));
    assert_eq!(r3.writer, Writer::Initial);
    assert!(t1.critical_read_sites.contains(&SiteId(4)));
    assert_eq!(t1.first_access[&SiteId(4)], Time(2));

    // The replicated read is served by the smallest valid site and is not
    // critical: any other copy could serve the same history.
    let r2 = &t1.read_set[&VarId(2)];
    assert_eq!(r2.site, SiteId(1));
    assert!(!t1.critical_read_sites.contains(&SiteId(1)));
}

#[test]
fn committed_transactions_have_distinct_increasing_times() {
    let (d, _) = dispatch_script(
        "begin(T1)\n\
         W(T1, x2, 1)\n\
         end(T1)\n\
         begin(T2)\n\
         W(T2, x4, 2)\n\
         end(T2)\n\
         begin(T3)\n\
         R(T3, x2)\n\
         end(T3)\n",
    );
    let committed = d.coordinator().committed_txns();
    assert_eq!(committed.len(), 3);
    let mut seen = Vec::new();
    for t in committed {
        assert_eq!(t.status, TxnStatus::Committed);
        let commit_ts = t.commit_ts.expect("committed txn has a commit time");
        assert!(t.start_ts < commit_ts);
        assert!(!seen.contains(&commit_ts));
        seen.push(commit_ts);
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn version_chains_start_at_time_zero_and_increase() {
    let (d, _) = dispatch_script(
        "begin(T1)\n\
         W(T1, x2, 1)\n\
         end(T1)\n\
         begin(T2)\n\
         W(T2, x2, 2)\n\
         end(T2)\n",
    );
    let site = d.coordinator().site(SiteId(1)).expect("site 1 exists");
    let v0 = site.latest_at_or_before(VarId(2), Time(0)).expect("initial");
    assert_eq!((v0.value, v0.commit_ts, v0.writer.clone()), (20, Time(0), Writer::Initial));
    let v1 = site.latest_at_or_before(VarId(2), Time(3)).expect("first commit");
    let v2 = site.latest_at_or_before(VarId(2), Time(6)).expect("second commit");
    assert_eq!(v1.value, 1);
    assert_eq!(v2.value, 2);
    assert!(v0.commit_ts < v1.commit_ts && v1.commit_ts < v2.commit_ts);
}

#[test]
fn ending_a_waiting_transaction_validates_it() {
    // end on a waiting transaction goes straight to the validator; with no
    // writes and no critical reads there is nothing to fail it.
    let lines = run_script(
        "fail(2)\n\
         begin(T1)\n\
         R(T1, x1)\n\
         end(T1)\n",
    );
    assert_eq!(lines[2], "Transaction T1 waits (site 2 down)");
    assert_eq!(lines[3], "T1 commits");
}

#[test]
fn writes_with_every_copy_down_apply_nowhere() {
    // x3's only site is down: the write is recorded but lands on no site.
    // With no write sites there is nothing for validation to check, and
    // the empty commit installs no versions anywhere.
    let lines = run_script(
        "fail(4)\n\
         begin(T1)\n\
         W(T1, x3, 7)\n\
         end(T1)\n\
         dump()\n",
    );
    assert_eq!(lines[2], "W(T1, x3, 7) -> sites:");
    assert_eq!(lines[3], "T1 commits");
    // Site 4 never saw the write; its committed x3 is untouched.
    assert!(lines[9].contains("x3: 30"));
}

//! Table State (C3): per-table tracking of which object owns which flows,
//! and the diffing algorithm that turns a desired flow list into the
//! minimal set of edits against what is currently installed.
//!
//! Each table holds a `Map<objectId, FlowEntryList>` plus a secondary index
//! `Map<(priority, match), objectId>` used purely to detect two distinct
//! owners installing an equal `(priority, match)` flow — a programming
//! error elsewhere in the agent. The policy for that case is to log and
//! keep the first writer; the second writer's flow is dropped from the
//! diff entirely.

use std::collections::HashMap;

use log::warn;

use crate::flow::{FlowEdit, FlowEntry, Match};
use crate::types::TableId;

/// Opaque ownership key: whichever render pass installed a set of flows
/// owns them, and deleting the key sweeps everything it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConflictKey {
    priority: u16,
    match_key: Match,
}

/// Tracks the flows owned by each object in a single OpenFlow table.
#[derive(Debug, Default)]
pub struct TableState {
    owned: HashMap<ObjectKey, Vec<FlowEntry>>,
    conflict_index: HashMap<ConflictKey, ObjectKey>,
}

impl TableState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the flows currently recorded as owned by `obj`.
    pub fn owned_by(&self, obj: ObjectKey) -> &[FlowEntry] {
        self.owned.get(&obj).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All flows owned by any object in this table.
    pub fn all_flows(&self) -> impl Iterator<Item = &FlowEntry> {
        self.owned.values().flatten()
    }

    fn conflict_key(entry: &FlowEntry) -> ConflictKey {
        ConflictKey {
            priority: entry.priority,
            match_key: entry.match_.clone(),
        }
    }

    /// Computes the edits needed to move `obj`'s owned flows from whatever
    /// they currently are to `new_list`, and records the new ownership.
    ///
    /// Algorithm (matches the render pipeline's diff contract): for each
    /// entry in `new_list`, an equal `(priority, match)` entry already
    /// owned by `obj` with different cookie/instructions emits a MOD;
    /// one absent from `obj`'s current set emits an ADD; an identical one
    /// is a no-op. Any entry `obj` used to own but is no longer present
    /// in `new_list` emits a DEL. Ordering between ADD/MOD/DEL is not
    /// significant.
    pub fn diff_entry(&mut self, obj: ObjectKey, new_list: Vec<FlowEntry>) -> Vec<FlowEdit> {
        let cur = self.owned.remove(&obj).unwrap_or_default();
        let mut diffs = Vec::new();

        for old in &cur {
            let key = Self::conflict_key(old);
            if self.conflict_index.get(&key) == Some(&obj) {
                self.conflict_index.remove(&key);
            }
        }

        let mut remaining: Vec<Option<FlowEntry>> = cur.into_iter().map(Some).collect();

        for new in &new_list {
            let key = Self::conflict_key(new);

            if let Some(owner) = self.conflict_index.get(&key) {
                if *owner != obj {
                    warn!(
                        "flow conflict in {}: priority={} already owned by a different object, keeping first writer",
                        new.table, new.priority
                    );
                    continue;
                }
            }

            let existing_slot = remaining.iter_mut().find(|slot| {
                slot.as_ref()
                    .map(|e| e.priority == new.priority && e.match_ == new.match_)
                    .unwrap_or(false)
            });

            match existing_slot {
                Some(slot) => {
                    let old = slot.take().unwrap();
                    if old.cookie != new.cookie || old.instructions != new.instructions {
                        diffs.push(FlowEdit::Mod(new.clone()));
                    }
                }
                None => {
                    diffs.push(FlowEdit::Add(new.clone()));
                }
            }

            self.conflict_index.insert(key, obj);
        }

        for leftover in remaining.into_iter().flatten() {
            let key = Self::conflict_key(&leftover);
            if self.conflict_index.get(&key) == Some(&obj) {
                self.conflict_index.remove(&key);
            }
            diffs.push(FlowEdit::Del(leftover));
        }

        if !new_list.is_empty() {
            self.owned.insert(obj, new_list);
        }

        diffs
    }

    /// Removes `obj` entirely, sweeping every flow it owned. Equivalent to
    /// `diff_entry(obj, vec![])`.
    pub fn remove_object(&mut self, obj: ObjectKey) -> Vec<FlowEdit> {
        self.diff_entry(obj, Vec::new())
    }

    /// Diffs the union of everything currently tracked against a freshly
    /// read-back snapshot from the switch (used during reconnect resync).
    /// Ownership in `self` is left untouched; this only computes the
    /// wire-level edits needed to bring the switch's table in line with
    /// what this process believes should be there.
    pub fn diff_snapshot(&self, wire_flows: &[FlowEntry]) -> Vec<FlowEdit> {
        let mut desired: HashMap<(u16, &Match), &FlowEntry> = HashMap::new();
        for entry in self.all_flows() {
            desired.insert((entry.priority, &entry.match_), entry);
        }

        let mut seen_on_wire: HashMap<(u16, &Match), &FlowEntry> = HashMap::new();
        let mut diffs = Vec::new();

        for wire in wire_flows {
            let key = (wire.priority, &wire.match_);
            seen_on_wire.insert(key, wire);
            match desired.get(&key) {
                Some(want) if want.cookie != wire.cookie || want.instructions != wire.instructions => {
                    diffs.push(FlowEdit::Mod((*want).clone()));
                }
                Some(_) => {}
                None => diffs.push(FlowEdit::Del(wire.clone())),
            }
        }

        for (key, want) in &desired {
            if !seen_on_wire.contains_key(key) {
                diffs.push(FlowEdit::Add((*want).clone()));
            }
        }

        diffs
    }
}

/// A `TableState` per OpenFlow table, indexed by table id.
#[derive(Debug, Default)]
pub struct TableStateSet {
    tables: HashMap<TableId, TableState>,
}

impl TableStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_mut(&mut self, table: TableId) -> &mut TableState {
        self.tables.entry(table).or_default()
    }

    pub fn table(&self, table: TableId) -> Option<&TableState> {
        self.tables.get(&table)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&TableId, &TableState)> {
        self.tables.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Action;
    use crate::types::{Cookie, PortNo};
    use pretty_assertions::assert_eq;

    fn flow(table: u8, priority: u16, vlan: u16, port: u32, cookie: u64) -> FlowEntry {
        FlowEntry {
            table: TableId(table),
            priority,
            cookie: Cookie(cookie),
            match_: Match::builder().vlan_id(vlan).build(),
            instructions: vec![Action::Output(PortNo(port))],
        }
    }

    #[test]
    fn test_diff_entry_add_on_first_write() {
        let mut ts = TableState::new();
        let edits = ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        assert_eq!(edits.len(), 1);
        assert!(matches!(edits[0], FlowEdit::Add(_)));
    }

    #[test]
    fn test_diff_entry_no_op_when_unchanged() {
        let mut ts = TableState::new();
        ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        let edits = ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        assert!(edits.is_empty());
    }

    #[test]
    fn test_diff_entry_mod_on_cookie_change() {
        let mut ts = TableState::new();
        ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        let edits = ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 2)]);
        assert_eq!(edits.len(), 1);
        assert!(matches!(edits[0], FlowEdit::Mod(_)));
    }

    #[test]
    fn test_diff_entry_del_on_removal() {
        let mut ts = TableState::new();
        ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        let edits = ts.diff_entry(ObjectKey(1), vec![]);
        assert_eq!(edits.len(), 1);
        assert!(matches!(edits[0], FlowEdit::Del(_)));
    }

    #[test]
    fn test_conflict_keeps_first_writer() {
        let mut ts = TableState::new();
        let edits_a = ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        assert_eq!(edits_a.len(), 1);

        let edits_b = ts.diff_entry(ObjectKey(2), vec![flow(0, 10, 100, 1, 1)]);
        assert!(edits_b.is_empty(), "second writer's equal flow should be dropped");
    }

    #[test]
    fn test_remove_object_sweeps_all_owned_flows() {
        let mut ts = TableState::new();
        ts.diff_entry(
            ObjectKey(1),
            vec![flow(0, 10, 100, 1, 1), flow(0, 20, 200, 2, 1)],
        );
        let edits = ts.remove_object(ObjectKey(1));
        assert_eq!(edits.len(), 2);
        assert!(edits.iter().all(|e| matches!(e, FlowEdit::Del(_))));
    }

    #[test]
    fn test_diff_snapshot_reconciles_missing_and_extra() {
        let mut ts = TableState::new();
        ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);

        // Wire has a stale extra flow and is missing the desired one.
        let wire = vec![flow(0, 30, 300, 3, 9)];
        let diffs = ts.diff_snapshot(&wire);

        assert!(diffs.iter().any(|e| matches!(e, FlowEdit::Add(f) if f.priority == 10)));
        assert!(diffs.iter().any(|e| matches!(e, FlowEdit::Del(f) if f.priority == 30)));
    }

    #[test]
    fn test_diff_snapshot_no_op_when_matching() {
        let mut ts = TableState::new();
        ts.diff_entry(ObjectKey(1), vec![flow(0, 10, 100, 1, 1)]);
        let wire = vec![flow(0, 10, 100, 1, 1)];
        assert!(ts.diff_snapshot(&wire).is_empty());
    }
}

//! ID Generator (C1): namespace-scoped string-to-u32 assignment with
//! on-disk persistence, deferred erasure, and garbage collection.
//!
//! Each namespace (e.g. `"globalVrf"`, `"floodDomain"`) gets its own
//! persisted file `<dir>/<namespace>.id`, a line-oriented text file of
//! `"<id> <string>"` pairs. IDs are assigned monotonically from 100
//! upward and never reused for a different string while that string's
//! erasure is still within the pending-erase grace period.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

const FIRST_ID: u32 = 100;
/// Sentinel returned by `get_id` when a namespace's ID space is exhausted.
pub const ID_EXHAUSTED: u32 = u32::MAX;
/// Reserved ID returned for an empty string, per spec.
pub const EMPTY_STRING_ID: u32 = 0;

#[derive(Debug, Error)]
pub enum IdGenError {
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),
}

pub type IdGenResult<T> = Result<T, IdGenError>;

struct PendingErase {
    id: u32,
    erased_at: Instant,
}

#[derive(Default)]
struct Namespace {
    by_string: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
    last_used: u32,
    pending_erase: HashMap<String, PendingErase>,
}

impl Namespace {
    fn fresh() -> Self {
        Self {
            last_used: FIRST_ID - 1,
            ..Default::default()
        }
    }
}

/// Namespace-scoped ID allocator, persisted under a single directory.
pub struct IdGenerator {
    dir: PathBuf,
    cleanup_interval: Duration,
    namespaces: HashMap<String, Namespace>,
}

impl IdGenerator {
    /// Creates a generator rooted at `dir`. No namespaces are loaded yet;
    /// call [`init`](Self::init) for each namespace you intend to use, or
    /// rely on [`get_id`](Self::get_id)'s lazy auto-init.
    pub fn new(dir: impl Into<PathBuf>, cleanup_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            cleanup_interval,
            namespaces: HashMap::new(),
        }
    }

    fn file_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.id"))
    }

    /// Loads persisted assignments from `<dir>/<namespace>.id`. A missing
    /// file is not an error: the namespace simply starts empty.
    pub fn init(&mut self, namespace: &str) {
        let mut ns = Namespace::fresh();
        let path = self.file_path(namespace);

        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let Some((id_str, s)) = line.split_once(' ') else {
                        log::warn!("idgen: skipping malformed line in {path:?}: {line:?}");
                        continue;
                    };
                    let Ok(id) = id_str.parse::<u32>() else {
                        log::warn!("idgen: skipping malformed id in {path:?}: {line:?}");
                        continue;
                    };
                    ns.by_string.insert(s.to_string(), id);
                    ns.by_id.insert(id, s.to_string());
                    ns.last_used = ns.last_used.max(id);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::error!("idgen: failed to read {path:?}: {e}");
            }
        }

        self.namespaces.insert(namespace.to_string(), ns);
    }

    fn ensure_namespace(&mut self, namespace: &str) -> &mut Namespace {
        if !self.namespaces.contains_key(namespace) {
            self.init(namespace);
        }
        self.namespaces.get_mut(namespace).expect("just inserted")
    }

    fn persist(&self, namespace: &str, ns: &Namespace) {
        let path = self.file_path(namespace);
        let mut buf = String::new();
        for (id, s) in &ns.by_id {
            buf.push_str(&format!("{id} {s}\n"));
        }
        if let Err(e) = fs::File::create(&path).and_then(|mut f| f.write_all(buf.as_bytes())) {
            log::error!("idgen: failed to persist {path:?}: {e} (keeping in-memory assignment)");
        }
    }

    /// Returns the existing ID for `s`, allocating one if absent. Returns
    /// `0` for an empty string and [`ID_EXHAUSTED`] if the namespace's ID
    /// space is exhausted.
    pub fn get_id(&mut self, namespace: &str, s: &str) -> u32 {
        if s.is_empty() {
            return EMPTY_STRING_ID;
        }

        self.ensure_namespace(namespace);
        let ns = self.namespaces.get_mut(namespace).expect("just ensured");

        if let Some(&id) = ns.by_string.get(s) {
            return id;
        }

        if ns.last_used == ID_EXHAUSTED {
            return ID_EXHAUSTED;
        }

        let mut candidate = ns.last_used.wrapping_add(1);
        while ns
            .pending_erase
            .values()
            .any(|pending| pending.id == candidate)
        {
            if candidate == ID_EXHAUSTED {
                return ID_EXHAUSTED;
            }
            candidate += 1;
        }

        ns.last_used = candidate;
        ns.by_string.insert(s.to_string(), candidate);
        ns.by_id.insert(candidate, s.to_string());

        self.persist(namespace, ns);
        candidate
    }

    /// Moves `s`'s assignment into pending-erase with the current
    /// timestamp. A no-op if `s` has no assignment in `namespace`.
    pub fn erase(&mut self, namespace: &str, s: &str) {
        let Some(ns) = self.namespaces.get_mut(namespace) else {
            return;
        };
        let Some(id) = ns.by_string.remove(s) else {
            return;
        };
        ns.by_id.remove(&id);
        ns.pending_erase.insert(
            s.to_string(),
            PendingErase {
                id,
                erased_at: Instant::now(),
            },
        );
        self.persist(namespace, ns);
    }

    /// Drops pending-erase entries older than `cleanup_interval`,
    /// permanently freeing their IDs for reuse.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let interval = self.cleanup_interval;
        for ns in self.namespaces.values_mut() {
            ns.pending_erase
                .retain(|_, pending| now.duration_since(pending.erased_at) < interval);
        }
    }

    /// Iterates every allocated assignment in `namespace`, calling `cb` for
    /// each string. Assignments for which `cb` returns `false` are erased.
    pub fn collect_garbage(&mut self, namespace: &str, mut cb: impl FnMut(&str, &str) -> bool) {
        let Some(ns) = self.namespaces.get(namespace) else {
            return;
        };
        let strings: Vec<String> = ns.by_string.keys().cloned().collect();
        for s in strings {
            if !cb(namespace, &s) {
                self.erase(namespace, &s);
            }
        }
    }

    /// Directory this generator persists namespace files under.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Like [`get_id`](Self::get_id), but constrains first-allocation to
    /// `[start, end]` instead of the default `FIRST_ID..`. Used by the
    /// conntrack-zone manager, whose zone numbers must stay inside a
    /// configured range rather than the global id space. Returns `None`
    /// once the range is exhausted.
    pub fn get_id_in_range(&mut self, namespace: &str, s: &str, start: u32, end: u32) -> Option<u32> {
        if s.is_empty() {
            return Some(EMPTY_STRING_ID);
        }

        if !self.namespaces.contains_key(namespace) {
            self.init(namespace);
            if let Some(ns) = self.namespaces.get_mut(namespace) {
                if ns.by_id.is_empty() {
                    ns.last_used = start.saturating_sub(1);
                }
            }
        }
        let ns = self.namespaces.get_mut(namespace).expect("just ensured");

        if let Some(&id) = ns.by_string.get(s) {
            return Some(id);
        }

        let mut candidate = ns.last_used.wrapping_add(1).max(start);
        while ns.pending_erase.values().any(|pending| pending.id == candidate) {
            candidate += 1;
        }
        if candidate > end {
            return None;
        }

        ns.last_used = candidate;
        ns.by_string.insert(s.to_string(), candidate);
        ns.by_id.insert(candidate, s.to_string());
        self.persist(namespace, ns);
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_get_id_empty_string() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        assert_eq!(gen.get_id("vrf", ""), EMPTY_STRING_ID);
    }

    #[test]
    fn test_get_id_allocates_from_100() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        assert_eq!(gen.get_id("vrf", "red"), 100);
        assert_eq!(gen.get_id("vrf", "blue"), 101);
        assert_eq!(gen.get_id("vrf", "red"), 100);
    }

    #[test]
    fn test_get_id_separate_namespaces() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        assert_eq!(gen.get_id("vrf", "red"), 100);
        assert_eq!(gen.get_id("bd", "red"), 100);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        {
            let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
            gen.get_id("vrf", "red");
            gen.get_id("vrf", "blue");
        }
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        gen.init("vrf");
        assert_eq!(gen.get_id("vrf", "red"), 100);
        assert_eq!(gen.get_id("vrf", "blue"), 101);
        assert_eq!(gen.get_id("vrf", "green"), 102);
    }

    #[test]
    fn test_erase_moves_to_pending_and_reserves_id() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        gen.get_id("vrf", "red");
        gen.erase("vrf", "red");

        // "red" is gone, but its id (100) must not be handed to "blue"
        // while still within the pending-erase grace period.
        assert_eq!(gen.get_id("vrf", "blue"), 101);
    }

    #[test]
    fn test_cleanup_frees_pending_erase_after_interval() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_millis(1));
        gen.get_id("vrf", "red");
        gen.erase("vrf", "red");

        std::thread::sleep(Duration::from_millis(5));
        gen.cleanup();

        let ns = gen.namespaces.get("vrf").unwrap();
        assert!(ns.pending_erase.is_empty());
    }

    #[test]
    fn test_get_id_in_range_respects_bounds() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        assert_eq!(gen.get_id_in_range("conntrack", "rd0", 1000, 1001), Some(1000));
        assert_eq!(gen.get_id_in_range("conntrack", "rd1", 1000, 1001), Some(1001));
        assert_eq!(gen.get_id_in_range("conntrack", "rd2", 1000, 1001), None);
        assert_eq!(gen.get_id_in_range("conntrack", "rd0", 1000, 1001), Some(1000));
    }

    #[test]
    fn test_collect_garbage_erases_when_callback_false() {
        let dir = tempdir().unwrap();
        let mut gen = IdGenerator::new(dir.path(), Duration::from_secs(300));
        gen.get_id("vrf", "red");
        gen.get_id("vrf", "blue");

        gen.collect_garbage("vrf", |_ns, s| s != "red");

        let ns = gen.namespaces.get("vrf").unwrap();
        assert!(!ns.by_string.contains_key("red"));
        assert!(ns.by_string.contains_key("blue"));
    }
}

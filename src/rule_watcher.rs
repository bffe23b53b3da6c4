//! Rule file watcher
//! Reconciles the rule store whenever a rule file changes and consumes the
//! temp rules drop file when it shows up.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::rules::RuleStore;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Last seen modification time of each watched file, `None` while missing.
#[derive(Debug, Default)]
pub struct Mtimes {
    seen: HashMap<PathBuf, Option<SystemTime>>,
}

impl Mtimes {
    /// Record the current mtimes of `paths`; true if any differs from last time.
    pub fn refresh(&mut self, paths: &[PathBuf]) -> bool {
        let mut changed = false;
        for path in paths {
            let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
            if self.seen.insert(path.clone(), mtime) != Some(mtime) {
                changed = true;
            }
        }
        changed
    }

    /// Forget everything seen so the next refresh reports a change.
    pub fn invalidate(&mut self) {
        self.seen.clear();
    }
}

pub struct RuleWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<()>,
    files: Vec<PathBuf>,
    temp: Option<PathBuf>,
}

impl RuleWatcher {
    /// Watch the parent directories of every rule file and of `temp`, so
    /// editors that replace files on save are noticed too.
    pub fn new(files: Vec<PathBuf>, temp: Option<PathBuf>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let names: HashSet<OsString> = files
            .iter()
            .chain(temp.iter())
            .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
            .collect();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().is_some_and(|n| names.contains(n)));
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                );
                if ours && relevant {
                    debug!("Rule file event {:?} on {:?}", event.kind, event.paths);
                    let _ = tx.send(());
                }
            }
            Err(e) => error!("Rule watcher error: {}", e),
        })
        .context("failed to create rule watcher")?;

        let dirs: HashSet<&Path> = files
            .iter()
            .chain(temp.iter())
            .map(|p| p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new(".")))
            .collect();
        for dir in dirs {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => info!("Watching rules in {}", dir.display()),
                // Falls back to mtime polling for this directory
                Err(e) => warn!("Failed to watch {}: {}", dir.display(), e),
            }
        }

        Ok(Self {
            _watcher: watcher,
            events: rx,
            files,
            temp,
        })
    }

    /// One pass: reconcile if any rule file changed, then apply pending temp rules.
    pub fn sync(&self, rules: &RuleStore, mtimes: &mut Mtimes) {
        if mtimes.refresh(&self.files) {
            info!("Rule files changed, reloading");
            match rules.reconcile() {
                Ok(n) => debug!("Reload applied {} rule changes", n),
                Err(e) => {
                    error!("Failed to reload rules, retrying: {:#}", e);
                    mtimes.invalidate();
                }
            }
        }

        if let Some(temp) = &self.temp {
            match rules.apply_temp_rules(temp) {
                Ok(0) => {}
                Ok(n) => info!("Applied {} temp rules from {}", n, temp.display()),
                Err(e) => error!("Failed to apply temp rules: {:#}", e),
            }
        }
    }

    /// Sync on every file event, and at least once a second.
    pub fn run(&self, rules: &RuleStore) -> Result<()> {
        let mut mtimes = Mtimes::default();
        mtimes.refresh(&self.files);
        loop {
            let _ = self.events.recv_timeout(POLL_INTERVAL);
            while self.events.try_recv().is_ok() {}
            self.sync(rules, &mut mtimes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Action, Port, RuleKey, RuleProto, Side, Transport};
    use std::thread;

    fn key(dst: &str, port: Port) -> RuleKey {
        RuleKey::new(dst, port, RuleProto::new(Transport::Tcp, Side::Destination))
    }

    /// Rewrite `path` and make sure its mtime moves even on coarse clocks.
    fn rewrite(path: &Path, content: &str) {
        let before = fs::metadata(path).and_then(|m| m.modified()).ok();
        loop {
            fs::write(path, content).unwrap();
            if fs::metadata(path).and_then(|m| m.modified()).ok() != before {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn mtimes_notice_changes_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        let paths = vec![path.clone()];
        let mut mtimes = Mtimes::default();

        assert!(mtimes.refresh(&paths));
        assert!(!mtimes.refresh(&paths));

        fs::write(&path, "").unwrap();
        assert!(mtimes.refresh(&paths));
        rewrite(&path, "allow a.com 80 tcp\n");
        assert!(mtimes.refresh(&paths));

        fs::remove_file(&path).unwrap();
        assert!(mtimes.refresh(&paths));
        assert!(!mtimes.refresh(&paths));
    }

    #[test]
    fn edits_are_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        fs::write(&path, "allow a.com 80 tcp\n").unwrap();
        let rules = RuleStore::new(path.clone(), Vec::new());
        rules.reconcile().unwrap();

        let watcher = RuleWatcher::new(rules.files(), None).unwrap();
        let mut mtimes = Mtimes::default();
        mtimes.refresh(&watcher.files);

        rewrite(&path, "deny b.com * tcp\n");
        watcher.sync(&rules, &mut mtimes);

        assert_eq!(rules.get(&key("a.com", Port::Num(80))), None);
        assert_eq!(rules.get(&key("b.com", Port::Any)).map(|v| v.action), Some(Action::Deny));
    }

    #[test]
    fn failed_reload_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        fs::write(&path, "").unwrap();
        let rules = RuleStore::new(path.clone(), Vec::new());
        rules.reconcile().unwrap();

        let watcher = RuleWatcher::new(rules.files(), None).unwrap();
        let mut mtimes = Mtimes::default();
        mtimes.refresh(&watcher.files);

        rewrite(&path, "allow a.com 80 tcp\n");
        fs::write(&path, b"allow a.com 80 tcp\n\xff\n").unwrap();
        let broken = fs::metadata(&path).unwrap().modified().unwrap();
        watcher.sync(&rules, &mut mtimes);
        assert!(rules.is_empty());

        // Fixed in place without the mtime moving
        fs::write(&path, "allow a.com 80 tcp\n").unwrap();
        fs::File::options().write(true).open(&path).unwrap().set_modified(broken).unwrap();
        watcher.sync(&rules, &mut mtimes);

        assert_eq!(rules.get(&key("a.com", Port::Num(80))).map(|v| v.action), Some(Action::Allow));
    }

    #[test]
    fn temp_rules_are_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        let temp = dir.path().join("rules.temp");
        fs::write(&path, "").unwrap();
        let rules = RuleStore::new(path, Vec::new());
        rules.reconcile().unwrap();

        let watcher = RuleWatcher::new(rules.files(), Some(temp.clone())).unwrap();
        let mut mtimes = Mtimes::default();
        mtimes.refresh(&watcher.files);
        watcher.sync(&rules, &mut mtimes);
        assert!(rules.is_empty());

        fs::write(&temp, "30-minute allow c.com 443 tcp\n").unwrap();
        watcher.sync(&rules, &mut mtimes);

        assert!(!temp.exists());
        assert_eq!(rules.get(&key("c.com", Port::Num(443))).map(|v| v.action), Some(Action::Allow));
    }
}

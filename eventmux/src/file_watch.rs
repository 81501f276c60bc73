// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File change notifications over a single inotify descriptor.
//!
//! Watches are keyed by OS watch id. Adding a subscription for an already
//! watched path merges into the existing watch: the event masks are OR'ed
//! and the pattern sets are united (any `*` pattern empties the set,
//! meaning match-all). The OS watch is replaced atomically as far as the
//! API allows; a short loss window exists between remove and re-add.
//!
//! Basename glob patterns select which filenames inside a watched
//! directory produce events. A path whose last segment contains glob
//! metacharacters is split into (directory, pattern).

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// High-level event selectors.
pub const EVENT_ATTRIBUTES: u32 = 0x0001;
pub const EVENT_READ: u32 = 0x0002;
pub const EVENT_WRITE: u32 = 0x0004;
pub const EVENT_CREATED: u32 = 0x0008;
pub const EVENT_DELETED: u32 = 0x0010;
pub const EVENT_ACCESS: u32 = 0x0020;
pub const EVENT_UPDATED: u32 = 0x0040;

/// Output-only flags.
pub const EVENT_DIRECTORY: u32 = 0x0100;
pub const EVENT_GONE: u32 = 0x0200;
pub const EVENT_UNMOUNTED: u32 = 0x0400;
pub const EVENT_LOST_SYNC: u32 = 0x0800;
pub const EVENT_ERROR: u32 = 0x1000;

/// One reported file change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    watched_path: PathBuf,
    events: u32,
    filename: String,
}

impl FileEvent {
    fn new(watched_path: impl Into<PathBuf>, events: u32, filename: impl Into<String>) -> Self {
        Self {
            watched_path: watched_path.into(),
            events,
            filename: filename.into(),
        }
    }

    pub fn watched_path(&self) -> &Path {
        &self.watched_path
    }

    pub fn events(&self) -> u32 {
        self.events
    }

    /// Name of the file inside the watched directory, when the kernel
    /// provides one.
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

fn events_to_mask(events: u32) -> Result<AddWatchFlags> {
    let mut mask = AddWatchFlags::empty();
    if events & EVENT_ATTRIBUTES != 0 {
        mask |= AddWatchFlags::IN_ATTRIB;
    }
    if events & EVENT_READ != 0 {
        mask |= AddWatchFlags::IN_ACCESS;
    }
    if events & EVENT_WRITE != 0 {
        mask |= AddWatchFlags::IN_MODIFY;
    }
    if events & EVENT_CREATED != 0 {
        mask |= AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_MOVE_SELF;
    }
    if events & EVENT_DELETED != 0 {
        mask |= AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_DELETE_SELF
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_MOVE_SELF;
    }
    if events & EVENT_ACCESS != 0 {
        mask |= AddWatchFlags::IN_OPEN | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_CLOSE_NOWRITE;
    }
    if events & EVENT_UPDATED != 0 {
        mask |= AddWatchFlags::IN_CLOSE_WRITE;
    }
    if mask.is_empty() {
        return Err(Error::InvalidParameter(
            "file watch events select no inotify flags".to_string(),
        ));
    }
    Ok(mask)
}

fn mask_to_events(mask: AddWatchFlags) -> u32 {
    let mut events = 0;
    if mask.contains(AddWatchFlags::IN_ATTRIB) {
        events |= EVENT_ATTRIBUTES;
    }
    if mask.contains(AddWatchFlags::IN_ACCESS) {
        events |= EVENT_READ;
    }
    if mask.contains(AddWatchFlags::IN_MODIFY) {
        events |= EVENT_WRITE;
    }
    if mask.intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_FROM) {
        events |= EVENT_CREATED;
    }
    if mask.intersects(
        AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVED_TO,
    ) {
        events |= EVENT_DELETED;
    }
    if mask.intersects(
        AddWatchFlags::IN_OPEN | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_CLOSE_NOWRITE,
    ) {
        events |= EVENT_ACCESS;
    }
    if mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
        events |= EVENT_UPDATED;
    }
    if mask.contains(AddWatchFlags::IN_ISDIR) {
        events |= EVENT_DIRECTORY;
    }
    if mask.contains(AddWatchFlags::IN_IGNORED) {
        events |= EVENT_GONE;
    }
    if mask.contains(AddWatchFlags::IN_UNMOUNT) {
        events |= EVENT_UNMOUNTED;
    }
    events
}

/// Split a path whose basename may be a glob pattern.
fn path_and_pattern(path: &Path) -> (PathBuf, String) {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if basename.contains(['*', '?', '[']) {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        (parent.to_path_buf(), basename)
    } else {
        (path.to_path_buf(), "*".to_string())
    }
}

struct Watch {
    watched_path: PathBuf,
    /// Empty set means match-all (a `*` subscription).
    patterns: BTreeSet<String>,
    events: u32,
    extra_flags: AddWatchFlags,
}

impl Watch {
    fn os_mask(&self) -> Result<AddWatchFlags> {
        Ok(events_to_mask(self.events)?
            | self.extra_flags
            | AddWatchFlags::from_bits_retain(libc::IN_EXCL_UNLINK))
    }

    fn match_patterns(&self, filename: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches_with(filename, options))
                .unwrap_or(false)
        })
    }
}

pub type FileEventCallback = Box<dyn FnMut(&mut Reactor, &FileEvent) -> Result<()>>;

/// The inotify-backed file watch connection.
///
/// Add at least one watch before attaching to the reactor: without any
/// watch the connection exposes no descriptor.
pub struct FileChangedConnection {
    state: ConnectionState,
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, Watch>,
    on_event: FileEventCallback,
}

impl FileChangedConnection {
    pub fn new(name: &str, on_event: FileEventCallback) -> Result<Rc<RefCell<Self>>> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| Error::Initialization(format!("inotify_init1() failed: {e}")))?;
        Ok(Rc::new(RefCell::new(Self {
            state: ConnectionState::new(name),
            inotify,
            watches: HashMap::new(),
            on_event,
        })))
    }

    /// Watch for file changes under `path` (which may end in a basename
    /// glob pattern).
    pub fn watch_files(&mut self, path: impl AsRef<Path>, events: u32) -> Result<()> {
        self.merge_watch(path.as_ref(), events, AddWatchFlags::empty())
    }

    /// Watch symbolic links themselves rather than their targets.
    pub fn watch_symlinks(&mut self, path: impl AsRef<Path>, events: u32) -> Result<()> {
        self.merge_watch(path.as_ref(), events, AddWatchFlags::IN_DONT_FOLLOW)
    }

    /// Watch a path that must be a directory.
    pub fn watch_directories(&mut self, path: impl AsRef<Path>, events: u32) -> Result<()> {
        self.merge_watch(path.as_ref(), events, AddWatchFlags::IN_ONLYDIR)
    }

    fn merge_watch(&mut self, path: &Path, events: u32, extra_flags: AddWatchFlags) -> Result<()> {
        if events == 0 {
            return Err(Error::InvalidParameter(
                "a file watch events parameter cannot be 0".to_string(),
            ));
        }
        let (watched_path, pattern) = path_and_pattern(path);

        let existing = self
            .watches
            .iter()
            .find(|(_, w)| w.watched_path == watched_path)
            .map(|(wd, _)| *wd);
        match existing {
            None => {
                let mut patterns = BTreeSet::new();
                if pattern != "*" {
                    patterns.insert(pattern);
                }
                let watch = Watch {
                    watched_path,
                    patterns,
                    events,
                    extra_flags,
                };
                let wd = self
                    .inotify
                    .add_watch(&watch.watched_path, watch.os_mask()?)
                    .map_err(|e| {
                        Error::Initialization(format!(
                            "inotify_add_watch() failed for \"{}\": {e}",
                            watch.watched_path.display()
                        ))
                    })?;
                self.watches.insert(wd, watch);
            }
            Some(old_wd) => {
                let Some(mut watch) = self.watches.remove(&old_wd) else {
                    return Ok(());
                };
                watch.events |= events;
                watch.extra_flags |= extra_flags;
                if !watch.patterns.is_empty() {
                    if pattern == "*" {
                        // everything matches from now on
                        watch.patterns.clear();
                    } else {
                        watch.patterns.insert(pattern);
                    }
                }
                // replace the OS watch; events in between are lost
                if let Err(e) = self.inotify.rm_watch(old_wd) {
                    tracing::warn!(
                        "inotify_rm_watch() failed for \"{}\": {e}",
                        watch.watched_path.display()
                    );
                }
                let wd = self
                    .inotify
                    .add_watch(&watch.watched_path, watch.os_mask()?)
                    .map_err(|e| {
                        Error::Initialization(format!(
                            "inotify_add_watch() failed for \"{}\": {e}",
                            watch.watched_path.display()
                        ))
                    })?;
                self.watches.insert(wd, watch);
            }
        }
        Ok(())
    }

    /// Stop watching `path`; a no-op when it is not watched.
    pub fn stop_watch(&mut self, path: impl AsRef<Path>) {
        let (watched_path, _pattern) = path_and_pattern(path.as_ref());
        let found = self
            .watches
            .iter()
            .find(|(_, w)| w.watched_path == watched_path)
            .map(|(wd, _)| *wd);
        if let Some(wd) = found {
            if let Err(e) = self.inotify.rm_watch(wd) {
                tracing::warn!(
                    "inotify_rm_watch() failed for \"{}\": {e}",
                    watched_path.display()
                );
            }
            self.watches.remove(&wd);
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    #[cfg(test)]
    fn watch_for_path(&self, path: &Path) -> Option<&Watch> {
        self.watches.values().find(|w| w.watched_path == path)
    }
}

impl Connection for FileChangedConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        // without watches, do not add the descriptor to the poll set
        if self.watches.is_empty() {
            return -1;
        }
        self.inotify.as_fd().as_raw_fd()
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(nix::Error::EAGAIN) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        "error reading inotify events on connection \"{}\": {e}",
                        self.state.name()
                    );
                    return self.process_error(reactor);
                }
            };
            for event in events {
                let filename = event
                    .name
                    .as_ref()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    tracing::error!("received an inotify event queue overflow");
                    let overflow = FileEvent::new("/", EVENT_LOST_SYNC, filename);
                    (self.on_event)(reactor, &overflow)?;
                    continue;
                }

                match self.watches.get(&event.wd) {
                    Some(watch) => {
                        if watch.match_patterns(&filename) {
                            let file_event = FileEvent::new(
                                watch.watched_path.clone(),
                                mask_to_events(event.mask),
                                filename,
                            );
                            (self.on_event)(reactor, &file_event)?;
                        }
                        // the kernel dropped the watch (deleted, unmounted)
                        if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                            self.watches.remove(&event.wd);
                        }
                    }
                    None => {
                        // watch we do not know; make sure the OS forgets it
                        let _ = self.inotify.rm_watch(event.wd);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_translation_round_trip() {
        let mask = events_to_mask(EVENT_CREATED | EVENT_DELETED).unwrap();
        assert!(mask.contains(AddWatchFlags::IN_CREATE));
        assert!(mask.contains(AddWatchFlags::IN_DELETE));
        let events = mask_to_events(mask);
        assert!(events & EVENT_CREATED != 0);
        assert!(events & EVENT_DELETED != 0);
        assert!(events_to_mask(0).is_err());
    }

    #[test]
    fn test_path_and_pattern_split() {
        let (path, pattern) = path_and_pattern(Path::new("/var/log/*.log"));
        assert_eq!(path, Path::new("/var/log"));
        assert_eq!(pattern, "*.log");

        let (path, pattern) = path_and_pattern(Path::new("/var/log"));
        assert_eq!(path, Path::new("/var/log"));
        assert_eq!(pattern, "*");
    }

    #[test]
    fn test_merge_unions_masks_and_clears_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let connection =
            FileChangedConnection::new("watch", Box::new(|_, _| Ok(()))).unwrap();
        let mut watcher = connection.borrow_mut();
        watcher
            .watch_files(dir.path().join("*.log"), EVENT_CREATED)
            .unwrap();
        watcher.watch_files(dir.path(), EVENT_DELETED).unwrap();
        assert_eq!(watcher.watch_count(), 1);

        let watch = watcher.watch_for_path(dir.path()).unwrap();
        assert_eq!(watch.events, EVENT_CREATED | EVENT_DELETED);
        // the "*" subscription emptied the pattern set: match-all
        assert!(watch.patterns.is_empty());
        assert!(watch.match_patterns("x.txt"));
    }

    #[test]
    fn test_pattern_matching() {
        let watch = Watch {
            watched_path: PathBuf::from("/tmp"),
            patterns: ["*.log".to_string()].into_iter().collect(),
            events: EVENT_CREATED,
            extra_flags: AddWatchFlags::empty(),
        };
        assert!(watch.match_patterns("a.log"));
        assert!(!watch.match_patterns("a.txt"));
        assert!(!watch.match_patterns("sub/a.log"));
    }

    #[test]
    fn test_created_file_fires_event() {
        let dir = tempfile::tempdir().unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = events.clone();
        let connection = FileChangedConnection::new(
            "watch",
            Box::new(move |reactor, event| {
                seen.borrow_mut().push(event.clone());
                let all: Vec<_> = reactor.connections().to_vec();
                for c in all {
                    reactor.remove_connection(&c);
                }
                Ok(())
            }),
        )
        .unwrap();
        connection
            .borrow_mut()
            .watch_files(dir.path(), EVENT_CREATED)
            .unwrap();

        std::fs::write(dir.path().join("x.txt"), b"hello").unwrap();

        let mut reactor = Reactor::new();
        reactor.add_connection(connection.clone()).unwrap();
        reactor.run().unwrap();

        let events = events.borrow();
        assert!(!events.is_empty());
        assert_eq!(events[0].filename(), "x.txt");
        assert!(events[0].events() & EVENT_CREATED != 0);
        assert_eq!(events[0].watched_path(), dir.path());
    }

    #[test]
    fn test_stop_watch() {
        let dir = tempfile::tempdir().unwrap();
        let connection =
            FileChangedConnection::new("watch", Box::new(|_, _| Ok(()))).unwrap();
        let mut watcher = connection.borrow_mut();
        watcher.watch_files(dir.path(), EVENT_CREATED).unwrap();
        assert_eq!(watcher.watch_count(), 1);
        watcher.stop_watch(dir.path());
        assert_eq!(watcher.watch_count(), 0);
        assert_eq!(watcher.socket(), -1);
    }
}

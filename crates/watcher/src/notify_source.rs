//! Production native source backed by the notify crate
//!
//! notify invokes its handler on its own thread; every notify event becomes one
//! batch. Ids are assigned per subscription and only ever increase. notify has no
//! event history, so resuming from a saved id continues the numbering but cannot
//! replay what happened in between.

use crate::events::RawEvent;
use crate::source::{BatchSink, NativeEventSource};
use fsobserver_core::{FlagSet, StreamConfig, SubscriptionError};
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{
    Config as NotifyConfig, ErrorKind, Event as NotifyEvent, EventKind, RecommendedWatcher,
    RecursiveMode, Watcher as NotifyWatcher,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Bits that still make sense once events are coalesced to directories
const DIRECTORY_LEVEL_BITS: FlagSet = FlagSet::MUST_SCAN_SUB_DIRS
    .union(FlagSet::USER_DROPPED)
    .union(FlagSet::KERNEL_DROPPED)
    .union(FlagSet::ROOT_CHANGED)
    .union(FlagSet::MOUNT)
    .union(FlagSet::UNMOUNT);

const ITEM_KIND_BITS: FlagSet = FlagSet::ITEM_IS_FILE
    .union(FlagSet::ITEM_IS_DIR)
    .union(FlagSet::ITEM_IS_SYMLINK);

/// Native source using the platform's recommended notify backend
#[derive(Debug, Clone, Default)]
pub struct NotifyEventSource;

impl NotifyEventSource {
    pub fn new() -> Self {
        Self
    }
}

/// A live notify watcher
pub struct NotifySubscription {
    watcher: RecommendedWatcher,
    paths: Vec<PathBuf>,
}

impl NotifySubscription {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl NativeEventSource for NotifyEventSource {
    type Subscription = NotifySubscription;

    fn subscribe(
        &self,
        paths: &[PathBuf],
        config: &StreamConfig,
        sink: BatchSink,
    ) -> Result<Self::Subscription, SubscriptionError> {
        if paths.is_empty() {
            return Err(SubscriptionError::EmptyPathList);
        }

        if let Some(id) = config.resume_from.event_id() {
            warn!(
                subscription = %sink.token(),
                after = id,
                "History replay is not available from notify; continuing ids without replay"
            );
        }
        if config.latency_ms > 0 {
            debug!(
                latency_ms = config.latency_ms,
                "notify delivers immediately; latency is ignored"
            );
        }

        let translator = Translator::new(paths.to_vec(), config);
        let token = sink.token();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<NotifyEvent>| match res {
                Ok(event) => {
                    trace!(subscription = %token, ?event, "Received notify event");
                    let batch = translator.translate(&event);
                    if !batch.is_empty() {
                        sink.deliver(batch);
                    }
                }
                Err(e) => {
                    error!(subscription = %token, "Notify error: {e}");
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| subscription_error(e, None))?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| subscription_error(e, Some(path)))?;
        }

        info!(subscription = %token, paths = ?paths, "Notify subscription created");
        Ok(NotifySubscription {
            watcher,
            paths: paths.to_vec(),
        })
    }

    fn unsubscribe(&self, subscription: Self::Subscription) {
        let NotifySubscription { mut watcher, paths } = subscription;
        for path in &paths {
            if let Err(e) = watcher.unwatch(path) {
                debug!("Failed to unwatch {path:?}: {e}");
            }
        }
        drop(watcher);
        debug!(paths = ?paths, "Notify subscription released");
    }
}

fn subscription_error(err: notify::Error, path: Option<&Path>) -> SubscriptionError {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| err.paths.first().cloned())
        .unwrap_or_default();
    match &err.kind {
        ErrorKind::PathNotFound => SubscriptionError::PathNotFound(path),
        ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            SubscriptionError::PathNotFound(path)
        }
        ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            SubscriptionError::PermissionDenied(path)
        }
        ErrorKind::MaxFilesWatch => SubscriptionError::ResourceExhausted(err.to_string()),
        _ => SubscriptionError::native(err.to_string()),
    }
}

/// Turns notify events into raw flag-encoded records
struct Translator {
    roots: Vec<PathBuf>,
    watch_root: bool,
    file_level_events: bool,
    last_id: AtomicU64,
}

impl Translator {
    fn new(roots: Vec<PathBuf>, config: &StreamConfig) -> Self {
        Self {
            roots,
            watch_root: config.watch_root,
            file_level_events: config.file_level_events,
            last_id: AtomicU64::new(config.resume_from.event_id().unwrap_or(0)),
        }
    }

    /// Next id, and whether the counter wrapped to produce it
    fn next_id(&self) -> (u64, bool) {
        let previous = self.last_id.fetch_add(1, Ordering::Relaxed);
        (previous.wrapping_add(1), previous == u64::MAX)
    }

    fn translate(&self, event: &NotifyEvent) -> Vec<RawEvent> {
        let Some(mut kind_flags) = kind_flags(&event.kind) else {
            return Vec::new();
        };
        if event.need_rescan() {
            kind_flags |= FlagSet::MUST_SCAN_SUB_DIRS;
        }
        if kind_flags.is_empty() {
            return Vec::new();
        }

        let paths: &[PathBuf] = if event.paths.is_empty() {
            // A rescan without paths applies to every root
            if kind_flags.contains(FlagSet::MUST_SCAN_SUB_DIRS) {
                &self.roots
            } else {
                return Vec::new();
            }
        } else {
            &event.paths
        };

        let mut batch: Vec<RawEvent> = Vec::with_capacity(paths.len());
        for path in paths {
            let mut flags = kind_flags;
            if !flags.intersects(ITEM_KIND_BITS) && !flags.contains(FlagSet::ITEM_REMOVED) {
                flags |= probe_item_kind(path);
            }
            let is_root = self.roots.iter().any(|root| root == path);
            if self.watch_root
                && is_root
                && flags.intersects(FlagSet::ITEM_REMOVED | FlagSet::ITEM_RENAMED)
            {
                flags |= FlagSet::ROOT_CHANGED;
            }

            let (path, flags) = if self.file_level_events {
                (path.clone(), flags)
            } else {
                let dir = if is_root {
                    path.clone()
                } else {
                    path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone())
                };
                (dir, flags & DIRECTORY_LEVEL_BITS)
            };

            // Directory-level events for the same directory collapse into one
            if !self.file_level_events {
                if let Some(previous) = batch.last_mut() {
                    if previous.path == path {
                        previous.flags |= flags.bits();
                        continue;
                    }
                }
            }

            let (id, wrapped) = self.next_id();
            let flags = if wrapped {
                warn!("Event id counter wrapped");
                flags | FlagSet::EVENT_IDS_WRAPPED
            } else {
                flags
            };
            batch.push(RawEvent::new(path, flags, id));
        }
        batch
    }
}

/// Flag bits for a notify event kind; `None` for kinds with no counterpart
fn kind_flags(kind: &EventKind) -> Option<FlagSet> {
    let flags = match kind {
        EventKind::Create(create) => {
            FlagSet::ITEM_CREATED
                | match create {
                    CreateKind::File => FlagSet::ITEM_IS_FILE,
                    CreateKind::Folder => FlagSet::ITEM_IS_DIR,
                    _ => FlagSet::NONE,
                }
        }
        EventKind::Remove(remove) => {
            FlagSet::ITEM_REMOVED
                | match remove {
                    RemoveKind::File => FlagSet::ITEM_IS_FILE,
                    RemoveKind::Folder => FlagSet::ITEM_IS_DIR,
                    _ => FlagSet::NONE,
                }
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => {
            FlagSet::ITEM_CHANGE_OWNER
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => FlagSet::ITEM_XATTR_MOD,
        EventKind::Modify(ModifyKind::Metadata(_)) => FlagSet::ITEM_INODE_META_MOD,
        EventKind::Modify(ModifyKind::Name(_)) => FlagSet::ITEM_RENAMED,
        EventKind::Modify(_) => FlagSet::ITEM_MODIFIED,
        EventKind::Access(_) => return None,
        EventKind::Any | EventKind::Other => FlagSet::NONE,
    };
    Some(flags)
}

/// File/dir/symlink bit for a path that still exists
fn probe_item_kind(path: &Path) -> FlagSet {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => FlagSet::ITEM_IS_SYMLINK,
        Ok(meta) if meta.is_dir() => FlagSet::ITEM_IS_DIR,
        Ok(meta) if meta.is_file() => FlagSet::ITEM_IS_FILE,
        _ => FlagSet::NONE,
    }
}

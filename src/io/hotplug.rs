// src/io/hotplug.rs
//
// Hotplug watcher: turns device nodes appearing and disappearing under the
// device directory into Arrived/Departed intents for known identities.
//
// Backends:
// - inotify (Linux): create/delete/rename notifications on the directory
// - poll: re-list the directory on an interval and diff
//
// Either way the directory is scanned once at startup so devices already
// plugged in are reported as arrivals.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::identity::{DeviceIdentity, IdentitySet};
use crate::settings::{HotplugBackend, HotplugSettings};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to initialise device notifications: {0}")]
    Init(#[source] std::io::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("device notification stream failed: {0}")]
    Stream(#[source] std::io::Error),
    #[error("device notification stream ended")]
    Closed,
}

/// What the session manager is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugIntent {
    Arrived {
        identity: DeviceIdentity,
        path: PathBuf,
    },
    /// `path` is the node that went away; other nodes may still map to the
    /// same identity
    Departed {
        identity: DeviceIdentity,
        path: PathBuf,
    },
}

// ============================================================================
// Node resolution
// ============================================================================

/// Maps node names to identities and remembers which nodes are present,
/// so a deletion resolves to the identity its creation resolved to.
struct Resolver {
    identities: IdentitySet,
    dev_dir: PathBuf,
    sysfs_root: PathBuf,
    /// Every node name currently present, matched or not
    seen: HashSet<String>,
    /// Nodes that matched an identity when they appeared
    resolved: HashMap<String, DeviceIdentity>,
}

impl Resolver {
    fn new(identities: IdentitySet, dev_dir: &Path, sysfs_root: &Path) -> Self {
        Resolver {
            identities,
            dev_dir: dev_dir.to_path_buf(),
            sysfs_root: sysfs_root.to_path_buf(),
            seen: HashSet::new(),
            resolved: HashMap::new(),
        }
    }

    fn arrived(&mut self, node: &str) -> Option<HotplugIntent> {
        self.seen.insert(node.to_string());
        let identity = self.identities.resolve(node, &self.sysfs_root)?;
        self.resolved.insert(node.to_string(), identity.clone());
        Some(HotplugIntent::Arrived {
            identity,
            path: self.dev_dir.join(node),
        })
    }

    fn departed(&mut self, node: &str) -> Option<HotplugIntent> {
        self.seen.remove(node);
        let identity = self.resolved.remove(node)?;
        Some(HotplugIntent::Departed {
            identity,
            path: self.dev_dir.join(node),
        })
    }

    fn list(&self) -> Result<HashSet<String>, WatchError> {
        let entries = std::fs::read_dir(&self.dev_dir).map_err(|source| WatchError::Scan {
            path: self.dev_dir.clone(),
            source,
        })?;
        Ok(entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect())
    }

    /// Diff the directory against what we last saw. Departures come first.
    fn rescan(&mut self) -> Result<Vec<HotplugIntent>, WatchError> {
        let present = self.list()?;
        let mut intents = Vec::new();

        let mut gone: Vec<String> = self.seen.difference(&present).cloned().collect();
        gone.sort();
        for node in gone {
            intents.extend(self.departed(&node));
        }

        let mut new: Vec<String> = present
            .into_iter()
            .filter(|n| !self.seen.contains(n))
            .collect();
        new.sort();
        for node in new {
            intents.extend(self.arrived(&node));
        }
        Ok(intents)
    }
}

// ============================================================================
// Watcher
// ============================================================================

/// Running watcher task. Dropping it without `stop` leaves the task running
/// until the intent receiver is dropped.
pub struct HotplugWatcher {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), WatchError>>>,
}

enum Source {
    #[cfg(target_os = "linux")]
    Inotify(inotify::EventStream<[u8; 4096]>),
    Poll(Duration),
}

#[cfg(target_os = "linux")]
fn open_inotify(dev_dir: &Path) -> Result<Source, WatchError> {
    use inotify::{Inotify, WatchMask};

    let inotify = Inotify::init().map_err(WatchError::Init)?;
    inotify
        .watches()
        .add(
            dev_dir,
            WatchMask::CREATE | WatchMask::DELETE | WatchMask::MOVED_TO | WatchMask::MOVED_FROM,
        )
        .map_err(|source| WatchError::Watch {
            path: dev_dir.to_path_buf(),
            source,
        })?;
    let stream = inotify
        .into_event_stream([0u8; 4096])
        .map_err(WatchError::Init)?;
    Ok(Source::Inotify(stream))
}

impl HotplugWatcher {
    /// Open the event source, then scan and watch in a background task.
    /// Failing to open the source is returned here; failures afterwards end
    /// the task with an error (see [`HotplugWatcher::finished`]).
    /// Must be called from within a tokio runtime.
    pub fn start(
        settings: &HotplugSettings,
        identities: IdentitySet,
        intents: mpsc::Sender<HotplugIntent>,
    ) -> Result<HotplugWatcher, WatchError> {
        let poll_interval = Duration::from_millis(settings.poll_interval_ms.max(1));

        // Subscribe before the initial scan so nothing falls between the two
        let source = match settings.backend {
            #[cfg(target_os = "linux")]
            HotplugBackend::Inotify => open_inotify(&settings.dev_dir)?,
            #[cfg(not(target_os = "linux"))]
            HotplugBackend::Inotify => {
                tlog!("[hotplug] inotify unavailable on this platform, polling instead");
                Source::Poll(poll_interval)
            }
            HotplugBackend::Poll => Source::Poll(poll_interval),
        };

        let resolver = Resolver::new(identities, &settings.dev_dir, &settings.sysfs_root);
        // Listing failure at startup is as fatal as failing to subscribe
        resolver.list()?;

        tlog!(
            "[hotplug] Watching {} ({})",
            settings.dev_dir.display(),
            match &source {
                #[cfg(target_os = "linux")]
                Source::Inotify(_) => "inotify".to_string(),
                Source::Poll(d) => format!("poll every {}ms", d.as_millis()),
            }
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_watcher(source, resolver, intents, shutdown_rx));

        Ok(HotplugWatcher {
            shutdown,
            task: Some(task),
        })
    }

    /// Resolves when the watcher task ends on its own. Ok(()) only when the
    /// intent receiver went away.
    pub async fn finished(&mut self) -> Result<(), WatchError> {
        match self.task.as_mut() {
            Some(task) => {
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => Err(WatchError::Stream(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("watcher task failed: {}", e),
                    ))),
                };
                self.task = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    /// Stop watching and wait for the task to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tlog!("[hotplug] Watcher ended with error: {}", e),
                Err(e) => tlog!("[hotplug] Watcher task failed: {}", e),
            }
        }
        tlog!("[hotplug] Stopped");
    }
}

/// Returns false once the receiver has gone away
async fn forward(intents: &mpsc::Sender<HotplugIntent>, batch: Vec<HotplugIntent>) -> bool {
    for intent in batch {
        match &intent {
            HotplugIntent::Arrived { identity, path } => {
                tlog!("[hotplug] {} arrived at {}", identity, path.display())
            }
            HotplugIntent::Departed { identity, path } => {
                tlog!("[hotplug] {} departed from {}", identity, path.display())
            }
        }
        if intents.send(intent).await.is_err() {
            return false;
        }
    }
    true
}

async fn run_watcher(
    source: Source,
    mut resolver: Resolver,
    intents: mpsc::Sender<HotplugIntent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), WatchError> {
    let initial = resolver.rescan()?;
    if !forward(&intents, initial).await {
        return Ok(());
    }

    match source {
        #[cfg(target_os = "linux")]
        Source::Inotify(mut stream) => {
            use futures::StreamExt;
            use inotify::EventMask;

            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    event = stream.next() => event,
                };
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => return Err(WatchError::Stream(e)),
                    None => return Err(WatchError::Closed),
                };

                let batch = if event.mask.contains(EventMask::Q_OVERFLOW) {
                    tlog!("[hotplug] Event queue overflowed, rescanning");
                    resolver.rescan()?
                } else if event.mask.contains(EventMask::ISDIR) {
                    Vec::new()
                } else {
                    let Some(node) = event.name.as_ref().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let intent = if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
                        resolver.arrived(node)
                    } else if event.mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
                        resolver.departed(node)
                    } else {
                        None
                    };
                    intent.into_iter().collect()
                };

                if !forward(&intents, batch).await {
                    return Ok(());
                }
            }
        }
        Source::Poll(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the initial scan already ran
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = ticker.tick() => {}
                }
                let batch = resolver.rescan()?;
                if !forward(&intents, batch).await {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRule;

    fn settings(dev_dir: &Path, backend: HotplugBackend) -> HotplugSettings {
        HotplugSettings {
            dev_dir: dev_dir.to_path_buf(),
            sysfs_root: dev_dir.join("no-sysfs"),
            backend,
            poll_interval_ms: 20,
        }
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    async fn next(rx: &mut mpsc::Receiver<HotplugIntent>) -> HotplugIntent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no intent within 5s")
            .expect("watcher hung up")
    }

    fn name(intent: &HotplugIntent) -> (&'static str, String) {
        match intent {
            HotplugIntent::Arrived { identity, .. } => ("arrived", identity.name().to_string()),
            HotplugIntent::Departed { identity, .. } => ("departed", identity.name().to_string()),
        }
    }

    #[test]
    fn test_rescan_reports_known_nodes_only() {
        let dev = tempfile::tempdir().unwrap();
        touch(dev.path(), "Onion2");
        touch(dev.path(), "Onion1");
        touch(dev.path(), "ttyS0");

        let mut resolver = Resolver::new(IdentitySet::default(), dev.path(), Path::new("/nonexistent"));
        let intents = resolver.rescan().unwrap();
        assert_eq!(
            intents,
            vec![
                HotplugIntent::Arrived {
                    identity: IdentitySet::default().get("Onion1").unwrap().clone(),
                    path: dev.path().join("Onion1"),
                },
                HotplugIntent::Arrived {
                    identity: IdentitySet::default().get("Onion2").unwrap().clone(),
                    path: dev.path().join("Onion2"),
                },
            ]
        );

        // Nothing changed, nothing reported
        assert!(resolver.rescan().unwrap().is_empty());

        std::fs::remove_file(dev.path().join("Onion2")).unwrap();
        let intents = resolver.rescan().unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(name(&intents[0]), ("departed", "Onion2".to_string()));
    }

    #[test]
    fn test_departure_uses_identity_resolved_on_arrival() {
        let dev = tempfile::tempdir().unwrap();
        let set = IdentitySet::new(vec![(
            "Onion3".to_string(),
            IdentityRule::Usb {
                vendor_id: 0x0403,
                product_id: 0x6001,
            },
        )])
        .unwrap();
        let mut resolver = Resolver::new(set, dev.path(), Path::new("/nonexistent"));

        // No sysfs: the node cannot be matched, so its removal is silent too
        assert!(resolver.arrived("ttyUSB0").is_none());
        assert!(resolver.departed("ttyUSB0").is_none());

        // Pretend a previous arrival matched
        let onion3 = resolver.identities.get("Onion3").unwrap().clone();
        resolver.resolved.insert("ttyUSB0".to_string(), onion3.clone());
        assert_eq!(
            resolver.departed("ttyUSB0"),
            Some(HotplugIntent::Departed {
                identity: onion3,
                path: dev.path().join("ttyUSB0"),
            })
        );
        assert!(resolver.departed("ttyUSB0").is_none());
    }

    #[tokio::test]
    async fn test_missing_dev_dir_fails_at_start() {
        let dev = tempfile::tempdir().unwrap();
        let missing = dev.path().join("missing");
        let (tx, _rx) = mpsc::channel(8);
        let result = HotplugWatcher::start(
            &settings(&missing, HotplugBackend::Poll),
            IdentitySet::default(),
            tx,
        );
        assert!(matches!(result, Err(WatchError::Scan { .. })));
    }

    #[tokio::test]
    async fn test_poll_backend_reports_changes() {
        let dev = tempfile::tempdir().unwrap();
        touch(dev.path(), "Onion1");

        let (tx, mut rx) = mpsc::channel(8);
        let watcher = HotplugWatcher::start(
            &settings(dev.path(), HotplugBackend::Poll),
            IdentitySet::default(),
            tx,
        )
        .unwrap();

        assert_eq!(name(&next(&mut rx).await), ("arrived", "Onion1".to_string()));

        touch(dev.path(), "Onion4");
        assert_eq!(name(&next(&mut rx).await), ("arrived", "Onion4".to_string()));

        std::fs::remove_file(dev.path().join("Onion1")).unwrap();
        assert_eq!(name(&next(&mut rx).await), ("departed", "Onion1".to_string()));

        watcher.stop().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_inotify_backend_reports_create_rename_delete() {
        let dev = tempfile::tempdir().unwrap();
        touch(dev.path(), "Onion2");

        let (tx, mut rx) = mpsc::channel(8);
        let watcher = HotplugWatcher::start(
            &settings(dev.path(), HotplugBackend::Inotify),
            IdentitySet::default(),
            tx,
        )
        .unwrap();

        assert_eq!(name(&next(&mut rx).await), ("arrived", "Onion2".to_string()));

        touch(dev.path(), "ttyS9");
        touch(dev.path(), "Onion1");
        assert_eq!(name(&next(&mut rx).await), ("arrived", "Onion1".to_string()));

        // udev-style symlink creation: write elsewhere, rename into place
        touch(dev.path(), ".tmp-Onion3");
        std::fs::rename(dev.path().join(".tmp-Onion3"), dev.path().join("Onion3")).unwrap();
        assert_eq!(name(&next(&mut rx).await), ("arrived", "Onion3".to_string()));

        std::fs::remove_file(dev.path().join("Onion1")).unwrap();
        assert_eq!(name(&next(&mut rx).await), ("departed", "Onion1".to_string()));

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_watcher_exits_when_receiver_dropped() {
        let dev = tempfile::tempdir().unwrap();
        touch(dev.path(), "Onion1");

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut watcher = HotplugWatcher::start(
            &settings(dev.path(), HotplugBackend::Poll),
            IdentitySet::default(),
            tx,
        )
        .unwrap();
        assert!(watcher.finished().await.is_ok());
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::fallback::FallbackConfig;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches the fallback document and swaps the shared snapshot when it
/// changes on disk.
///
/// Reloads are atomic: the whole configuration object is replaced, never
/// merged. A reload that fails to parse keeps the previous snapshot.
pub struct FallbackWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl FallbackWatcher {
    pub fn spawn(
        path: PathBuf,
        target: Arc<ArcSwap<FallbackConfig>>,
    ) -> notify::Result<Self> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })?;
        // Editors and atomic writers replace the file, so watch the parent
        // directory rather than the inode.
        let watch_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        // notify delivers on its own thread; bridge into tokio.
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<notify::Result<Event>>(32);
        std::thread::spawn(move || {
            while let Ok(res) = raw_rx.recv() {
                if event_tx.blocking_send(res).is_err() {
                    break;
                }
            }
        });

        let task = tokio::spawn(async move {
            while let Some(res) = event_rx.recv().await {
                match res {
                    Ok(event) if touches(&event, &path) => {
                        // Collapse the burst a single save produces.
                        tokio::time::sleep(DEBOUNCE).await;
                        while event_rx.try_recv().is_ok() {}
                        match FallbackConfig::load(&path).await {
                            Ok(config) => {
                                info!(
                                    event = "fallback_config_reloaded",
                                    path = %path.display(),
                                    enabled = config.enabled,
                                    virtual_models = config.virtual_models.len()
                                );
                                target.store(Arc::new(config));
                            }
                            Err(err) => {
                                warn!(
                                    event = "fallback_config_reload_failed",
                                    path = %path.display(),
                                    error = %err
                                );
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(event = "fallback_watch_error", error = %err);
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for FallbackWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    let target_name = path.file_name();
    event.paths.is_empty()
        || event
            .paths
            .iter()
            .any(|event_path| event_path == path || event_path.file_name() == target_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn external_edit_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FallbackConfig::FILE_NAME);
        let snapshot = Arc::new(ArcSwap::from_pointee(FallbackConfig::default()));
        let _watcher = FallbackWatcher::spawn(path.clone(), snapshot.clone()).unwrap();

        tokio::fs::write(
            &path,
            br#"{"enabled": true, "virtualModels": [{"id": "vm", "name": "quotio-opus", "entries": []}]}"#,
        )
        .await
        .unwrap();

        // Debounce plus inotify latency.
        let mut reloaded = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if snapshot.load().enabled {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "snapshot was not swapped");
        assert_eq!(snapshot.load().virtual_models.len(), 1);
    }

    #[tokio::test]
    async fn malformed_edit_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FallbackConfig::FILE_NAME);
        tokio::fs::write(&path, br#"{"enabled": true, "virtualModels": []}"#)
            .await
            .unwrap();
        let initial = FallbackConfig::load(&path).await.unwrap();
        let snapshot = Arc::new(ArcSwap::from_pointee(initial));
        let _watcher = FallbackWatcher::spawn(path.clone(), snapshot.clone()).unwrap();

        tokio::fs::write(&path, b"{broken").await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(snapshot.load().enabled, "previous snapshot was replaced");
    }
}

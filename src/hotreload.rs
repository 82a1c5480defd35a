//! Hot-reload watcher
//!
//! We watch **directories** (not individual files) because file replacement on save is often
//! implemented as: write temp -> rename/replace -> delete old. Directory watching is the most
//! reliable cross-platform approach.
//!
//! The watcher only forwards "this shader file changed" signals. The render thread turns them
//! into an explicit engine reload, so compiling stays on the thread that owns the GL context.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

#[derive(Debug, Clone)]
pub enum HotEvent {
    /// A watched shader stage was written, replaced or removed.
    ShaderChanged(PathBuf),
}

pub struct HotReload {
    _watcher: RecommendedWatcher,
    rx: Receiver<HotEvent>,
}

impl HotReload {
    pub fn rx(&self) -> &Receiver<HotEvent> {
        &self.rx
    }

    /// Watch the parent directories of `files` and report events touching any of them.
    pub fn new(files: &[PathBuf]) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded::<HotEvent>();
        let names: BTreeSet<PathBuf> = files.iter().filter_map(|f| f.file_name().map(PathBuf::from)).collect();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let Ok(ev) = res else {
                    return;
                };
                // Editors that save via rename report the temp name too; match on file name.
                for p in ev.paths {
                    if p.file_name().is_some_and(|n| names.contains(Path::new(n))) {
                        let _ = tx.send(HotEvent::ShaderChanged(p));
                    }
                }
            },
            Config::default().with_poll_interval(Duration::from_millis(250)),
        )?;

        let dirs: BTreeSet<PathBuf> = files.iter().map(|f| parent_dir(f)).collect();
        for d in &dirs {
            watcher.watch(d, RecursiveMode::NonRecursive)?;
            waivefront_engine::logi!("WATCH", "watching {}", d.display());
        }

        Ok(Self { _watcher: watcher, rx })
    }
}

fn parent_dir(file: &Path) -> PathBuf {
    file.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

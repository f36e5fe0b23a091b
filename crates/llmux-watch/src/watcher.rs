use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use llmux_auth::{Auth, AuthManager, AuthUpdate, AuthUpdateAction, OpCtx};
use llmux_common::AppConfig;

use crate::dispatcher::Dispatcher;
use crate::synthesizer::{ConfigSynthesizer, FileSynthesizer, Synthesizer};

/// Debounce for config writes; editors and atomic replaces produce bursts.
const CONFIG_DEBOUNCE: Duration = Duration::from_millis(150);
/// Debounce for auth-file change events.
const AUTH_DEBOUNCE: Duration = Duration::from_millis(150);
/// Window in which a remove followed by a re-create counts as a modify.
const REMOVE_COALESCE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("filesystem watch: {0}")]
    Notify(#[from] notify::Error),
    #[error("watch io: {0}")]
    Io(#[from] std::io::Error),
}

enum FsEvent {
    Config,
    AuthChanged(PathBuf),
    AuthRemoved(PathBuf),
}

struct WatchState {
    config_hash: Option<[u8; 32]>,
    file_hashes: HashMap<PathBuf, [u8; 32]>,
    /// Snapshot of the last synthesized auth set, diffed on every resync.
    current: HashMap<String, Auth>,
}

struct Inner {
    config_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    config_synth: ConfigSynthesizer,
    file_synth: FileSynthesizer,
    config: ArcSwap<AppConfig>,
    on_reload: Box<dyn Fn(&AppConfig) + Send + Sync>,
    state: Mutex<WatchState>,
    shutdown: Notify,
}

/// Watches the config file and the auth directory, synthesizes the auth set
/// on each relevant change and dispatches the per-id differences.
pub struct Watcher {
    inner: Arc<Inner>,
    _fs_watcher: RecommendedWatcher,
    handle: tokio::task::JoinHandle<()>,
}

impl Watcher {
    pub fn start(
        config: AppConfig,
        config_path: impl Into<PathBuf>,
        auth_dir: impl Into<PathBuf>,
        dispatcher: Arc<Dispatcher>,
        on_reload: impl Fn(&AppConfig) + Send + Sync + 'static,
    ) -> Result<Self, WatchError> {
        let config_path = config_path.into();
        let auth_dir = auth_dir.into();
        std::fs::create_dir_all(&auth_dir)?;

        let config_hash = std::fs::read(&config_path)
            .ok()
            .map(|bytes| Sha256::digest(&bytes).into());

        let inner = Arc::new(Inner {
            config_path: config_path.clone(),
            dispatcher,
            config_synth: ConfigSynthesizer,
            file_synth: FileSynthesizer::new(&auth_dir),
            config: ArcSwap::from_pointee(config),
            on_reload: Box::new(on_reload),
            state: Mutex::new(WatchState {
                config_hash,
                file_hashes: HashMap::new(),
                current: HashMap::new(),
            }),
            shutdown: Notify::new(),
        });

        // Synthesize the startup set before any event arrives.
        inner.resync();

        let (tx, rx) = mpsc::channel::<FsEvent>(64);
        let mut fs_watcher = notify::recommended_watcher({
            let config_path = config_path.clone();
            move |res: Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                for path in &event.paths {
                    if let Some(fs_event) = classify(&config_path, path, &event.kind) {
                        let _ = tx.blocking_send(fs_event);
                    }
                }
            }
        })?;
        fs_watcher.watch(&auth_dir, RecursiveMode::Recursive)?;
        if config_path.exists() {
            fs_watcher.watch(&config_path, RecursiveMode::NonRecursive)?;
        } else if let Some(parent) = config_path.parent() {
            fs_watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        let handle = tokio::spawn(Arc::clone(&inner).event_loop(rx));
        Ok(Self {
            inner,
            _fs_watcher: fs_watcher,
            handle,
        })
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.inner.config.load_full()
    }

    pub async fn stop(self) {
        self.inner.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

fn classify(config_path: &Path, path: &Path, kind: &EventKind) -> Option<FsEvent> {
    if path == config_path {
        return Some(FsEvent::Config);
    }
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    match kind {
        EventKind::Remove(_) => Some(FsEvent::AuthRemoved(path.to_path_buf())),
        // Renames arrive as modify events; the vanished side of an atomic
        // replace is handled like a remove.
        EventKind::Create(_) | EventKind::Modify(_) => {
            if path.exists() {
                Some(FsEvent::AuthChanged(path.to_path_buf()))
            } else {
                Some(FsEvent::AuthRemoved(path.to_path_buf()))
            }
        }
        _ => None,
    }
}

impl Inner {
    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<FsEvent>) {
        let mut config_deadline: Option<Instant> = None;
        let mut resync_deadline: Option<Instant> = None;
        let mut removals: HashMap<PathBuf, Instant> = HashMap::new();
        // Paths that went through remove + re-create; they must surface as a
        // modify even when the re-created bytes are identical.
        let mut force_modify: Vec<PathBuf> = Vec::new();

        loop {
            let next_deadline = config_deadline
                .into_iter()
                .chain(resync_deadline)
                .chain(removals.values().copied())
                .min();

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        FsEvent::Config => {
                            config_deadline = Some(Instant::now() + CONFIG_DEBOUNCE);
                        }
                        FsEvent::AuthChanged(path) => {
                            let was_removed = removals.remove(&path).is_some();
                            let changed = self.file_content_changed(&path);
                            if was_removed {
                                force_modify.push(path);
                            }
                            if was_removed || changed {
                                resync_deadline = Some(Instant::now() + AUTH_DEBOUNCE);
                            }
                        }
                        FsEvent::AuthRemoved(path) => {
                            // Absorb atomic-replace patterns: wait, then
                            // re-stat on the deadline.
                            removals.insert(path, Instant::now() + REMOVE_COALESCE);
                        }
                    }
                }
                _ = deadline_sleep(next_deadline) => {
                    let now = Instant::now();
                    let mut resync = false;
                    if config_deadline.is_some_and(|d| d <= now) {
                        config_deadline = None;
                        if self.reload_config() {
                            resync = true;
                        }
                    }
                    if resync_deadline.is_some_and(|d| d <= now) {
                        resync_deadline = None;
                        resync = true;
                    }
                    let due: Vec<PathBuf> = removals
                        .iter()
                        .filter(|(_, d)| **d <= now)
                        .map(|(p, _)| p.clone())
                        .collect();
                    for path in due {
                        removals.remove(&path);
                        if path.exists() {
                            // Reappeared without a change event: a modify.
                            force_modify.push(path);
                        } else {
                            self.forget_file_hash(&path);
                        }
                        resync = true;
                    }
                    if resync {
                        let forced = std::mem::take(&mut force_modify);
                        self.resync_with(&forced);
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Per-file content guard: identical bytes never trigger a resync.
    fn file_content_changed(&self, path: &Path) -> bool {
        let Ok(bytes) = std::fs::read(path) else {
            // Unreadable now; the remove path will pick it up.
            return true;
        };
        let hash: [u8; 32] = Sha256::digest(&bytes).into();
        let mut state = self.state.lock().expect("watch state poisoned");
        match state.file_hashes.get(path) {
            Some(existing) if *existing == hash => false,
            _ => {
                state.file_hashes.insert(path.to_path_buf(), hash);
                true
            }
        }
    }

    fn forget_file_hash(&self, path: &Path) {
        // Only forget when the file is really gone; a re-created file kept
        // its (possibly identical) hash on the change event.
        if !path.exists() {
            let mut state = self.state.lock().expect("watch state poisoned");
            state.file_hashes.remove(path);
        }
    }

    /// Re-read the config file. Returns true when a new config took effect.
    fn reload_config(&self) -> bool {
        let bytes = match std::fs::read(&self.config_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(path = %self.config_path.display(), error = %err, "config read failed");
                return false;
            }
        };
        if bytes.is_empty() {
            return false;
        }
        let hash: [u8; 32] = Sha256::digest(&bytes).into();
        {
            let mut state = self.state.lock().expect("watch state poisoned");
            if state.config_hash == Some(hash) {
                return false;
            }
            state.config_hash = Some(hash);
        }

        match AppConfig::parse(&String::from_utf8_lossy(&bytes)) {
            Ok(new_config) => {
                tracing::info!("configuration reloaded");
                (self.on_reload)(&new_config);
                self.config.store(Arc::new(new_config));
                true
            }
            Err(err) => {
                // Keep serving with the previous config.
                tracing::error!(error = %err, "config reload failed");
                false
            }
        }
    }

    fn resync(&self) {
        self.resync_with(&[]);
    }

    /// Run the synthesizers and dispatch the differences against the last
    /// snapshot: new ids add, changed execution identities modify, vanished
    /// ids delete. Auths backed by a path in `force_modify` dispatch a
    /// modify even when their identity is unchanged.
    fn resync_with(&self, force_modify: &[PathBuf]) {
        let forced_files: Vec<String> = force_modify
            .iter()
            .map(|path| {
                path.strip_prefix(self.file_synth.auth_dir())
                    .unwrap_or(path)
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();

        let config = self.config.load_full();
        let mut desired_list = self.config_synth.synthesize(&config);
        desired_list.extend(self.file_synth.synthesize(&config));

        let mut desired: HashMap<String, Auth> = HashMap::with_capacity(desired_list.len());
        for auth in desired_list {
            desired.insert(auth.id.clone(), auth);
        }

        let mut updates = Vec::new();
        {
            let mut state = self.state.lock().expect("watch state poisoned");
            let mut ids: Vec<&String> = desired.keys().collect();
            ids.sort();
            for id in ids {
                let auth = &desired[id];
                let forced = forced_files.iter().any(|f| *f == auth.file_name);
                match state.current.get(id) {
                    None => updates.push(AuthUpdate {
                        action: AuthUpdateAction::Add,
                        id: id.clone(),
                        auth: Some(auth.clone()),
                    }),
                    Some(existing) if forced || !existing.same_execution_identity(auth) => {
                        updates.push(AuthUpdate {
                            action: AuthUpdateAction::Modify,
                            id: id.clone(),
                            auth: Some(auth.clone()),
                        });
                    }
                    Some(_) => {}
                }
            }
            let mut gone: Vec<String> = state
                .current
                .keys()
                .filter(|id| !desired.contains_key(*id))
                .cloned()
                .collect();
            gone.sort();
            for id in gone {
                updates.push(AuthUpdate {
                    action: AuthUpdateAction::Delete,
                    id,
                    auth: None,
                });
            }
            state.current = desired;
        }

        for update in updates {
            self.dispatcher.enqueue(update);
        }
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Consume the dispatcher's outbound queue and apply each update to the
/// manager. File-sourced updates carry the skip-persist marker so the
/// manager never rewrites the file the watcher just read.
pub fn spawn_update_applier(
    manager: Arc<AuthManager>,
    mut queue: mpsc::Receiver<AuthUpdate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = queue.recv().await {
            manager.apply_update(&OpCtx::skip_persist(), update).await;
        }
    })
}

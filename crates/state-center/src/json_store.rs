use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::to_writer_pretty;
use soulact_core_types::{SessionId, TargetId};
use tracing::debug;

use crate::{
    now_ms, ResolvedSession, SessionRecord, SessionResolver, StateError, StateTables, TargetSnapshot,
    TargetStore,
};

const SESSIONS_FILE: &str = "sessions.json";
const TARGETS_FILE: &str = "targets.json";

/// File-backed store: `sessions.json` and `targets.json` under one directory.
///
/// Each operation reloads from disk so concurrent invocations see each
/// other's writes; files are replaced atomically.
pub struct JsonStateStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load(&self) -> Result<StateTables, StateError> {
        let sessions: BTreeMap<SessionId, SessionRecord> = read_json(&self.dir.join(SESSIONS_FILE))?;
        let targets: BTreeMap<TargetId, TargetSnapshot> = read_json(&self.dir.join(TARGETS_FILE))?;
        Ok(StateTables { sessions, targets })
    }

    fn store_sessions(&self, tables: &StateTables) -> Result<(), StateError> {
        write_atomic(&self.dir, SESSIONS_FILE, &tables.sessions)
    }

    fn store_targets(&self, tables: &StateTables) -> Result<(), StateError> {
        write_atomic(&self.dir, TARGETS_FILE, &tables.targets)
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StateError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError {
    let path = path.to_path_buf();
    move |source| StateError::Io { path, source }
}

fn write_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<(), StateError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;

    let target = dir.join(name);
    let temp = dir.join(format!(".{name}.{}.tmp", std::process::id()));
    {
        let file = File::create(&temp).map_err(io_err(&temp))?;
        let mut writer = BufWriter::new(file);
        to_writer_pretty(&mut writer, value).map_err(|source| StateError::Corrupt {
            path: temp.clone(),
            source,
        })?;
        writer.flush().map_err(io_err(&temp))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(io_err(&temp))?;
    }
    fs::rename(&temp, &target).map_err(io_err(&target))?;
    debug!(path = %target.display(), "state file written");
    Ok(())
}

#[async_trait]
impl SessionResolver for JsonStateStore {
    async fn resolve(
        &self,
        session_hint: Option<&str>,
        target_hint: Option<&str>,
        default_origin: &str,
    ) -> Result<ResolvedSession, StateError> {
        let _guard = self.lock.lock();
        let mut tables = self.load()?;
        let resolved = tables.resolve(session_hint, target_hint, default_origin, now_ms())?;
        self.store_sessions(&tables)?;
        Ok(resolved)
    }
}

#[async_trait]
impl TargetStore for JsonStateStore {
    async fn save(&self, snapshot: TargetSnapshot) -> Result<(), StateError> {
        let _guard = self.lock.lock();
        let mut tables = self.load()?;
        tables.save(snapshot);
        self.store_targets(&tables)
    }

    async fn latest_for_session(&self, session: &SessionId) -> Result<Option<TargetSnapshot>, StateError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.latest_for_session(session))
    }
}

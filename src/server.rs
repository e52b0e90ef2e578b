//! Server frontend: global settings, repository registry, and the
//! JSON-over-stdio dispatcher.
//!
//! One [`KernelServer`] is built in `main` and owns everything — the
//! settings store, the kernel database, the session registry, and the
//! outbound sender thread. Sessions reach back through a `Weak` handle so
//! ownership stays acyclic. Handler failures are mapped to a `status`
//! code in the reply; they never take the dispatcher down.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{KernelError, Result};
use crate::protocol::{CallbackRegistry, Envelope, StatusCode, SERVER_SESSION_ID};
use crate::session::{self, SessionConfig, SessionHandle};
use crate::store::{EmbeddingConfig, Store, StoreError};

/// Chat endpoint configuration for the conversation layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationModel {
    pub name: String,
    pub model_name: String,
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RerankerConfig {
    pub name: String,
    pub model_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigList<T> {
    pub configs: Vec<T>,
}

impl<T> Default for ConfigList<T> {
    fn default() -> Self {
        Self {
            configs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchSettings {
    pub embedding_config: ConfigList<EmbeddingConfig>,
    pub rerank_config: ConfigList<RerankerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationSettings {
    pub generation_model: Vec<GenerationModel>,
}

/// `settings.json` shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub search_settings: SearchSettings,
    pub conversation_settings: ConversationSettings,
}

impl Settings {
    fn defaults() -> Self {
        Settings {
            search_settings: SearchSettings {
                embedding_config: ConfigList {
                    configs: vec![EmbeddingConfig {
                        config_name: "default".to_string(),
                        model_name: "hash-embedder".to_string(),
                        model_path: "hash:128".to_string(),
                        max_input_length: 512,
                    }],
                },
                rerank_config: ConfigList::default(),
            },
            conversation_settings: ConversationSettings::default(),
        }
    }

    /// Read `settings.json`, writing defaults first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| KernelError::file_access(parent, e))?;
            }
            let defaults = Self::defaults();
            let text = serde_json::to_string_pretty(&defaults)
                .map_err(|e| KernelError::Internal(e.to_string()))?;
            std::fs::write(path, text).map_err(|e| KernelError::file_access(path, e))?;
            return Ok(defaults);
        }
        let text = std::fs::read_to_string(path).map_err(|e| KernelError::file_access(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| KernelError::Parser(format!("{}: {}", path.display(), e)))
    }
}

/// State shared with session threads: the outbound queue and the callback
/// registry. Sessions hold this behind `Weak`.
pub struct ServerShared {
    out: Sender<Envelope>,
    pub callbacks: CallbackRegistry,
}

impl ServerShared {
    pub fn send(&self, envelope: Envelope) {
        if self.out.send(envelope).is_err() {
            tracing::warn!("outbound queue closed, dropping message");
        }
    }
}

pub struct KernelServer {
    settings: Settings,
    kernel_store: Store,
    shared: Option<Arc<ServerShared>>,
    sessions: HashMap<i64, SessionHandle>,
    window_to_session: HashMap<i64, i64>,
    next_session_id: i64,
    sender_thread: Option<JoinHandle<()>>,
}

impl KernelServer {
    /// Build the server rooted at `user_data` (normally `./UserData`),
    /// writing outbound messages to stdout.
    pub fn new(user_data: &Path) -> Result<Self> {
        Self::with_writer(user_data, Box::new(std::io::stdout()))
    }

    /// Same, with an injected outbound writer (tests capture it).
    pub fn with_writer(user_data: &Path, writer: Box<dyn Write + Send>) -> Result<Self> {
        let settings = Settings::load_or_init(&user_data.join("settings.json"))?;
        let kernel_store = Store::open_bare(&user_data.join("db").join("kernel.db"))?;
        Self::init_kernel_tables(&kernel_store)?;

        let (out, rx) = crossbeam_channel::unbounded();
        let sender_thread = std::thread::spawn(move || Self::sender_loop(rx, writer));

        let server = Self {
            settings,
            kernel_store,
            shared: Some(Arc::new(ServerShared {
                out,
                callbacks: CallbackRegistry::new(),
            })),
            sessions: HashMap::new(),
            window_to_session: HashMap::new(),
            next_session_id: 0,
            sender_thread: Some(sender_thread),
        };
        server.sync_settings_to_store()?;
        Ok(server)
    }

    fn init_kernel_tables(store: &Store) -> Result<()> {
        store.execute(
            "CREATE TABLE IF NOT EXISTS embedding_config (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 config_name TEXT NOT NULL UNIQUE,
                 model_name TEXT NOT NULL,
                 model_path TEXT NOT NULL,
                 max_input_length INTEGER NOT NULL
             )",
        )?;
        store.execute(
            "CREATE TABLE IF NOT EXISTS reranker_model (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 model_path TEXT NOT NULL
             )",
        )?;
        store.execute(
            "CREATE TABLE IF NOT EXISTS repository (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 path TEXT NOT NULL
             )",
        )?;
        store.execute(
            "CREATE TABLE IF NOT EXISTS generation_model (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 model_name TEXT NOT NULL,
                 url TEXT NOT NULL,
                 api_key TEXT NOT NULL
             )",
        )?;
        Ok(())
    }

    /// Mirror settings.json into the kernel database so other tooling can
    /// read the active configuration relationally.
    fn sync_settings_to_store(&self) -> Result<()> {
        let store = &self.kernel_store;
        let settings = &self.settings;
        store.block_on(async {
            let mut tx = store.pool.begin().await.map_err(StoreError::from)?;

            sqlx::query("DELETE FROM embedding_config").execute(&mut *tx).await.map_err(StoreError::from)?;
            for config in &settings.search_settings.embedding_config.configs {
                sqlx::query(
                    "INSERT INTO embedding_config (config_name, model_name, model_path, max_input_length)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&config.config_name)
                .bind(&config.model_name)
                .bind(&config.model_path)
                .bind(config.max_input_length)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            }

            sqlx::query("DELETE FROM reranker_model").execute(&mut *tx).await.map_err(StoreError::from)?;
            for config in &settings.search_settings.rerank_config.configs {
                sqlx::query("INSERT INTO reranker_model (name, model_path) VALUES (?1, ?2)")
                    .bind(&config.name)
                    .bind(&config.model_path)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::from)?;
            }

            sqlx::query("DELETE FROM generation_model").execute(&mut *tx).await.map_err(StoreError::from)?;
            for model in &settings.conversation_settings.generation_model {
                sqlx::query(
                    "INSERT INTO generation_model (name, model_name, url, api_key)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&model.name)
                .bind(&model.model_name)
                .bind(&model.url)
                .bind(&model.api_key)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            }

            tx.commit().await.map_err(StoreError::from)?;
            Ok::<_, StoreError>(())
        })?;
        Ok(())
    }

    fn sender_loop(rx: Receiver<Envelope>, mut writer: Box<dyn Write + Send>) {
        while let Ok(envelope) = rx.recv() {
            match serde_json::to_string(&envelope) {
                Ok(line) => {
                    if writeln!(writer, "{}", line).and_then(|_| writer.flush()).is_err() {
                        tracing::error!("outbound writer failed, stopping sender");
                        return;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize outbound message"),
            }
        }
    }

    fn shared(&self) -> &Arc<ServerShared> {
        self.shared.as_ref().expect("server shared state alive")
    }

    /// Dispatcher loop: one JSON message per input line until EOF or
    /// `stopAll`.
    pub fn run<R: BufRead>(&mut self, input: R) -> Result<()> {
        self.shared()
            .send(Envelope::notify(SERVER_SESSION_ID, json!({"type": "ready"})));

        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed message");
                    continue;
                }
            };

            let stop = matches!(envelope.message_type(), Some("stopAll"));
            self.dispatch(envelope);
            if stop {
                break;
            }
        }

        self.stop_all_sessions();
        Ok(())
    }

    /// Route one inbound envelope.
    pub fn dispatch(&mut self, envelope: Envelope) {
        if envelope.session_id == SERVER_SESSION_ID || envelope.to_main {
            if envelope.is_reply {
                self.shared().callbacks.dispatch(&envelope);
                return;
            }
            let reply = self.handle_main(&envelope);
            self.shared().send(reply);
            return;
        }

        match self.sessions.get(&envelope.session_id) {
            Some(handle) => handle.send(envelope),
            None => {
                let reply = Envelope::reply_error(
                    &envelope,
                    StatusCode::SessionNotFound,
                    format!("no session with id {}", envelope.session_id),
                );
                self.shared().send(reply);
            }
        }
    }

    /// Handle a main-server request; all errors become status replies.
    pub fn handle_main(&mut self, envelope: &Envelope) -> Envelope {
        match envelope.message_type() {
            Some("stopAll") => {
                self.stop_all_sessions();
                Envelope::reply(envelope, None)
            }
            Some("getRepos") => match self.get_repos() {
                Ok(repos) => Envelope::reply(
                    envelope,
                    Some(json!({
                        "repos": repos
                            .into_iter()
                            .map(|(name, path)| json!({"name": name, "path": path}))
                            .collect::<Vec<_>>()
                    })),
                ),
                Err(e) => Envelope::reply_error(envelope, StatusCode::UnknownError, e.to_string()),
            },
            Some("createRepo") => self.handle_create_repo(envelope),
            Some("openRepo") => self.handle_open_repo(envelope),
            Some("closeRepo") => self.handle_close_repo(envelope),
            Some(other) => Envelope::reply_error(
                envelope,
                StatusCode::InvalidType,
                format!("invalid message type: {}", other),
            ),
            None => Envelope::reply_error(envelope, StatusCode::WrongParam, "message.type missing"),
        }
    }

    pub fn get_repos(&self) -> Result<Vec<(String, String)>> {
        let store = &self.kernel_store;
        let rows: Vec<(String, String)> = store.block_on(async {
            sqlx::query_as("SELECT name, path FROM repository ORDER BY name")
                .fetch_all(&store.pool)
                .await
                .map_err(StoreError::from)
        })?;
        Ok(rows)
    }

    /// Register a repository row; false when the name is already taken.
    fn register_repo(&self, name: &str, path: &str) -> Result<bool> {
        let store = &self.kernel_store;
        let inserted = store.block_on(async {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM repository WHERE name = ?1")
                    .bind(name)
                    .fetch_optional(&store.pool)
                    .await
                    .map_err(StoreError::from)?;
            if existing.is_some() {
                return Ok::<_, StoreError>(false);
            }
            sqlx::query("INSERT INTO repository (name, path) VALUES (?1, ?2)")
                .bind(name)
                .bind(path)
                .execute(&store.pool)
                .await
                .map_err(StoreError::from)?;
            Ok(true)
        })?;
        Ok(inserted)
    }

    fn handle_create_repo(&mut self, envelope: &Envelope) -> Envelope {
        let Some(name) = envelope.message_str("repoName") else {
            return Envelope::reply_error(envelope, StatusCode::WrongParam, "repoName missing");
        };
        let Some(path) = envelope.message_str("path") else {
            return Envelope::reply_error(envelope, StatusCode::WrongParam, "path missing");
        };
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Envelope::reply_error(envelope, StatusCode::WrongParam, "invalid repoName");
        }
        let dir = PathBuf::from(path);
        if !dir.is_dir() {
            return Envelope::reply_error(
                envelope,
                StatusCode::InvalidPath,
                format!("not a directory: {}", path),
            );
        }
        match self.register_repo(name, path) {
            Ok(true) => Envelope::reply(envelope, None),
            Ok(false) => Envelope::reply_error(
                envelope,
                StatusCode::RepoNameExists,
                format!("repository {} already exists", name),
            ),
            Err(e) => Envelope::reply_error(envelope, StatusCode::UnknownError, e.to_string()),
        }
    }

    fn handle_open_repo(&mut self, envelope: &Envelope) -> Envelope {
        let Some(name) = envelope.message_str("repoName") else {
            return Envelope::reply_error(envelope, StatusCode::WrongParam, "repoName missing");
        };
        let Some(window_id) = envelope.message_i64("windowId") else {
            return Envelope::reply_error(envelope, StatusCode::WrongParam, "windowId missing");
        };

        let repos = match self.get_repos() {
            Ok(repos) => repos,
            Err(e) => {
                return Envelope::reply_error(envelope, StatusCode::UnknownError, e.to_string())
            }
        };
        let Some((_, path)) = repos.iter().find(|(n, _)| n.as_str() == name) else {
            return Envelope::reply_error(
                envelope,
                StatusCode::RepoNotFound,
                format!("repository {} is not registered", name),
            );
        };
        // The frontend may pin the path it expects; mismatch is an error.
        if let Some(expected) = envelope.message_str("path") {
            if expected != path.as_str() {
                return Envelope::reply_error(
                    envelope,
                    StatusCode::RepoNameNotMatch,
                    format!("repository {} is registered at {}", name, path),
                );
            }
        }

        // A window holds at most one session; replace any existing one.
        if let Some(old_id) = self.window_to_session.remove(&window_id) {
            if let Some(handle) = self.sessions.remove(&old_id) {
                handle.shutdown();
            }
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let config = SessionConfig {
            session_id,
            window_id,
            repo_name: name.to_string(),
            repo_path: PathBuf::from(path),
            embedding_configs: self
                .settings
                .search_settings
                .embedding_config
                .configs
                .clone(),
            generation_models: self.settings.conversation_settings.generation_model.clone(),
        };
        let handle = session::spawn(config, self.shared());
        self.sessions.insert(session_id, handle);
        self.window_to_session.insert(window_id, session_id);

        Envelope::reply(envelope, Some(json!({ "sessionId": session_id })))
    }

    fn handle_close_repo(&mut self, envelope: &Envelope) -> Envelope {
        let Some(name) = envelope.message_str("repoName") else {
            return Envelope::reply_error(envelope, StatusCode::WrongParam, "repoName missing");
        };
        let ids: Vec<i64> = self
            .sessions
            .iter()
            .filter(|(_, handle)| handle.repo_name == name)
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Envelope::reply_error(
                envelope,
                StatusCode::RepoNotFound,
                format!("repository {} is not open", name),
            );
        }
        for id in ids {
            if let Some(handle) = self.sessions.remove(&id) {
                self.window_to_session.remove(&handle.window_id);
                handle.shutdown();
            }
        }
        Envelope::reply(envelope, None)
    }

    pub fn stop_all_sessions(&mut self) {
        self.window_to_session.clear();
        for (_, handle) in self.sessions.drain() {
            handle.shutdown();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Drop for KernelServer {
    fn drop(&mut self) {
        self.stop_all_sessions();
        // Dropping the last sender ends the sender loop.
        self.shared = None;
        if let Some(handle) = self.sender_thread.take() {
            let _ = handle.join();
        }
    }
}

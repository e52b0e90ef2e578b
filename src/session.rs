//! Per-window session: one repository, one message queue, one worker
//! thread, and the retrieval-augmented conversation loop.
//!
//! The session thread owns its repository. Index progress flows back to
//! the frontend as `embeddingState` messages; once the repository is open
//! the session announces itself with `sessionPrepared`. The conversation
//! loop chains plan → retrieve → evaluate → answer, re-searching up to
//! three times when the model judges the context insufficient.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use serde_json::{json, Value};

use crate::error::{KernelError, Result};
use crate::llm::{LlmClient, LlmConv};
use crate::protocol::{Envelope, StatusCode};
use crate::repository::{Reporters, Repository, SearchResult};
use crate::server::{GenerationModel, ServerShared};
use crate::store::EmbeddingConfig;

/// Maximum evaluate-and-research rounds before answering anyway.
const MAX_SEARCH_ROUNDS: usize = 3;

/// Total results budget spread across a round's keywords.
const RETRIEVAL_BUDGET: usize = 10;

const PLAN_PROMPT: &str = "You are a search query optimizer. Generate the most effective \
    search keywords for retrieving information about the user's question. Return ONLY the \
    search terms, one per line, inside a ```search fence, without explanation.";

const EVAL_PROMPT: &str = "Evaluate whether the retrieved information below is sufficient \
    to answer the question. If it is sufficient, respond with \"YES\". If not, respond with \
    \"NO\" and provide improved search keywords, one per line, inside a ```search fence.";

const ANSWER_PROMPT: &str = "Answer the user's question using the retrieved information \
    above. Cite the document paths you relied on.";

/// Everything a session needs at spawn time.
pub struct SessionConfig {
    pub session_id: i64,
    pub window_id: i64,
    pub repo_name: String,
    pub repo_path: PathBuf,
    pub embedding_configs: Vec<EmbeddingConfig>,
    pub generation_models: Vec<GenerationModel>,
}

/// Server-side handle to a running session thread.
pub struct SessionHandle {
    pub session_id: i64,
    pub window_id: i64,
    pub repo_name: String,
    tx: Sender<Envelope>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
    }

    /// Signal cancellation and wait for the worker to drain.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        drop(self.tx);
        let _ = self.thread.join();
    }
}

struct Session {
    session_id: i64,
    #[allow(dead_code)]
    window_id: i64,
    repo_name: String,
    repo_path: PathBuf,
    embedding_configs: Vec<EmbeddingConfig>,
    generation_models: Vec<GenerationModel>,
    server: Weak<ServerShared>,
    stop: Arc<AtomicBool>,
}

/// Spawn the session worker thread.
pub fn spawn(config: SessionConfig, server: &Arc<ServerShared>) -> SessionHandle {
    let (tx, rx) = crossbeam_channel::unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let session = Session {
        session_id: config.session_id,
        window_id: config.window_id,
        repo_name: config.repo_name.clone(),
        repo_path: config.repo_path,
        embedding_configs: config.embedding_configs,
        generation_models: config.generation_models,
        server: Arc::downgrade(server),
        stop: Arc::clone(&stop),
    };
    let thread = std::thread::spawn(move || session.run(rx));
    SessionHandle {
        session_id: config.session_id,
        window_id: config.window_id,
        repo_name: config.repo_name,
        tx,
        stop,
        thread,
    }
}

impl Session {
    fn send(&self, envelope: Envelope) {
        if let Some(server) = self.server.upgrade() {
            server.send(envelope);
        }
    }

    fn notify(&self, message: Value) {
        self.send(Envelope::notify(self.session_id, message));
    }

    fn reporters(&self) -> Reporters {
        let session_id = self.session_id;
        let server = self.server.clone();
        let send = move |message: Value| {
            if let Some(server) = server.upgrade() {
                server.send(Envelope::notify(session_id, message));
            }
        };
        let send = Arc::new(send);

        let on_state = {
            let send = Arc::clone(&send);
            move |paths: &[String]| {
                for path in paths {
                    send(json!({
                        "type": "embeddingState",
                        "filePath": path,
                        "status": "embedding",
                        "progress": 0.0,
                    }));
                }
            }
        };
        let on_progress = {
            let send = Arc::clone(&send);
            move |path: &str, progress: f64| {
                send(json!({
                    "type": "embeddingState",
                    "filePath": path,
                    "status": "embedding",
                    "progress": progress,
                }));
            }
        };
        let on_done = {
            let send = Arc::clone(&send);
            move |path: &str| {
                send(json!({
                    "type": "embeddingState",
                    "filePath": path,
                    "status": "done",
                    "progress": 1.0,
                }));
            }
        };

        Reporters {
            doc_state: Some(Arc::new(on_state)),
            progress: Some(Arc::new(on_progress)),
            done: Some(Arc::new(on_done)),
        }
    }

    fn run(self, rx: Receiver<Envelope>) {
        let mut repository =
            match Repository::open(&self.repo_name, &self.repo_path, self.reporters()) {
                Ok(repo) => repo,
                Err(e) => {
                    tracing::error!(repo = %self.repo_name, error = %e, "failed to open repository");
                    self.notify(json!({
                        "type": "sessionPrepared",
                        "sessionId": self.session_id,
                        "repoName": self.repo_name,
                        "error": e.to_string(),
                    }));
                    return;
                }
            };
        if let Err(e) = repository.configure_embedding(&self.embedding_configs) {
            tracing::error!(repo = %self.repo_name, error = %e, "embedding configuration failed");
        }

        self.notify(json!({
            "type": "sessionPrepared",
            "sessionId": self.session_id,
            "repoName": self.repo_name,
            "path": self.repo_path.display().to_string(),
        }));

        // Queue drains until the server drops its sender.
        while let Ok(envelope) = rx.recv() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.handle(envelope, &repository);
        }
        repository.stop_background();
    }

    /// Message boundary: internal failures become error replies, never a
    /// dead session thread.
    fn handle(&self, envelope: Envelope, repository: &Repository) {
        if envelope.is_reply {
            if let Some(server) = self.server.upgrade() {
                server.callbacks.dispatch(&envelope);
            }
            return;
        }

        let reply = match envelope.message_type() {
            Some("search") => self.handle_search(&envelope, repository),
            Some("conversation") => self.handle_conversation(&envelope, repository),
            Some(other) => Err((
                StatusCode::InvalidType,
                format!("invalid message type: {}", other),
            )),
            None => Err((StatusCode::WrongParam, "message.type missing".to_string())),
        };

        match reply {
            Ok(data) => self.send(Envelope::reply(&envelope, data)),
            Err((code, message)) => self.send(Envelope::reply_error(&envelope, code, message)),
        }
    }

    fn handle_search(
        &self,
        envelope: &Envelope,
        repository: &Repository,
    ) -> std::result::Result<Option<Value>, (StatusCode, String)> {
        let query = envelope
            .message_str("query")
            .ok_or((StatusCode::WrongParam, "query missing".to_string()))?;
        let limit = envelope.message_i64("limit").unwrap_or(10).max(1) as usize;

        let results = repository
            .search(query, limit)
            .map_err(|e| (StatusCode::UnknownError, e.to_string()))?;
        Ok(Some(json!({ "results": results_to_json(&results) })))
    }

    fn handle_conversation(
        &self,
        envelope: &Envelope,
        repository: &Repository,
    ) -> std::result::Result<Option<Value>, (StatusCode, String)> {
        let query = envelope
            .message_str("query")
            .ok_or((StatusCode::WrongParam, "query missing".to_string()))?;

        let mut emit = |event: Value| {
            let mut message = event;
            if let Some(map) = message.as_object_mut() {
                map.insert("type".to_string(), json!("conversationEvent"));
            }
            self.notify(message);
        };
        let answer = self
            .run_conversation(repository, query, &mut emit)
            .map_err(|e| (StatusCode::UnknownError, e.to_string()))?;
        Ok(Some(json!({ "answer": answer })))
    }

    /// Plan → retrieve → evaluate (≤3 rounds) → answer.
    fn run_conversation(
        &self,
        repository: &Repository,
        query: &str,
        emit: &mut dyn FnMut(Value),
    ) -> Result<String> {
        let model = self.generation_models.first().ok_or_else(|| {
            KernelError::Input("no generation model configured".to_string())
        })?;
        let client = Arc::new(LlmClient::new(&model.api_key, &model.url)?);
        let mut conv = LlmConv::new(Arc::clone(&client), &model.model_name);

        // 1. Plan: ask for search keywords.
        conv.set_message("system", PLAN_PROMPT);
        conv.set_message("user", query);
        let plan = conv.get_response()?;
        let mut keywords = extract_search_keywords(&plan);

        let mut round = 0;
        while round < MAX_SEARCH_ROUNDS && !keywords.is_empty() {
            if self.stop.load(Ordering::Relaxed) {
                client.abort();
                return Err(KernelError::Unknown("conversation cancelled".to_string()));
            }

            // 2. Retrieve.
            emit(json!({ "kind": "retrieval", "round": round, "keywords": keywords }));
            let per_keyword = (RETRIEVAL_BUDGET / keywords.len()).max(1);
            let mut block = String::from("```retrieved_information\n");
            for keyword in &keywords {
                let results = repository.search(keyword, per_keyword)?;
                for list in &results {
                    for result in list {
                        emit(json!({
                            "kind": "retrieved",
                            "keyword": keyword,
                            "chunkId": result.chunk_id,
                            "score": result.score,
                        }));
                        block.push_str(&result.metadata);
                        block.push('\n');
                        block.push_str(&result.content);
                        block.push_str("\n\n");
                    }
                }
            }
            block.push_str("```");

            // 3. Evaluate: YES proceeds, NO with fresh keywords loops.
            conv.set_message("user", &format!("{}\n\n{}", EVAL_PROMPT, block));
            let evaluation = conv.get_response()?;
            if evaluation.to_uppercase().contains("YES") {
                break;
            }
            let next = extract_search_keywords(&evaluation);
            if next.is_empty() {
                break;
            }
            keywords = next;
            round += 1;
        }

        // 4. Answer, streamed.
        conv.set_message("user", ANSWER_PROMPT);
        let mut on_delta = |fragment: &str| {
            emit(json!({ "kind": "answer", "delta": fragment }));
        };
        let answer = conv.get_stream_response(&mut on_delta)?;
        emit(json!({ "kind": "done" }));
        Ok(answer)
    }
}

fn results_to_json(results: &[Vec<SearchResult>]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|list| {
                Value::Array(
                    list.iter()
                        .map(|r| {
                            json!({
                                "chunkId": r.chunk_id,
                                "score": r.score,
                                "content": r.content,
                                "metadata": r.metadata,
                            })
                        })
                        .collect(),
                )
            })
            .collect(),
    )
}

/// Pull search keywords out of a model response: the body of a
/// ```` ```search ```` fence when present, otherwise every non-empty
/// line. One keyword per line.
pub fn extract_search_keywords(text: &str) -> Vec<String> {
    let body: &str = match text.find("```search") {
        Some(start) => {
            let after = &text[start + "```search".len()..];
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => text,
    };
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .map(String::from)
        .collect()
}

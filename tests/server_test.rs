//! Server frontend tests: envelope dispatch, status codes, and the
//! repository registry. Outbound traffic is captured through an injected
//! writer.

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pocketrag::protocol::{Envelope, StatusCode, SERVER_SESSION_ID};
use pocketrag::server::KernelServer;
use serde_json::json;
use tempfile::TempDir;

/// Shared buffer standing in for stdout.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.text().contains(needle) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn request(message: serde_json::Value) -> Envelope {
    Envelope {
        session_id: SERVER_SESSION_ID,
        to_main: true,
        is_reply: false,
        callback_id: 1,
        message,
        status: None,
        data: None,
    }
}

fn new_server() -> (KernelServer, Captured, TempDir) {
    let user_data = TempDir::new().unwrap();
    let captured = Captured::default();
    let server = KernelServer::with_writer(user_data.path(), Box::new(captured.clone())).unwrap();
    (server, captured, user_data)
}

#[test]
fn test_settings_file_created_with_defaults() {
    let (_server, _captured, user_data) = new_server();
    let text = std::fs::read_to_string(user_data.path().join("settings.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(value["searchSettings"]["embeddingConfig"]["configs"].is_array());
    assert!(value["conversationSettings"]["generationModel"].is_array());
}

#[test]
fn test_create_repo_validations() {
    let (mut server, _captured, _user_data) = new_server();
    let repo_dir = TempDir::new().unwrap();
    let repo_path = repo_dir.path().display().to_string();

    // Missing path.
    let reply = server.handle_main(&request(json!({"type": "createRepo", "repoName": "r"})));
    assert_eq!(reply.status.unwrap().code, StatusCode::WrongParam);

    // Nonexistent directory.
    let reply = server.handle_main(&request(
        json!({"type": "createRepo", "repoName": "r", "path": "/definitely/not/here"}),
    ));
    assert_eq!(reply.status.unwrap().code, StatusCode::InvalidPath);

    // Happy path.
    let reply = server.handle_main(&request(
        json!({"type": "createRepo", "repoName": "r", "path": repo_path}),
    ));
    assert_eq!(reply.status.unwrap().code, StatusCode::Success);

    // Duplicate name.
    let reply = server.handle_main(&request(
        json!({"type": "createRepo", "repoName": "r", "path": repo_path}),
    ));
    assert_eq!(reply.status.unwrap().code, StatusCode::RepoNameExists);

    // Registry lists it.
    let repos = server.get_repos().unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].0, "r");
}

#[test]
fn test_open_repo_errors() {
    let (mut server, _captured, _user_data) = new_server();

    let reply = server.handle_main(&request(
        json!({"type": "openRepo", "repoName": "missing", "windowId": 1}),
    ));
    assert_eq!(reply.status.unwrap().code, StatusCode::RepoNotFound);

    // Registered but opened with a mismatched path pin.
    let repo_dir = TempDir::new().unwrap();
    let reply = server.handle_main(&request(json!({
        "type": "createRepo",
        "repoName": "pinned",
        "path": repo_dir.path().display().to_string(),
    })));
    assert_eq!(reply.status.unwrap().code, StatusCode::Success);
    let reply = server.handle_main(&request(json!({
        "type": "openRepo",
        "repoName": "pinned",
        "windowId": 1,
        "path": "/some/other/place",
    })));
    assert_eq!(reply.status.unwrap().code, StatusCode::RepoNameNotMatch);
}

#[test]
fn test_unknown_type_and_unknown_session() {
    let (mut server, captured, _user_data) = new_server();

    let reply = server.handle_main(&request(json!({"type": "fhqwhgads"})));
    assert_eq!(reply.status.unwrap().code, StatusCode::InvalidType);

    // A message addressed to a session nobody opened.
    server.dispatch(Envelope {
        session_id: 42,
        to_main: false,
        is_reply: false,
        callback_id: 9,
        message: json!({"type": "search", "query": "x"}),
        status: None,
        data: None,
    });
    assert!(captured.wait_for("SESSION_NOT_FOUND", Duration::from_secs(2)));
}

#[test]
fn test_open_repo_spawns_session_and_search_works() {
    let (mut server, captured, _user_data) = new_server();
    let repo_dir = TempDir::new().unwrap();
    std::fs::write(repo_dir.path().join("facts.md"), "# Facts\nThe fox is quick\n").unwrap();

    let reply = server.handle_main(&request(json!({
        "type": "createRepo",
        "repoName": "facts",
        "path": repo_dir.path().display().to_string(),
    })));
    assert_eq!(reply.status.unwrap().code, StatusCode::Success);

    let reply = server.handle_main(&request(
        json!({"type": "openRepo", "repoName": "facts", "windowId": 7}),
    ));
    let status = reply.status.clone().unwrap();
    assert_eq!(status.code, StatusCode::Success);
    let session_id = reply.data.unwrap()["sessionId"].as_i64().unwrap();
    assert_eq!(server.session_count(), 1);

    assert!(
        captured.wait_for("sessionPrepared", Duration::from_secs(10)),
        "session never announced itself: {}",
        captured.text()
    );
    // Give the background sweeper a chance to ingest the file.
    assert!(
        captured.wait_for("\"status\":\"done\"", Duration::from_secs(10)),
        "ingest never finished: {}",
        captured.text()
    );

    server.dispatch(Envelope {
        session_id,
        to_main: false,
        is_reply: false,
        callback_id: 11,
        message: json!({"type": "search", "query": "fox", "limit": 5}),
        status: None,
        data: None,
    });
    assert!(
        captured.wait_for("\"callbackId\":11", Duration::from_secs(10)),
        "search reply missing: {}",
        captured.text()
    );
    assert!(captured.text().contains("quick"));

    let reply = server.handle_main(&request(json!({"type": "closeRepo", "repoName": "facts"})));
    assert_eq!(reply.status.unwrap().code, StatusCode::Success);
    assert_eq!(server.session_count(), 0);
}

#[test]
fn test_run_emits_ready_and_honors_stop_all() {
    let (mut server, captured, _user_data) = new_server();
    let input = br#"{"sessionId":-1,"toMain":true,"callbackId":3,"message":{"type":"getRepos"}}
{"sessionId":-1,"toMain":true,"callbackId":4,"message":{"type":"stopAll"}}
{"sessionId":-1,"toMain":true,"callbackId":5,"message":{"type":"getRepos"}}
"#;
    server.run(&input[..]).unwrap();

    assert!(captured.wait_for("\"ready\"", Duration::from_secs(2)));
    assert!(captured.wait_for("\"callbackId\":3", Duration::from_secs(2)));
    assert!(captured.wait_for("\"callbackId\":4", Duration::from_secs(2)));
    // The line after stopAll is never processed.
    assert!(!captured.text().contains("\"callbackId\":5"));
}

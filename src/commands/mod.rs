//! Remote commands sent by connected clients
//!
//! Clients send `{ reqId, action, payload }` messages and get an `ack` or an
//! `err` back with the same `reqId`. File uploads arrive over HTTP and are
//! answered the same way once the status code has been decided.

use serde::{Deserialize, Serialize};

use crate::engine::TreeSyncEngine;
use crate::error::EngineError;
use crate::traits::Authorizer;

pub const NOT_PERMITTED: &str = "Operation is not permitted";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum RemoteAction {
    WriteFile {
        pathname: String,
        data: String,
    },
    Mkdir {
        pathname: String,
    },
    Rename {
        #[serde(rename = "oldPath")]
        old_path: String,
        #[serde(rename = "newPath")]
        new_path: String,
    },
    Rm {
        pathname: String,
    },
}

impl RemoteAction {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteAction::WriteFile { .. } => "writeFile",
            RemoteAction::Mkdir { .. } => "mkdir",
            RemoteAction::Rename { .. } => "rename",
            RemoteAction::Rm { .. } => "rm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteRequest {
    #[serde(rename = "reqId")]
    pub req_id: u64,
    #[serde(flatten)]
    pub action: RemoteAction,
}

impl RemoteRequest {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteReply {
    Ack {
        #[serde(rename = "reqId")]
        req_id: u64,
    },
    Err {
        #[serde(rename = "reqId")]
        req_id: u64,
        kind: String,
        message: String,
    },
}

impl RemoteReply {
    pub fn ack(req_id: u64) -> Self {
        RemoteReply::Ack { req_id }
    }

    pub fn err(req_id: u64, kind: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteReply::Err {
            req_id,
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn from_result(req_id: u64, result: Result<(), EngineError>) -> Self {
        match result {
            Ok(()) => Self::ack(req_id),
            Err(e) => Self::err(req_id, e.kind(), e.to_string()),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, RemoteReply::Ack { .. })
    }
}

/// Authorize `client_id`, then run the request against the engine
pub async fn handle_request(
    engine: &TreeSyncEngine,
    authorizer: &dyn Authorizer,
    client_id: u64,
    request: RemoteRequest,
) -> RemoteReply {
    if !authorizer.is_trusted_client(client_id) {
        tracing::warn!(client_id, action = request.action.name(), "Rejected command from untrusted client");
        return RemoteReply::err(request.req_id, "not_permitted", NOT_PERMITTED);
    }
    dispatch(engine, request).await
}

/// Run an already authorized request
pub async fn dispatch(engine: &TreeSyncEngine, request: RemoteRequest) -> RemoteReply {
    let RemoteRequest { req_id, action } = request;
    tracing::debug!(req_id, action = action.name(), "Dispatching remote command");

    let result = match action {
        RemoteAction::WriteFile { pathname, data } => engine.write_file(&pathname, data).await,
        RemoteAction::Mkdir { pathname } => engine.mkdir(&pathname).await,
        RemoteAction::Rename { old_path, new_path } => engine.rename(&old_path, &new_path).await,
        RemoteAction::Rm { pathname } => engine.remove(&pathname).await,
    };

    if let Err(e) = &result {
        tracing::warn!(req_id, error = %e, "Remote command failed");
    }
    RemoteReply::from_result(req_id, result)
}

/// One multipart upload: the form fields plus the single file it carries
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub client_id: u64,
    pub client_ip: String,
    pub token: String,
    pub req_id: u64,
    pub filename: String,
    pub data: Vec<u8>,
}

/// HTTP answer to an upload, plus the reply owed to the client on its command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Forbidden,
    UnknownClient,
    Handled(RemoteReply),
}

impl UploadOutcome {
    pub fn status(&self) -> u16 {
        match self {
            UploadOutcome::Forbidden => 403,
            UploadOutcome::UnknownClient => 404,
            UploadOutcome::Handled(_) => 200,
        }
    }
}

pub async fn handle_upload(
    engine: &TreeSyncEngine,
    authorizer: &dyn Authorizer,
    upload: UploadRequest,
) -> UploadOutcome {
    if !authorizer.is_trusted_token(upload.client_id, &upload.client_ip, &upload.token) {
        tracing::warn!(client_id = upload.client_id, ip = %upload.client_ip, "Rejected upload with untrusted token");
        return UploadOutcome::Forbidden;
    }
    if !authorizer.is_connected(upload.client_id) {
        tracing::warn!(client_id = upload.client_id, "Upload from unknown client");
        return UploadOutcome::UnknownClient;
    }

    tracing::debug!(req_id = upload.req_id, filename = %upload.filename, bytes = upload.data.len(), "Handling upload");
    let result = engine.write_file(&upload.filename, &upload.data).await;
    UploadOutcome::Handled(RemoteReply::from_result(upload.req_id, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SwitchOptions};
    use crate::mocks::{ManualWatcher, RecordedBroadcaster, StaticAuthorizer};
    use crate::traits::{RawEvent, RawEventKind};
    use crate::production::StaticRouteTable;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn engine(cwd: &TempDir) -> Arc<TreeSyncEngine> {
        let engine = TreeSyncEngine::start(
            EngineConfig::with_cwd(cwd.path()),
            SwitchOptions::dirname("assets"),
            Arc::new(ManualWatcher::new()),
            Arc::new(StaticRouteTable::new()),
            Arc::new(RecordedBroadcaster::new()),
        )
        .await
        .unwrap();
        Arc::new(engine)
    }

    #[test]
    fn test_parse_requests() {
        let request = RemoteRequest::parse(
            r#"{ "reqId": 7, "action": "rename", "payload": { "oldPath": "a.txt", "newPath": "b.txt" } }"#,
        )
        .unwrap();
        assert_eq!(request.req_id, 7);
        assert_eq!(
            request.action,
            RemoteAction::Rename {
                old_path: "a.txt".to_string(),
                new_path: "b.txt".to_string()
            }
        );

        let request = RemoteRequest::parse(r#"{ "reqId": 1, "action": "rm", "payload": { "pathname": "x" } }"#).unwrap();
        assert_eq!(request.action.name(), "rm");

        assert!(RemoteRequest::parse(r#"{ "reqId": 1, "action": "chmod", "payload": {} }"#).is_err());
        assert!(RemoteRequest::parse(r#"{ "action": "rm", "payload": { "pathname": "x" } }"#).is_err());
    }

    #[test]
    fn test_reply_serialization() {
        assert_eq!(serde_json::to_value(RemoteReply::ack(3)).unwrap(), json!({ "type": "ack", "reqId": 3 }));
        assert_eq!(
            serde_json::to_value(RemoteReply::err(4, "idle", "nope")).unwrap(),
            json!({ "type": "err", "reqId": 4, "kind": "idle", "message": "nope" })
        );
    }

    #[tokio::test]
    async fn test_untrusted_client_is_not_permitted() {
        let cwd = TempDir::new().unwrap();
        let engine = engine(&cwd).await;

        let request = RemoteRequest {
            req_id: 9,
            action: RemoteAction::Mkdir { pathname: "d".to_string() },
        };
        let reply = handle_request(&engine, &StaticAuthorizer::deny_all(), 1, request).await;

        assert_eq!(reply, RemoteReply::err(9, "not_permitted", NOT_PERMITTED));
        assert!(!cwd.path().join("assets/d").exists());
    }

    #[tokio::test]
    async fn test_engine_errors_become_err_replies() {
        let cwd = TempDir::new().unwrap();
        let engine = engine(&cwd).await;
        let auth = StaticAuthorizer::trusting([1]);

        let request = RemoteRequest {
            req_id: 2,
            action: RemoteAction::WriteFile {
                pathname: "../escape.txt".to_string(),
                data: "x".to_string(),
            },
        };
        match handle_request(&engine, &auth, 1, request).await {
            RemoteReply::Err { req_id, kind, .. } => {
                assert_eq!(req_id, 2);
                assert_eq!(kind, "path_escape");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_authorization() {
        let cwd = TempDir::new().unwrap();
        let engine = engine(&cwd).await;
        let upload = UploadRequest {
            client_id: 1,
            client_ip: "127.0.0.1".to_string(),
            token: "secret".to_string(),
            req_id: 5,
            filename: "../up.bin".to_string(),
            data: vec![1, 2, 3],
        };

        let outcome = handle_upload(&engine, &StaticAuthorizer::deny_all(), upload.clone()).await;
        assert_eq!(outcome, UploadOutcome::Forbidden);
        assert_eq!(outcome.status(), 403);

        // token accepted, client gone
        struct Disconnected;
        impl Authorizer for Disconnected {
            fn is_trusted_client(&self, _: u64) -> bool {
                true
            }
            fn is_connected(&self, _: u64) -> bool {
                false
            }
            fn is_trusted_token(&self, _: u64, _: &str, _: &str) -> bool {
                true
            }
        }
        assert_eq!(handle_upload(&engine, &Disconnected, upload.clone()).await.status(), 404);

        let auth = StaticAuthorizer::trusting([1]).with_token(1, "secret");
        let outcome = handle_upload(&engine, &auth, upload).await;
        assert_eq!(outcome.status(), 200);
        assert!(matches!(outcome, UploadOutcome::Handled(RemoteReply::Err { req_id: 5, .. })));
        assert!(!cwd.path().join("up.bin").exists());
    }

    #[tokio::test]
    async fn test_upload_writes_file_and_acks() {
        let cwd = TempDir::new().unwrap();
        let watcher = Arc::new(ManualWatcher::new());
        let engine = Arc::new(
            TreeSyncEngine::start(
                EngineConfig::with_cwd(cwd.path()),
                SwitchOptions::dirname("assets"),
                watcher.clone(),
                Arc::new(StaticRouteTable::new()),
                Arc::new(RecordedBroadcaster::new()),
            )
            .await
            .unwrap(),
        );
        let auth = StaticAuthorizer::trusting([1]).with_token(1, "secret");
        let upload = UploadRequest {
            client_id: 1,
            client_ip: "127.0.0.1".to_string(),
            token: "secret".to_string(),
            req_id: 6,
            filename: "up.bin".to_string(),
            data: vec![1, 2, 3],
        };

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { handle_upload(&engine, &auth, upload).await })
        };
        let path = cwd.path().join("assets/up.bin");
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while std::fs::read(&path).map(|data| data.len()).unwrap_or(0) < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(watcher.emit(RawEvent::new(RawEventKind::Added, &path)));

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Handled(RemoteReply::ack(6)));
        assert_eq!(outcome.status(), 200);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(engine.find_in_tree("up.bin").is_some());
    }
}

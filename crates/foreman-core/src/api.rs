//! API - 外部メッセージの形
//!
//! Design:
//! - トランスポートは持たない。リクエスト / レスポンスの serde 型と、
//!   それを Coordinator に繋ぐ薄いファサード（`BlockerApi`）だけ。
//! - ファサードは `ApiResponse { status_code, body }` を返すので、
//!   HTTP でも RPC でもそのまま写せる。
//! - AlreadyResolved はエラーではなく 409 の正常応答。

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::blocker::{BlockerStats, BlockerView, ResolveOutcome};
use crate::coordinator::Coordinator;
use crate::domain::{
    BlockerError, BlockerId, BlockerStatus, BlockerType, ForemanError, ProjectId, TaskId, WorkerId,
};

// ========================================
// Messages
// ========================================

/// `POST /blockers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBlockerRequest {
    pub worker_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(rename = "type")]
    pub blocker_type: BlockerType,
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBlockerResponse {
    pub blocker_id: BlockerId,
}

/// `POST /blockers/{id}/resolve`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveBlockerRequest {
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveBlockerResponse {
    pub blocker_id: BlockerId,
    pub status: BlockerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// `GET /blockers?project_id&status?`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBlockersQuery {
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BlockerStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBlockersResponse {
    pub blockers: Vec<BlockerView>,
    pub total: usize,
    pub pending_count: usize,
    pub sync_count: usize,
    pub async_count: usize,
}

impl ListBlockersResponse {
    pub fn from_views(blockers: Vec<BlockerView>) -> Self {
        let rows = || blockers.iter().map(|v| &v.blocker);
        let pending_count = rows().filter(|b| b.status == BlockerStatus::Pending).count();
        let sync_count = rows().filter(|b| b.blocker_type == BlockerType::Sync).count();
        let async_count = rows().filter(|b| b.blocker_type == BlockerType::Async).count();
        Self {
            total: blockers.len(),
            pending_count,
            sync_count,
            async_count,
            blockers,
        }
    }
}

/// `GET /blockers/pending?worker_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBlockerQuery {
    pub worker_id: WorkerId,
}

/// Transport-neutral response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status_code: u16,
    pub body: Value,
}

impl ApiResponse {
    fn json<T: Serialize>(status_code: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status_code, body },
            Err(err) => ApiError::Internal(err.to_string()).into_response(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

// ========================================
// Errors
// ========================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::Unprocessable(_) => 422,
            ApiError::RateLimited(_) => 429,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn into_response(self) -> ApiResponse {
        ApiResponse {
            status_code: self.status_code(),
            body: json!({ "error": self.to_string() }),
        }
    }
}

impl From<ForemanError> for ApiError {
    fn from(err: ForemanError) -> Self {
        match err {
            ForemanError::Blocker(err) => err.into(),
            ForemanError::Graph(err) => ApiError::Unprocessable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BlockerError> for ApiError {
    fn from(err: BlockerError) -> Self {
        match err {
            BlockerError::NotFound(_) => ApiError::NotFound(err.to_string()),
            BlockerError::RateLimited { .. } => ApiError::RateLimited(err.to_string()),
            BlockerError::InvalidQuestion { .. } | BlockerError::InvalidAnswer { .. } | BlockerError::UnknownTask(_) => {
                ApiError::Unprocessable(err.to_string())
            }
        }
    }
}

// ========================================
// Facade
// ========================================

/// Blocker endpoints over one coordinator.
#[derive(Clone)]
pub struct BlockerApi {
    coordinator: Coordinator,
}

impl BlockerApi {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// `POST /blockers` -> 201 `{blocker_id}`
    pub async fn create_blocker(&self, request: CreateBlockerRequest) -> ApiResponse {
        let result = self
            .coordinator
            .create_blocker(
                request.worker_id,
                request.task_id,
                request.blocker_type,
                &request.question,
            )
            .await;
        match result {
            Ok(blocker) => ApiResponse::json(
                201,
                &CreateBlockerResponse {
                    blocker_id: blocker.id,
                },
            ),
            Err(err) => ApiError::from(err).into_response(),
        }
    }

    /// `POST /blockers/{id}/resolve` -> 200 `{status: RESOLVED}` | 409 `{error: AlreadyResolved}`
    pub async fn resolve_blocker(&self, blocker_id: BlockerId, request: ResolveBlockerRequest) -> ApiResponse {
        match self.coordinator.resolve_blocker(blocker_id, &request.answer).await {
            Ok(ResolveOutcome::Resolved(blocker)) => ApiResponse::json(
                200,
                &ResolveBlockerResponse {
                    blocker_id,
                    status: blocker.status,
                    resolved_at: blocker.resolved_at,
                },
            ),
            Ok(ResolveOutcome::AlreadyResolved { status }) => {
                let resolved_at = self
                    .coordinator
                    .blockers()
                    .get(blocker_id)
                    .await
                    .ok()
                    .and_then(|b| b.resolved_at);
                ApiResponse {
                    status_code: 409,
                    body: json!({
                        "error": "AlreadyResolved",
                        "blocker_id": blocker_id,
                        "status": status,
                        "resolved_at": resolved_at,
                    }),
                }
            }
            Err(err) => ApiError::from(err).into_response(),
        }
    }

    /// `GET /blockers?project_id&status?`
    pub async fn list_blockers(&self, query: ListBlockersQuery) -> ApiResponse {
        if let Err(err) = self.check_project(query.project_id) {
            return err.into_response();
        }
        let views = self.coordinator.list_blockers(query.status).await;
        ApiResponse::json(200, &ListBlockersResponse::from_views(views))
    }

    /// `GET /blockers/pending?worker_id` -> the oldest PENDING blocker or `null`.
    pub async fn pending_blocker(&self, query: PendingBlockerQuery) -> ApiResponse {
        let pending = self.coordinator.pending_blocker_for_worker(query.worker_id).await;
        ApiResponse::json(200, &pending)
    }

    /// `GET /blockers/{id}`
    pub async fn get_blocker(&self, blocker_id: BlockerId) -> ApiResponse {
        match self.coordinator.blockers().get(blocker_id).await {
            Ok(blocker) => ApiResponse::json(200, &blocker),
            Err(err) => ApiError::from(err).into_response(),
        }
    }

    /// `GET /projects/{id}/blockers/metrics`
    pub async fn blocker_metrics(&self, project_id: ProjectId) -> ApiResponse {
        if let Err(err) = self.check_project(project_id) {
            return err.into_response();
        }
        let stats: BlockerStats = self.coordinator.blockers().stats().await;
        ApiResponse::json(200, &stats)
    }

    fn check_project(&self, project_id: ProjectId) -> Result<(), ApiError> {
        if project_id == self.coordinator.project_id() {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!("project {project_id} not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForemanConfig;
    use crate::coordinator::testing::harness;
    use crate::domain::Role;

    fn api() -> (BlockerApi, Coordinator) {
        let h = harness(ForemanConfig::default(), &[]);
        (BlockerApi::new(h.coordinator.clone()), h.coordinator)
    }

    #[test]
    fn create_request_uses_type_field() {
        let raw = json!({
            "worker_id": WorkerId::from_raw(1),
            "type": "SYNC",
            "question": "which db?",
        });
        let request: CreateBlockerRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.blocker_type, BlockerType::Sync);
        assert_eq!(request.task_id, None);
    }

    #[tokio::test]
    async fn create_then_resolve_twice() {
        let (api, c) = api();
        let task = c.add_task("api", Role::Backend, vec![]).await.unwrap();
        let created = api
            .create_blocker(CreateBlockerRequest {
                worker_id: WorkerId::from_raw(1),
                task_id: Some(task),
                blocker_type: BlockerType::Async,
                question: "which db?".into(),
            })
            .await;
        assert_eq!(created.status_code, 201);
        let blocker_id: BlockerId = serde_json::from_value(created.body["blocker_id"].clone()).unwrap();

        let first = api
            .resolve_blocker(blocker_id, ResolveBlockerRequest { answer: "postgres".into() })
            .await;
        assert_eq!(first.status_code, 200);
        assert_eq!(first.body["status"], "RESOLVED");

        let second = api
            .resolve_blocker(blocker_id, ResolveBlockerRequest { answer: "sqlite".into() })
            .await;
        assert_eq!(second.status_code, 409);
        assert_eq!(second.body["error"], "AlreadyResolved");
        assert_eq!(c.blockers().get(blocker_id).await.unwrap().answer.as_deref(), Some("postgres"));
    }

    #[tokio::test]
    async fn error_statuses() {
        let (api, _c) = api();
        let empty = api
            .create_blocker(CreateBlockerRequest {
                worker_id: WorkerId::from_raw(1),
                task_id: None,
                blocker_type: BlockerType::Sync,
                question: "   ".into(),
            })
            .await;
        assert_eq!(empty.status_code, 422);

        let missing = api
            .resolve_blocker(BlockerId::from_raw(404), ResolveBlockerRequest { answer: "x".into() })
            .await;
        assert_eq!(missing.status_code, 404);

        let unknown_project = api
            .list_blockers(ListBlockersQuery {
                project_id: ProjectId::from_raw(12345),
                status: None,
            })
            .await;
        assert_eq!(unknown_project.status_code, 404);
    }

    #[tokio::test]
    async fn list_counts_by_status_and_type() {
        let (api, c) = api();
        let worker = WorkerId::from_raw(1);
        for (blocker_type, question) in [
            (BlockerType::Sync, "approve schema?"),
            (BlockerType::Async, "naming ok?"),
            (BlockerType::Async, "which port?"),
        ] {
            c.create_blocker(worker, None, blocker_type, question).await.unwrap();
        }
        let first = c.blockers().list(None).await.pop().unwrap();
        c.resolve_blocker(first.id, "yes").await.unwrap();

        let response = api
            .list_blockers(ListBlockersQuery {
                project_id: c.project_id(),
                status: None,
            })
            .await;
        let list: ListBlockersResponse = serde_json::from_value(response.body).unwrap();
        assert_eq!(list.total, 3);
        assert_eq!(list.pending_count, 2);
        assert_eq!(list.sync_count, 1);
        assert_eq!(list.async_count, 2);

        let pending = api.pending_blocker(PendingBlockerQuery { worker_id: worker }).await;
        assert_eq!(pending.status_code, 200);
        assert!(pending.body.is_object());
    }
}

//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the orchestrator, the history store,
//! the drive listing, the drive monitor and the transfer settings file.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TransferConfigProvider;
use crate::context::AppContext;
use crate::core::{DriveMonitor, JobState, Orchestrator, StartOptions};
use crate::db;

use super::protocol::{Request, Response};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: AppContext,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.ctx.orchestrator
    }

    pub fn drives(&self) -> &Arc<DriveMonitor> {
        &self.ctx.drives
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "transfer.start" => self.transfer_start(id, params).await,
            "transfer.cancel" => self.transfer_cancel(id).await,
            "transfer.clear" => self.transfer_clear(id).await,
            "transfer.current" => Response::success(id, self.ctx.orchestrator.current()),
            "transfer.files" => Response::success(id, self.ctx.orchestrator.file_statuses().await),
            "transfer.last" => Response::success(id, self.ctx.orchestrator.last_result().await),
            "history.list" => self.history_list(id, params).await,
            "history.get" => self.history_get(id, params).await,
            "drives.list" => self.drives_list(id).await,
            "drives.files" => self.drives_files(id, params).await,
            "nas.speed_test" => match self.ctx.orchestrator.speed_test().await {
                Ok(report) => Response::success(id, report),
                Err(e) => Response::control_error(id, &e),
            },
            "config.get" => self.config_get(id).await,
            "config.update" => self.config_update(id, params).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            simulation: bool,
            rpc_bind: String,
            http_bind: String,
            state: JobState,
            job_id: Option<String>,
        }

        let snapshot = self.ctx.orchestrator.current();
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.ctx.started.elapsed().as_secs(),
                simulation: self.ctx.config.simulation,
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                http_bind: self.ctx.config.http_bind.to_string(),
                state: snapshot.state,
                job_id: snapshot.job_id,
            },
        )
    }

    async fn transfer_start(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            project: String,
            #[serde(flatten)]
            options: StartOptions,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self
            .ctx
            .orchestrator
            .start(&params.project, params.options)
            .await
        {
            Ok(job_id) => Response::success(id, serde_json::json!({ "job_id": job_id })),
            Err(e) => Response::control_error(id, &e),
        }
    }

    async fn transfer_cancel(&self, id: Value) -> Response {
        match self.ctx.orchestrator.cancel().await {
            Ok(()) => Response::success(id, serde_json::json!({ "cancelled": true })),
            Err(e) => Response::control_error(id, &e),
        }
    }

    async fn transfer_clear(&self, id: Value) -> Response {
        match self.ctx.orchestrator.clear().await {
            Ok(record) => Response::success(id, record),
            Err(e) => Response::control_error(id, &e),
        }
    }

    async fn history_list(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<u32>,
            #[serde(default)]
            offset: Option<u32>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => return Response::invalid_params(id, e.to_string()),
            }
        };

        let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let offset = params.offset.unwrap_or(0);

        match db::jobs::list(&self.ctx.db, limit, offset).await {
            Ok(jobs) => Response::success(id, jobs),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    async fn history_get(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match db::jobs::get_with_history(&self.ctx.db, params.id.clone()).await {
            Ok(Some(job)) => Response::success(id, job),
            Ok(None) => Response::not_found(id, format!("Job not found: {}", params.id)),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    async fn drives_list(&self, id: Value) -> Response {
        let probe = self.ctx.probe.clone();
        match tokio::task::spawn_blocking(move || probe.list_devices()).await {
            Ok(Ok(devices)) => Response::success(id, devices),
            Ok(Err(e)) => Response::internal_error(id, format!("{:#}", e)),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    /// List the files on the source drive, as a job would see them, so a
    /// client can build a `transfer.start` selection.
    async fn drives_files(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            source_subfolder: Option<String>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => return Response::invalid_params(id, e.to_string()),
            }
        };

        match self
            .ctx
            .orchestrator
            .preview_files(params.source_subfolder)
            .await
        {
            Ok(manifest) => Response::success(id, manifest),
            Err(e) => Response::control_error(id, &e),
        }
    }

    async fn config_get(&self, id: Value) -> Response {
        let provider = self.ctx.config_provider.clone();
        match tokio::task::spawn_blocking(move || provider.load()).await {
            Ok(Ok(config)) => Response::success(id, config.redacted()),
            Ok(Err(e)) => Response::internal_error(id, format!("{:#}", e)),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    /// Merge a partial `[transfer]` table into the config file. Takes effect
    /// at the next job start.
    async fn config_update(&self, id: Value, params: Value) -> Response {
        if !params.is_object() {
            return Response::invalid_params(id, "expected an object of transfer settings");
        }

        enum UpdateError {
            Rejected(anyhow::Error),
            Storage(anyhow::Error),
        }

        let provider = self.ctx.config_provider.clone();
        let result = tokio::task::spawn_blocking(move || {
            let current = provider.load().map_err(UpdateError::Storage)?;
            let updated = current.merged_with(&params).map_err(UpdateError::Rejected)?;
            provider.save(&updated).map_err(UpdateError::Storage)?;
            Ok::<_, UpdateError>(updated)
        })
        .await;

        match result {
            Ok(Ok(config)) => {
                tracing::info!(path = %self.ctx.config_provider.path().display(), "Transfer settings updated");
                Response::success(id, config.redacted())
            }
            Ok(Err(UpdateError::Rejected(e))) => Response::invalid_params(id, format!("{:#}", e)),
            Ok(Err(UpdateError::Storage(e))) => {
                tracing::error!(error = %format!("{:#}", e), "Failed to store transfer settings");
                Response::internal_error(id, format!("{:#}", e))
            }
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }
}

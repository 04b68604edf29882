// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP grading client.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

use super::{EXECUTOR_GRADE_PATH, GradingClient};
use crate::error::{Error, Result};
use crate::executor::{AutoAssessment, CapableExecutor, ExecutorRequest};

#[derive(Debug, Deserialize)]
struct ExecutorResponse {
    grade: i32,
    feedback: String,
}

/// Grading client that POSTs JSON to `{base_url}/v1/grade`.
#[derive(Clone)]
pub struct HttpGradingClient {
    http: reqwest::Client,
}

impl HttpGradingClient {
    /// Create a client with the same connect and read timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    /// Create a client from a preconfigured reqwest client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn grade_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), EXECUTOR_GRADE_PATH)
}

#[async_trait]
impl GradingClient for HttpGradingClient {
    async fn grade(
        &self,
        executor: &CapableExecutor,
        request: &ExecutorRequest,
    ) -> Result<AutoAssessment> {
        info!(executor_id = executor.id, executor = %executor.name, "Calling executor");

        let response = self
            .http
            .post(grade_url(&executor.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!(
                executor_id = executor.id,
                status = status.as_u16(),
                image = %request.image_name,
                "Executor returned error status"
            );
            return Err(Error::ExecutorCallFailed {
                status: Some(status.as_u16()),
                message: format!("executor responded with {}", status),
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            error!(executor_id = executor.id, "Executor response is empty");
            return Err(Error::ExecutorCallFailed {
                status: Some(status.as_u16()),
                message: "empty body".to_string(),
            });
        }

        let parsed: ExecutorResponse =
            serde_json::from_slice(&body).map_err(|e| Error::ExecutorCallFailed {
                status: Some(status.as_u16()),
                message: format!("unparseable body: {}", e),
            })?;

        Ok(AutoAssessment {
            grade: parsed.grade,
            feedback: parsed.feedback,
        })
    }
}

//! Platform API client.
//!
//! JSON-over-HTTP implementation of both collaborator traits against the
//! lab platform service. One failed call is one error: non-success
//! responses map straight to an upstream error carrying the status and
//! response body, and nothing is retried.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::config::RemoteConfig;
use crate::error::{LabError, Result};
use crate::model::{Lab, VmRecord};

use super::{
    CloudCompute, CreateLabRequest, LabAutomation, NewTemplateVm, ProvisionReceipt, SnapshotRef,
    TemplateVmStatus, VmDescriptor,
};

pub struct PlatformClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl PlatformClient {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build platform HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    async fn read<T: DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LabError::upstream(operation, format!("{status} - {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| LabError::upstream(operation, format!("invalid response body: {e}")))
    }

    async fn expect_success(operation: &str, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LabError::upstream(operation, format!("{status} - {body}")));
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .authorize(self.client.get(self.url(path)).query(query))
            .send()
            .await
            .map_err(|e| LabError::upstream(operation, format!("request failed: {e}")))?;
        Self::read(operation, response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .authorize(self.client.post(self.url(path)).json(body))
            .send()
            .await
            .map_err(|e| LabError::upstream(operation, format!("request failed: {e}")))?;
        Self::read(operation, response).await
    }

    async fn post_unit<B: Serialize>(&self, operation: &str, path: &str, body: &B) -> Result<()> {
        let response = self
            .authorize(self.client.post(self.url(path)).json(body))
            .send()
            .await
            .map_err(|e| LabError::upstream(operation, format!("request failed: {e}")))?;
        Self::expect_success(operation, response).await
    }

    async fn delete_unit(&self, operation: &str, path: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.url(path)))
            .send()
            .await
            .map_err(|e| LabError::upstream(operation, format!("request failed: {e}")))?;
        Self::expect_success(operation, response).await
    }
}

#[async_trait]
impl CloudCompute for PlatformClient {
    async fn list_running_labs(&self, course: Option<&str>) -> Result<Vec<Lab>> {
        let mut query = Vec::new();
        if let Some(course) = course {
            query.push(("course", course));
        }
        self.get("list_running_labs", "/api/v1/labs", &query).await
    }

    async fn list_published_labs(&self, course: &str) -> Result<Vec<Lab>> {
        self.get(
            "list_published_labs",
            "/api/v1/labs/published",
            &[("course", course)],
        )
        .await
    }

    async fn enroll(
        &self,
        course: &str,
        lab_id: &str,
        user_id: &str,
    ) -> Result<Option<VmRecord>> {
        self.post(
            "enroll",
            &format!("/api/v1/labs/{course}/{lab_id}/enroll"),
            &json!({ "user_id": user_id }),
        )
        .await
    }

    async fn publish_lab(&self, course: &str, lab_id: &str) -> Result<()> {
        self.post_unit(
            "publish_lab",
            &format!("/api/v1/labs/{course}/{lab_id}/publish"),
            &json!({}),
        )
        .await
    }

    async fn unpublish_lab(&self, course: &str, lab_id: &str) -> Result<()> {
        self.post_unit(
            "unpublish_lab",
            &format!("/api/v1/labs/{course}/{lab_id}/unpublish"),
            &json!({}),
        )
        .await
    }

    async fn power_start(&self, vm_id: &str) -> Result<()> {
        self.post_unit("power_start", &format!("/api/v1/vms/{vm_id}/start"), &json!({}))
            .await
    }

    async fn power_stop(&self, vm_id: &str, deallocate: bool) -> Result<()> {
        self.post_unit(
            "power_stop",
            &format!("/api/v1/vms/{vm_id}/stop"),
            &json!({ "deallocate": deallocate }),
        )
        .await
    }

    async fn create_template_vm(
        &self,
        user_id: &str,
        spec: &NewTemplateVm,
    ) -> Result<VmDescriptor> {
        self.post(
            "create_template_vm",
            &format!("/api/v1/template-vms/{user_id}"),
            spec,
        )
        .await
    }

    async fn template_vm_status(&self, user_id: &str) -> Result<TemplateVmStatus> {
        self.get(
            "template_vm_status",
            &format!("/api/v1/template-vms/{user_id}"),
            &[],
        )
        .await
    }

    async fn publish_snapshot(&self, user_id: &str, snapshot_name: &str) -> Result<SnapshotRef> {
        self.post(
            "publish_snapshot",
            &format!("/api/v1/template-vms/{user_id}/snapshot"),
            &json!({ "name": snapshot_name }),
        )
        .await
    }

    async fn discard_template_vm(&self, user_id: &str) -> Result<()> {
        self.delete_unit(
            "discard_template_vm",
            &format!("/api/v1/template-vms/{user_id}"),
        )
        .await
    }

    async fn search_snapshots(
        &self,
        course: &str,
        query: Option<&str>,
    ) -> Result<Vec<SnapshotRef>> {
        let mut params = vec![("course", course)];
        if let Some(q) = query {
            params.push(("q", q));
        }
        self.get("search_snapshots", "/api/v1/snapshots", &params).await
    }
}

#[async_trait]
impl LabAutomation for PlatformClient {
    async fn create_lab(&self, request: &CreateLabRequest) -> Result<ProvisionReceipt> {
        self.post("create_lab", "/api/v1/provision/labs", request).await
    }

    async fn delete_lab(&self, course: &str, lab_id: &str) -> Result<ProvisionReceipt> {
        self.post(
            "delete_lab",
            &format!("/api/v1/provision/labs/{course}/{lab_id}/delete"),
            &json!({}),
        )
        .await
    }
}

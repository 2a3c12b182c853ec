//! One province pull: resolve primary, then secondary, cross-check, persist.
//!
//! The whole pull runs under the province budget. On timeout the pull
//! future is dropped (in-flight requests are aborted with it) and the
//! cancel flag stops a persistence transaction that is already running on
//! the blocking pool from committing. A transaction that claimed its commit
//! before the budget ran out is awaited instead, so `Timeout` always means
//! nothing was written.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use metrics::histogram;
use serde::Serialize;

use crate::crosscheck::cross_check;
use crate::error::{IngestError, IngestResult};
use crate::ingest::repository::{RoleOutcome, SourceRepository};
use crate::ingest::types::{FetchContext, SourceRole};
use crate::store::{AlertKind, CancelFlag, IngestStore, PersistSummary, Severity};

/// Summary of a successful pull.
#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    pub province: String,
    pub duty_date: NaiveDate,
    pub primary: RoleOutcome,
    pub secondary: RoleOutcome,
    pub records: usize,
    pub corroborated: usize,
    pub degraded: usize,
    pub conflicts: usize,
    pub persisted: PersistSummary,
    pub elapsed_ms: u64,
}

pub struct Pipeline {
    repo: Arc<SourceRepository>,
    store: Arc<dyn IngestStore>,
    budget: Duration,
}

impl Pipeline {
    pub fn new(repo: Arc<SourceRepository>, store: Arc<dyn IngestStore>, budget: Duration) -> Self {
        Self { repo, store, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn repository(&self) -> &Arc<SourceRepository> {
        &self.repo
    }

    /// Provinces a full sync covers.
    pub async fn provinces_with_endpoints(&self) -> IngestResult<Vec<String>> {
        self.repo.provinces().await
    }

    /// Pull one province under the budget.
    pub async fn pull_province(&self, province_slug: &str) -> IngestResult<PullReport> {
        let cancel = CancelFlag::new();
        let t0 = Instant::now();
        let pull = self.pull_with(province_slug, &cancel);
        tokio::pin!(pull);
        let res = match tokio::time::timeout(self.budget, &mut pull).await {
            Ok(r) => r,
            Err(_) if cancel.cancel() => {
                tracing::warn!(
                    target: "ingest",
                    province = %province_slug,
                    budget_secs = self.budget.as_secs(),
                    "province pull timed out, cancelled"
                );
                Err(IngestError::Timeout {
                    province: province_slug.to_string(),
                    budget_secs: self.budget.as_secs(),
                })
            }
            Err(_) => {
                // The commit is already under way; report what it wrote.
                tracing::info!(
                    target: "ingest",
                    province = %province_slug,
                    "budget ran out during commit, waiting for it"
                );
                pull.await
            }
        };
        histogram!("province_pull_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        res
    }

    /// The pull itself, without the budget. `cancel` is honoured at commit.
    pub async fn pull_with(&self, province_slug: &str, cancel: &CancelFlag) -> IngestResult<PullReport> {
        let t0 = Instant::now();
        let slug = province_slug.trim().to_ascii_lowercase();
        let endpoints = self.repo.endpoints_for(&slug).await?;
        if endpoints.is_empty() {
            self.repo
                .alert(
                    &slug,
                    None,
                    AlertKind::NoActiveEndpoints,
                    Severity::Critical,
                    format!("no active endpoints configured for '{slug}'"),
                )
                .await;
            return Err(IngestError::NoEndpoint(slug));
        }

        let known = match self.store.known_districts(&slug).await {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(target: "ingest", province = %slug, error = %e, "known districts unavailable");
                Vec::new()
            }
        };
        let ctx = FetchContext::at(Utc::now(), known);

        // Primary is fully resolved before secondary starts.
        let primary = self
            .repo
            .resolve_role(&slug, SourceRole::Primary, &endpoints, &ctx)
            .await;
        let secondary = self
            .repo
            .resolve_role(&slug, SourceRole::Secondary, &endpoints, &ctx)
            .await;

        let output = cross_check(
            primary.batch.as_ref(),
            secondary.batch.as_ref(),
            secondary.configured,
            Utc::now(),
        );
        if output.is_empty() {
            tracing::warn!(
                target: "ingest",
                province = %slug,
                primary_ok = primary.succeeded(),
                secondary_ok = secondary.succeeded(),
                "no records after cross-check"
            );
            return Err(IngestError::NoRecords(slug));
        }

        let persisted = self
            .store
            .persist_province(&slug, &output, Utc::now(), cancel)
            .await?;

        // Before the rollover the sources may already list the coming day.
        let duty_date = output.records.first().map_or(ctx.duty_date, |r| r.duty_date);
        let report = PullReport {
            province: slug,
            duty_date,
            records: output.records.len(),
            corroborated: output
                .records
                .iter()
                .filter(|r| r.verification_source_count == 2)
                .count(),
            degraded: output.records.iter().filter(|r| r.is_degraded).count(),
            conflicts: output.conflicts.len(),
            primary,
            secondary,
            persisted,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        };
        tracing::info!(
            target: "ingest",
            province = %report.province,
            records = report.records,
            corroborated = report.corroborated,
            degraded = report.degraded,
            conflicts = report.conflicts,
            expired = report.persisted.expired,
            elapsed_ms = report.elapsed_ms,
            "province pull done"
        );
        Ok(report)
    }
}

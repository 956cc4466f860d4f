use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::core::time::primitive_now_utc;
use crate::repositories;
use crate::repositories::results::NewReportCardEntry;
use crate::services::contracts::{
    AggregationOutcome, BulkWriteReport, ExamContext, ExamReader, ResultUpdate, ResultWriter,
    SubmissionMarker, SubmissionRef,
};

#[derive(Clone)]
pub struct PgExamReader {
    pool: PgPool,
}

impl PgExamReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExamReader for PgExamReader {
    async fn exam_context(&self, exam_id: &str) -> Result<Option<ExamContext>> {
        let exam = repositories::exams::find_by_id(&self.pool, exam_id)
            .await
            .context("Failed to load exam")?;

        Ok(exam.map(|exam| ExamContext {
            exam_id: exam.id,
            subject_ref: exam.subject_ref,
            classroom_ref: exam.classroom_ref,
            session: exam.session,
            term: exam.term,
            total_marks: exam.total_marks,
        }))
    }

    async fn eligible_submissions(&self, exam_id: &str) -> Result<Vec<SubmissionRef>> {
        let rows = repositories::submissions::list_eligible_for_publish(&self.pool, exam_id)
            .await
            .context("Failed to list eligible submissions")?;

        Ok(rows
            .into_iter()
            .map(|row| SubmissionRef {
                submission_id: row.id,
                student_id: row.student_id,
                raw_score: row.raw_score,
            })
            .collect())
    }

    async fn record_outcome(&self, outcome: &AggregationOutcome) -> Result<()> {
        let stats =
            serde_json::to_value(outcome).context("Failed to serialize aggregation outcome")?;
        repositories::exams::set_bulk_publish_stats(
            &self.pool,
            &outcome.exam_id,
            stats,
            primitive_now_utc(),
        )
        .await
        .context("Failed to record publish outcome")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgResultWriter {
    pool: PgPool,
}

impl PgResultWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultWriter for PgResultWriter {
    async fn bulk_write(&self, updates: &[ResultUpdate]) -> Result<BulkWriteReport> {
        if updates.is_empty() {
            return Ok(BulkWriteReport::default());
        }

        // Collapse duplicate report-card slots (last write wins) so the upsert
        // statement never touches one row twice.
        let mut entries: Vec<NewReportCardEntry> = Vec::with_capacity(updates.len());
        let mut slots: HashMap<(String, String, String, String, String), usize> = HashMap::new();
        for update in updates {
            let slot = (
                update.student_id.clone(),
                update.subject_ref.clone(),
                update.classroom_ref.clone(),
                update.session.clone(),
                update.term.clone(),
            );
            let entry = NewReportCardEntry {
                student_id: update.student_id.clone(),
                subject_ref: update.subject_ref.clone(),
                classroom_ref: update.classroom_ref.clone(),
                session: update.session.clone(),
                term: update.term.clone(),
                score: update.score,
                max_score: update.max_score,
            };
            match slots.entry(slot) {
                Entry::Occupied(existing) => entries[*existing.get()] = entry,
                Entry::Vacant(vacant) => {
                    vacant.insert(entries.len());
                    entries.push(entry);
                }
            }
        }

        let summary =
            repositories::results::upsert_entries(&self.pool, &entries, primitive_now_utc())
                .await
                .context("Failed to upsert report card entries")?;

        Ok(BulkWriteReport {
            modified: summary.updated,
            upserted: summary.inserted,
            errors: Vec::new(),
        })
    }
}

#[derive(Clone)]
pub struct PgSubmissionMarker {
    pool: PgPool,
}

impl PgSubmissionMarker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionMarker for PgSubmissionMarker {
    async fn mark_published(&self, submission_ids: &[String]) -> Result<()> {
        let marked = repositories::submissions::mark_published(
            &self.pool,
            submission_ids,
            primitive_now_utc(),
        )
        .await
        .context("Failed to mark submissions published")?;

        if marked < submission_ids.len() as u64 {
            tracing::debug!(
                requested = submission_ids.len(),
                marked,
                "Some submissions were already published"
            );
        }
        Ok(())
    }
}

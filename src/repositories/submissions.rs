use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::ExamSubmission;
use crate::db::types::SubmissionStatus;

pub(crate) const COLUMNS: &str = "\
    id, exam_id, student_id, raw_score, status, published_at, created_at, updated_at";

/// Graded-but-unpublished submissions, in a stable order so re-dispatching the
/// same exam partitions identically.
pub(crate) async fn list_eligible_for_publish(
    pool: &PgPool,
    exam_id: &str,
) -> Result<Vec<ExamSubmission>, sqlx::Error> {
    sqlx::query_as::<_, ExamSubmission>(&format!(
        "SELECT {COLUMNS}
         FROM exam_submissions
         WHERE exam_id = $1 AND status = $2
         ORDER BY id"
    ))
    .bind(exam_id)
    .bind(SubmissionStatus::Graded)
    .fetch_all(pool)
    .await
}

pub(crate) async fn mark_published(
    pool: &PgPool,
    submission_ids: &[String],
    now: PrimitiveDateTime,
) -> Result<u64, sqlx::Error> {
    if submission_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "UPDATE exam_submissions
         SET status = $1, published_at = $2, updated_at = $2
         WHERE id = ANY($3)",
    )
    .bind(SubmissionStatus::Published)
    .bind(now)
    .bind(submission_ids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

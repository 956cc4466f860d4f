use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::Exam;

pub(crate) const COLUMNS: &str = "\
    id, title, subject_ref, classroom_ref, session, term, total_marks, \
    bulk_publish_stats, created_at, updated_at";

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Exam>, sqlx::Error> {
    sqlx::query_as::<_, Exam>(&format!("SELECT {COLUMNS} FROM exams WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn set_bulk_publish_stats(
    pool: &PgPool,
    id: &str,
    stats: serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE exams SET bulk_publish_stats = $1, updated_at = $2 WHERE id = $3")
        .bind(Json(stats))
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

use sqlx::PgPool;
use time::PrimitiveDateTime;

#[derive(Debug, Clone)]
pub(crate) struct NewReportCardEntry {
    pub(crate) student_id: String,
    pub(crate) subject_ref: String,
    pub(crate) classroom_ref: String,
    pub(crate) session: String,
    pub(crate) term: String,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UpsertSummary {
    pub(crate) inserted: u64,
    pub(crate) updated: u64,
}

/// Upserts one batch of report-card rows in a single statement. Callers must
/// not pass two entries with the same (student, subject, classroom, session,
/// term) slot: ON CONFLICT cannot update the same row twice in one statement.
pub(crate) async fn upsert_entries(
    pool: &PgPool,
    entries: &[NewReportCardEntry],
    now: PrimitiveDateTime,
) -> Result<UpsertSummary, sqlx::Error> {
    if entries.is_empty() {
        return Ok(UpsertSummary::default());
    }

    let mut student_ids = Vec::with_capacity(entries.len());
    let mut subject_refs = Vec::with_capacity(entries.len());
    let mut classroom_refs = Vec::with_capacity(entries.len());
    let mut sessions = Vec::with_capacity(entries.len());
    let mut terms = Vec::with_capacity(entries.len());
    let mut scores = Vec::with_capacity(entries.len());
    let mut max_scores = Vec::with_capacity(entries.len());
    for entry in entries {
        student_ids.push(entry.student_id.clone());
        subject_refs.push(entry.subject_ref.clone());
        classroom_refs.push(entry.classroom_ref.clone());
        sessions.push(entry.session.clone());
        terms.push(entry.term.clone());
        scores.push(entry.score);
        max_scores.push(entry.max_score);
    }

    // xmax = 0 distinguishes freshly inserted rows from conflict updates.
    let flags: Vec<(bool,)> = sqlx::query_as(
        "INSERT INTO report_card_entries
             (student_id, subject_ref, classroom_ref, session, term, score, max_score,
              created_at, updated_at)
         SELECT u.student_id, u.subject_ref, u.classroom_ref, u.session, u.term,
                u.score, u.max_score, $8, $8
         FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
                     $6::float8[], $7::float8[])
              AS u(student_id, subject_ref, classroom_ref, session, term, score, max_score)
         ON CONFLICT (student_id, subject_ref, classroom_ref, session, term)
         DO UPDATE SET score = EXCLUDED.score,
                       max_score = EXCLUDED.max_score,
                       updated_at = EXCLUDED.updated_at
         RETURNING (xmax = 0)",
    )
    .bind(&student_ids)
    .bind(&subject_refs)
    .bind(&classroom_refs)
    .bind(&sessions)
    .bind(&terms)
    .bind(&scores)
    .bind(&max_scores)
    .bind(now)
    .fetch_all(pool)
    .await?;

    let inserted = flags.iter().filter(|(fresh,)| *fresh).count() as u64;
    let updated = flags.len() as u64 - inserted;
    Ok(UpsertSummary { inserted, updated })
}

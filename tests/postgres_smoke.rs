use sqlx::Row;
use uuid::Uuid;

use gradecast::services::contracts::{ResultUpdate, ResultWriter};
use gradecast::services::postgres::PgResultWriter;

fn database_url() -> Option<String> {
    // Load .env so POSTGRES_* from .env are available (integration tests don't use app config)
    dotenvy::dotenv().ok();

    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return Some(url);
        }
    }

    let server = std::env::var("POSTGRES_SERVER").ok()?;
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".into());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "gradecast".into());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "gradecast_db".into());

    Some(format!("postgresql://{user}:{password}@{server}:{port}/{db}"))
}

async fn migrated_pool() -> anyhow::Result<Option<sqlx::PgPool>> {
    let Some(database_url) = database_url() else {
        eprintln!("skipping: DATABASE_URL and POSTGRES_* are not set");
        return Ok(None);
    };

    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url).await?;

    let migrations_dir =
        std::env::var("GRADECAST_MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(&migrations_dir)).await?;
    migrator.run(&pool).await?;

    Ok(Some(pool))
}

#[tokio::test]
async fn migrations_apply_and_tables_exist() -> anyhow::Result<()> {
    let Some(pool) = migrated_pool().await? else { return Ok(()) };

    let tables = ["exams", "exam_submissions", "report_card_entries"];

    for table in tables {
        let row = sqlx::query("SELECT to_regclass($1)::text").bind(table).fetch_one(&pool).await?;
        let regclass: Option<String> = row.try_get(0)?;
        assert!(regclass.is_some(), "expected table {table} to exist after migrations");
    }

    Ok(())
}

#[tokio::test]
async fn bulk_write_inserts_then_updates_the_same_slots() -> anyhow::Result<()> {
    let Some(pool) = migrated_pool().await? else { return Ok(()) };

    let writer = PgResultWriter::new(pool.clone());
    // Unique session keeps this run's rows apart from real data.
    let session = format!("smoke-{}", Uuid::new_v4());
    let updates: Vec<ResultUpdate> = (0..3)
        .map(|i| ResultUpdate {
            student_id: format!("student-{i}"),
            subject_ref: "chemistry".into(),
            classroom_ref: "ss2-a".into(),
            session: session.clone(),
            term: "first".into(),
            score: 40.0 + i as f64,
            max_score: 100.0,
        })
        .collect();

    let first = writer.bulk_write(&updates).await?;
    assert_eq!((first.upserted, first.modified), (3, 0));

    let second = writer.bulk_write(&updates).await?;
    assert_eq!((second.upserted, second.modified), (0, 3));

    sqlx::query("DELETE FROM report_card_entries WHERE session = $1")
        .bind(&session)
        .execute(&pool)
        .await?;

    Ok(())
}

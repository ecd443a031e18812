use sqlx::Pool;
use sqlx::Postgres;

/// Applies the embedded migrations. The migrator takes its own advisory
/// lock, so concurrent replicas starting together are safe.
pub async fn run_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    let migrator = sqlx::migrate!("../sqlx-migrations");
    migrator.run(pool).await?;
    tracing::info!(migrations = migrator.iter().count(), "database migrations applied");
    Ok(())
}

use async_trait::async_trait;
use canvas_core::{CanvasState, Color};
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::{PgPool, Row};

use crate::archive::{ArchiveBackend, ArchiveError, ArchiveMeta};

const NAME: &str = "postgres";

pub struct PostgresArchiveBackend {
    pool: PgPool,
}

impl PostgresArchiveBackend {
    /// Connect and run pending migrations.
    pub async fn connect(url: &str) -> Result<Self, ArchiveError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ArchiveBackend for PostgresArchiveBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn put(&self, meta: &ArchiveMeta, state: &CanvasState) -> Result<(), ArchiveError> {
        let colors =
            serde_json::to_string(&state.colors).map_err(|e| ArchiveError::backend(NAME, e))?;
        let (sql, values) = Query::insert()
            .into_table(CanvasArchives::Table)
            .columns([
                CanvasArchives::Id,
                CanvasArchives::CreatedAt,
                CanvasArchives::Width,
                CanvasArchives::Height,
                CanvasArchives::Colors,
            ])
            .values_panic([
                meta.id.clone().into(),
                (meta.timestamp as i64).into(),
                (state.width as i32).into(),
                (state.height as i32).into(),
                colors.into(),
            ])
            .on_conflict(
                OnConflict::column(CanvasArchives::Id)
                    .update_columns([
                        CanvasArchives::CreatedAt,
                        CanvasArchives::Width,
                        CanvasArchives::Height,
                        CanvasArchives::Colors,
                    ])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanvasState>, ArchiveError> {
        let (sql, values) = Query::select()
            .columns([
                CanvasArchives::Width,
                CanvasArchives::Height,
                CanvasArchives::Colors,
            ])
            .from(CanvasArchives::Table)
            .and_where(Expr::col(CanvasArchives::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let width: i32 = row.try_get("width").map_err(|e| ArchiveError::backend(NAME, e))?;
        let height: i32 = row.try_get("height").map_err(|e| ArchiveError::backend(NAME, e))?;
        let colors: String = row.try_get("colors").map_err(|e| ArchiveError::backend(NAME, e))?;
        let colors: Vec<Vec<Color>> =
            serde_json::from_str(&colors).map_err(|e| ArchiveError::backend(NAME, e))?;
        Ok(Some(CanvasState {
            colors,
            width: width.max(0) as u32,
            height: height.max(0) as u32,
        }))
    }

    async fn list(&self) -> Result<Vec<ArchiveMeta>, ArchiveError> {
        let (sql, values) = Query::select()
            .columns([CanvasArchives::Id, CanvasArchives::CreatedAt])
            .from(CanvasArchives::Table)
            .order_by(CanvasArchives::CreatedAt, Order::Desc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        rows.iter()
            .map(|row| -> Result<ArchiveMeta, ArchiveError> {
                let id: String = row.try_get("id").map_err(|e| ArchiveError::backend(NAME, e))?;
                let created_at: i64 = row
                    .try_get("created_at")
                    .map_err(|e| ArchiveError::backend(NAME, e))?;
                Ok(ArchiveMeta {
                    id,
                    timestamp: created_at.max(0) as u64,
                })
            })
            .collect()
    }
}

#[derive(Iden)]
enum CanvasArchives {
    Table,
    Id,
    CreatedAt,
    Width,
    Height,
    Colors,
}

async fn run_migrations(pool: &PgPool) -> Result<(), ArchiveError> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|e| ArchiveError::backend(NAME, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn postgres_archive_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("set DATABASE_URL");
        let backend = PostgresArchiveBackend::connect(&url)
            .await
            .expect("connect");

        let mut state = CanvasState::blank(4, 3);
        state.colors[2][3] = Color::Purple;
        let meta = ArchiveMeta::at(chrono::Utc::now().timestamp_millis() as u64);
        backend.put(&meta, &state).await.unwrap();
        // Upsert on the same id replaces rather than failing.
        backend.put(&meta, &state).await.unwrap();

        assert_eq!(backend.get(&meta.id).await.unwrap(), Some(state));
        let listed = backend.list().await.unwrap();
        assert_eq!(listed.iter().filter(|m| m.id == meta.id).count(), 1);
        assert!(listed.contains(&meta));
        assert_eq!(backend.get("canvas-0").await.unwrap(), None);
    }
}

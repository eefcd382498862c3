use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{Connection, PgPool, Postgres, Transaction};
use tracing::{debug, info};

use super::{AlbumTx, CatalogStore};
use crate::catalog::{AlbumDetail, CatalogArtist, CatalogTrack};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    Artist, ArtistRole, CatalogCounts, Label, ReassignRule, Reassignment, Release,
    ReleaseForReview, Upserted,
};
use crate::retry::RetryPolicy;

const ARTIST_COLUMNS: &str = "id, external_id, name, image_url, spotify_url, label_id";
const RELEASE_COLUMNS: &str = "r.id, r.external_id, r.title, r.release_date, r.artwork_url, \
     r.external_url, r.label_id, r.release_type, r.primary_artist_id, r.genres";

async fn timed<T, F>(limit: Duration, what: &'static str, fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(what, limit)),
    }
}

/// Releases a savepoint on success, rolls it back on failure.
async fn finish<T>(savepoint: Transaction<'_, Postgres>, result: StoreResult<T>) -> StoreResult<T> {
    match result {
        Ok(value) => {
            savepoint.commit().await?;
            Ok(value)
        }
        Err(e) => {
            savepoint.rollback().await.ok();
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Pool-level store
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
    write_timeout: Duration,
    retry: RetryPolicy,
}

impl PgStore {
    /// Connect, retrying transient failures with the configured policy.
    pub async fn connect(database_url: &str, config: &Config) -> StoreResult<Self> {
        let retry = RetryPolicy::new(&config.retry);
        let write_timeout = config.timeouts.db_write();

        let pool = retry
            .run("database connect", StoreError::is_transient, || async {
                PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(write_timeout)
                    .connect(database_url)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;

        info!("Connected to database");
        Ok(Self {
            pool,
            write_timeout,
            retry,
        })
    }

    #[cfg(test)]
    fn from_pool(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            write_timeout: config.timeouts.db_write(),
            retry: RetryPolicy::new(&config.retry),
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Database pool closed");
    }

    async fn label_by_slug(&self, slug: &str) -> StoreResult<Option<Label>> {
        self.read("label lookup", || {
            sqlx::query_as::<_, Label>("SELECT id, name, slug FROM labels WHERE slug = $1")
                .bind(slug)
                .fetch_optional(&self.pool)
        })
        .await
    }

    /// Read with timeout and retry.
    async fn read<T, F, Fut>(&self, what: &'static str, query: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        self.retry
            .run(what, StoreError::is_transient, || {
                timed(self.write_timeout, what, query())
            })
            .await
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow {
    #[sqlx(flatten)]
    release: Release,
    artist_names: Vec<String>,
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn ensure_label(&self, name: &str, slug: &str) -> StoreResult<Label> {
        if let Some(label) = self.label_by_slug(slug).await? {
            return Ok(label);
        }

        let renamed: Option<Label> = timed(
            self.write_timeout,
            "label slug update",
            sqlx::query_as(
                "UPDATE labels SET slug = $2 WHERE name = $1 RETURNING id, name, slug",
            )
            .bind(name)
            .bind(slug)
            .fetch_optional(&self.pool),
        )
        .await?;
        if let Some(label) = renamed {
            info!("Label {:?} now uses slug {:?}", label.name, label.slug);
            return Ok(label);
        }

        timed(
            self.write_timeout,
            "label insert",
            sqlx::query(
                "INSERT INTO labels (id, name, slug) VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(cuid2::create_id())
            .bind(name)
            .bind(slug)
            .execute(&self.pool),
        )
        .await?;

        self.read("label lookup", || {
            sqlx::query_as::<_, Label>("SELECT id, name, slug FROM labels WHERE slug = $1")
                .bind(slug)
                .fetch_one(&self.pool)
        })
        .await
    }

    async fn find_label(&self, name: &str, slug: &str) -> StoreResult<Option<Label>> {
        self.read("label lookup", || {
            sqlx::query_as::<_, Label>(
                "SELECT id, name, slug FROM labels
                 WHERE slug = $1 OR name = $2
                 ORDER BY (slug = $1) DESC
                 LIMIT 1",
            )
            .bind(slug)
            .bind(name)
            .fetch_optional(&self.pool)
        })
        .await
    }

    async fn find_artist_by_external_id(&self, external_id: &str) -> StoreResult<Option<Artist>> {
        let sql = format!("SELECT {} FROM artists WHERE external_id = $1", ARTIST_COLUMNS);
        self.read("artist lookup", || {
            sqlx::query_as::<_, Artist>(&sql)
                .bind(external_id)
                .fetch_optional(&self.pool)
        })
        .await
    }

    async fn find_placeholder_artist_by_name(&self, name: &str) -> StoreResult<Option<Artist>> {
        let sql = format!(
            "SELECT {} FROM artists
             WHERE external_id IS NULL AND LOWER(name) = LOWER($1)
             ORDER BY created_at, id LIMIT 1",
            ARTIST_COLUMNS
        );
        self.read("placeholder lookup", || {
            sqlx::query_as::<_, Artist>(&sql)
                .bind(name)
                .fetch_optional(&self.pool)
        })
        .await
    }

    async fn find_release_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Release>> {
        let sql = format!("SELECT {} FROM releases r WHERE r.external_id = $1", RELEASE_COLUMNS);
        self.read("release lookup", || {
            sqlx::query_as::<_, Release>(&sql)
                .bind(external_id)
                .fetch_optional(&self.pool)
        })
        .await
    }

    async fn releases_by_external_ids(&self, external_ids: &[String]) -> StoreResult<Vec<Release>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM releases r WHERE r.external_id = ANY($1) ORDER BY r.id",
            RELEASE_COLUMNS
        );
        self.read("release batch lookup", || {
            sqlx::query_as::<_, Release>(&sql)
                .bind(external_ids)
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn begin_album(&self) -> StoreResult<Box<dyn AlbumTx>> {
        let tx = self
            .retry
            .run("begin transaction", StoreError::is_transient, || {
                timed(self.write_timeout, "begin transaction", self.pool.begin())
            })
            .await?;
        Ok(Box::new(PgAlbumTx {
            tx,
            timeout: self.write_timeout,
        }))
    }

    async fn reassign_release(
        &self,
        release_id: &str,
        new_label_id: &str,
        rule: ReassignRule,
    ) -> StoreResult<Reassignment> {
        let limit = self.write_timeout;
        let mut tx = timed(limit, "begin transaction", self.pool.begin()).await?;

        let from_label_id: Option<String> = timed(
            limit,
            "release lock",
            sqlx::query_scalar("SELECT label_id FROM releases WHERE id = $1 FOR UPDATE")
                .bind(release_id)
                .fetch_optional(&mut *tx),
        )
        .await?;
        let from_label_id = from_label_id.ok_or_else(|| StoreError::MissingParent {
            entity: "release",
            id: release_id.to_string(),
        })?;

        timed(
            limit,
            "release label update",
            sqlx::query("UPDATE releases SET label_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(new_label_id)
                .bind(release_id)
                .execute(&mut *tx),
        )
        .await?;

        let tracks_updated = timed(
            limit,
            "track label cascade",
            sqlx::query(
                "UPDATE tracks SET label_id = $1, updated_at = NOW() WHERE release_id = $2",
            )
            .bind(new_label_id)
            .bind(release_id)
            .execute(&mut *tx),
        )
        .await?
        .rows_affected();

        timed(
            limit,
            "reassignment audit",
            sqlx::query(
                "INSERT INTO label_reassignments
                   (id, release_id, from_label_id, to_label_id, rule, tracks_updated)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(cuid2::create_id())
            .bind(release_id)
            .bind(&from_label_id)
            .bind(new_label_id)
            .bind(rule.as_str())
            .bind(tracks_updated as i64)
            .execute(&mut *tx),
        )
        .await?;

        timed(limit, "commit", tx.commit()).await?;

        Ok(Reassignment {
            release_id: release_id.to_string(),
            from_label_id,
            to_label_id: new_label_id.to_string(),
            tracks_updated,
        })
    }

    async fn find_orphan_releases(&self, label_id: Option<&str>) -> StoreResult<Vec<Release>> {
        let sql = format!(
            "SELECT {} FROM releases r
             WHERE NOT EXISTS (SELECT 1 FROM release_artists ra WHERE ra.release_id = r.id)
               AND ($1::text IS NULL OR r.label_id = $1)
             ORDER BY r.created_at, r.id",
            RELEASE_COLUMNS
        );
        self.read("orphan scan", || {
            sqlx::query_as::<_, Release>(&sql)
                .bind(label_id)
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn releases_for_review(&self, label_id: &str) -> StoreResult<Vec<ReleaseForReview>> {
        let sql = format!(
            "SELECT {},
                    COALESCE(
                      ARRAY_AGG(a.name ORDER BY ra.role DESC, a.name) FILTER (WHERE a.id IS NOT NULL),
                      '{{}}'
                    ) AS artist_names
             FROM releases r
             LEFT JOIN release_artists ra ON ra.release_id = r.id
             LEFT JOIN artists a ON a.id = ra.artist_id
             WHERE r.label_id = $1
             GROUP BY r.id
             ORDER BY r.title, r.id",
            RELEASE_COLUMNS
        );
        let rows = self
            .read("release review scan", || {
                sqlx::query_as::<_, ReviewRow>(&sql)
                    .bind(label_id)
                    .fetch_all(&self.pool)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ReleaseForReview {
                release: row.release,
                artist_names: row.artist_names,
            })
            .collect())
    }

    async fn restore_track_labels(&self, label_id: Option<&str>) -> StoreResult<u64> {
        let result = timed(
            self.write_timeout,
            "track label repair",
            sqlx::query(
                "UPDATE tracks t SET label_id = r.label_id, updated_at = NOW()
                 FROM releases r
                 WHERE t.release_id = r.id
                   AND t.label_id <> r.label_id
                   AND ($1::text IS NULL OR r.label_id = $1)",
            )
            .bind(label_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_releases(&self, label_id: &str) -> StoreResult<i64> {
        self.read("release count", || {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*)::bigint FROM releases WHERE label_id = $1")
                .bind(label_id)
                .fetch_one(&self.pool)
        })
        .await
    }

    async fn counts(&self) -> StoreResult<CatalogCounts> {
        let row: (i64, i64, i64, i64, i64, i64) = self
            .read("catalog counts", || {
                sqlx::query_as(
                    "SELECT
                       (SELECT COUNT(*) FROM labels)::bigint,
                       (SELECT COUNT(*) FROM artists)::bigint,
                       (SELECT COUNT(*) FROM releases)::bigint,
                       (SELECT COUNT(*) FROM tracks)::bigint,
                       (SELECT COUNT(*) FROM release_artists)::bigint,
                       (SELECT COUNT(*) FROM track_artists)::bigint",
                )
                .fetch_one(&self.pool)
            })
            .await?;
        Ok(CatalogCounts {
            labels: row.0,
            artists: row.1,
            releases: row.2,
            tracks: row.3,
            release_artists: row.4,
            track_artists: row.5,
        })
    }
}

// ---------------------------------------------------------------------------
// Album transaction
// ---------------------------------------------------------------------------

struct PgAlbumTx {
    tx: Transaction<'static, Postgres>,
    timeout: Duration,
}

async fn upsert_artist_in(
    conn: &mut PgConnection,
    artist: &CatalogArtist,
    label_id: &str,
) -> Result<Upserted, sqlx::Error> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM artists WHERE external_id = $1")
            .bind(&artist.external_id)
            .fetch_optional(&mut *conn)
            .await?;

    let placeholder = match existing {
        Some(id) => Some(id),
        None => {
            sqlx::query_scalar(
                "SELECT id FROM artists
                 WHERE external_id IS NULL AND LOWER(name) = LOWER($1)
                 ORDER BY created_at, id LIMIT 1",
            )
            .bind(&artist.name)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    if let Some(id) = placeholder {
        sqlx::query(
            "UPDATE artists SET
               external_id = $1,
               name = $2,
               image_url = COALESCE($3, image_url),
               spotify_url = COALESCE($4, spotify_url),
               updated_at = NOW()
             WHERE id = $5",
        )
        .bind(&artist.external_id)
        .bind(&artist.name)
        .bind(&artist.image_url)
        .bind(&artist.spotify_url)
        .bind(&id)
        .execute(&mut *conn)
        .await?;
        return Ok(Upserted { id, created: false });
    }

    let (id, created): (String, bool) = sqlx::query_as(
        "INSERT INTO artists (id, external_id, name, image_url, spotify_url, label_id)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (external_id) DO UPDATE SET
           name = EXCLUDED.name,
           updated_at = NOW()
         RETURNING id, (xmax = 0) AS created",
    )
    .bind(cuid2::create_id())
    .bind(&artist.external_id)
    .bind(&artist.name)
    .bind(&artist.image_url)
    .bind(&artist.spotify_url)
    .bind(label_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Upserted { id, created })
}

/// Insert or refresh a track under `release_id`. A track whose external ID is
/// already stored under a different release is left alone.
async fn upsert_track_in(
    conn: &mut PgConnection,
    track: &CatalogTrack,
    release_id: &str,
) -> StoreResult<Upserted> {
    let row: Option<(String, bool)> = sqlx::query_as(
        "INSERT INTO tracks
           (id, external_id, title, duration_ms, track_number, disc_number,
            preview_url, external_url, release_id, label_id)
         SELECT $1, $2, $3, $4, $5, $6, $7, $8, r.id, r.label_id
         FROM releases r WHERE r.id = $9
         ON CONFLICT (external_id) DO UPDATE SET
           title = EXCLUDED.title,
           duration_ms = EXCLUDED.duration_ms,
           track_number = EXCLUDED.track_number,
           disc_number = EXCLUDED.disc_number,
           preview_url = EXCLUDED.preview_url,
           external_url = EXCLUDED.external_url,
           label_id = EXCLUDED.label_id,
           updated_at = NOW()
         WHERE tracks.release_id = EXCLUDED.release_id
         RETURNING id, (xmax = 0) AS created",
    )
    .bind(cuid2::create_id())
    .bind(&track.external_id)
    .bind(&track.title)
    .bind(track.duration_ms)
    .bind(track.track_number)
    .bind(track.disc_number)
    .bind(&track.preview_url)
    .bind(&track.external_url)
    .bind(release_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id, created)) = row {
        return Ok(Upserted { id, created });
    }

    let release: Option<String> = sqlx::query_scalar("SELECT id FROM releases WHERE id = $1")
        .bind(release_id)
        .fetch_optional(&mut *conn)
        .await?;
    match release {
        None => Err(StoreError::MissingParent {
            entity: "release",
            id: release_id.to_string(),
        }),
        Some(_) => Err(StoreError::Conflict(format!(
            "track {} belongs to another release",
            track.external_id
        ))),
    }
}

#[async_trait]
impl AlbumTx for PgAlbumTx {
    async fn upsert_artist(
        &mut self,
        artist: &CatalogArtist,
        label_id: &str,
    ) -> StoreResult<Upserted> {
        let mut sp = Connection::begin(&mut *self.tx).await?;
        let result = timed(
            self.timeout,
            "artist upsert",
            upsert_artist_in(&mut *sp, artist, label_id),
        )
        .await;
        finish(sp, result).await
    }

    async fn upsert_release(
        &mut self,
        album: &AlbumDetail,
        label_id: &str,
        primary_artist_id: &str,
    ) -> StoreResult<Upserted> {
        let mut sp = Connection::begin(&mut *self.tx).await?;
        let result = timed(
            self.timeout,
            "release upsert",
            sqlx::query_as::<_, (String, bool)>(
                "INSERT INTO releases
                   (id, external_id, title, release_date, artwork_url, external_url,
                    label_id, release_type, primary_artist_id, genres)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (external_id) DO UPDATE SET
                   title = EXCLUDED.title,
                   artwork_url = COALESCE(EXCLUDED.artwork_url, releases.artwork_url),
                   release_date = COALESCE(EXCLUDED.release_date, releases.release_date),
                   genres = CASE WHEN cardinality(EXCLUDED.genres) > 0
                                 THEN EXCLUDED.genres ELSE releases.genres END,
                   updated_at = NOW()
                 RETURNING id, (xmax = 0) AS created",
            )
            .bind(cuid2::create_id())
            .bind(&album.external_id)
            .bind(&album.title)
            .bind(&album.release_date)
            .bind(&album.artwork_url)
            .bind(&album.external_url)
            .bind(label_id)
            .bind(&album.release_type)
            .bind(primary_artist_id)
            .bind(&album.genres)
            .fetch_one(&mut *sp),
        )
        .await
        .map(|(id, created)| Upserted { id, created });
        finish(sp, result).await
    }

    async fn link_release_artist(
        &mut self,
        release_id: &str,
        artist_id: &str,
        role: ArtistRole,
    ) -> StoreResult<bool> {
        let mut sp = Connection::begin(&mut *self.tx).await?;
        let result = timed(
            self.timeout,
            "release artist link",
            sqlx::query(
                "INSERT INTO release_artists (release_id, artist_id, role)
                 VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(release_id)
            .bind(artist_id)
            .bind(role.as_str())
            .execute(&mut *sp),
        )
        .await
        .map(|r| r.rows_affected() == 1);
        finish(sp, result).await
    }

    async fn upsert_track(
        &mut self,
        track: &CatalogTrack,
        release_id: &str,
    ) -> StoreResult<Upserted> {
        let mut sp = Connection::begin(&mut *self.tx).await?;
        let result = match tokio::time::timeout(
            self.timeout,
            upsert_track_in(&mut *sp, track, release_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout("track upsert", self.timeout)),
        };
        finish(sp, result).await
    }

    async fn link_track_artist(
        &mut self,
        track_id: &str,
        artist_id: &str,
        role: ArtistRole,
    ) -> StoreResult<bool> {
        let mut sp = Connection::begin(&mut *self.tx).await?;
        let result = timed(
            self.timeout,
            "track artist link",
            sqlx::query(
                "INSERT INTO track_artists (track_id, artist_id, role)
                 VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(track_id)
            .bind(artist_id)
            .bind(role.as_str())
            .execute(&mut *sp),
        )
        .await
        .map(|r| r.rows_affected() == 1);
        finish(sp, result).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        timed(self.timeout, "commit", self.tx.commit()).await
    }
}

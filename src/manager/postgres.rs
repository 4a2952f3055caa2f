//! PostgreSQL implementation of [`Storage`].
//!
//! [`Storage::update_request`] runs inside a transaction that locks the
//! request row with `SELECT ... FOR UPDATE`, applies the mutation, and
//! writes it back guarded by the row's `version`. Line items are rewritten
//! in the same transaction only when the mutation changed them.
//!
//! # Example
//! ```ignore
//! use beamcheck::manager::postgres::PostgresStorage;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgresql://localhost/beamcheck").await?;
//! beamcheck::migrator().run(&pool).await?;
//! let storage = PostgresStorage::new(pool);
//! ```

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::Storage;
use crate::domain::actor::ActorId;
use crate::domain::beam::BeamId;
use crate::domain::request::{CalculationResult, LineItem, Request, RequestId, RequestStatus};
use crate::error::{BeamcheckError, Result};

const REQUEST_COLUMNS: &str = r#"
    id, status, creator_id, moderator_id, note, created_at, formed_at, completed_at,
    result_deflection_mm, within_norm, calculated_at, generation, version
"#;

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_items<'e, E>(executor: E, id: RequestId) -> Result<Vec<LineItem>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query(
            r#"
            SELECT beam_id, quantity, length_m, udl_kn_m, position
            FROM line_items
            WHERE request_id = $1
            ORDER BY position
            "#,
        )
        .bind(*id as Uuid)
        .fetch_all(executor)
        .await
        .map_err(|e| BeamcheckError::Other(anyhow!("Failed to load line items: {}", e)))?;

        rows.iter().map(row_to_item).collect()
    }

    async fn replace_items(
        tx: &mut Transaction<'_, Postgres>,
        id: RequestId,
        items: &[LineItem],
    ) -> Result<()> {
        sqlx::query("DELETE FROM line_items WHERE request_id = $1")
            .bind(*id as Uuid)
            .execute(&mut **tx)
            .await
            .map_err(|e| BeamcheckError::Other(anyhow!("Failed to clear line items: {}", e)))?;

        for item in items {
            let quantity = i32::try_from(item.quantity).map_err(|_| {
                BeamcheckError::Validation(format!(
                    "quantity {} of beam {} is too large",
                    item.quantity, item.beam_id
                ))
            })?;
            sqlx::query(
                r#"
                INSERT INTO line_items (request_id, beam_id, quantity, length_m, udl_kn_m, position)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(*id as Uuid)
            .bind(item.beam_id.0)
            .bind(quantity)
            .bind(item.length_m)
            .bind(item.udl_kn_m)
            .bind(item.position as i32)
            .execute(&mut **tx)
            .await
            .map_err(|e| BeamcheckError::Other(anyhow!("Failed to insert line item: {}", e)))?;
        }
        Ok(())
    }
}

fn row_to_item(row: &PgRow) -> Result<LineItem> {
    let quantity: i32 = row.try_get("quantity").map_err(decode_err)?;
    let position: i32 = row.try_get("position").map_err(decode_err)?;
    Ok(LineItem {
        beam_id: BeamId(row.try_get("beam_id").map_err(decode_err)?),
        quantity: u32::try_from(quantity)
            .map_err(|_| BeamcheckError::Other(anyhow!("Negative quantity {}", quantity)))?,
        length_m: row.try_get("length_m").map_err(decode_err)?,
        udl_kn_m: row.try_get("udl_kn_m").map_err(decode_err)?,
        position: u32::try_from(position)
            .map_err(|_| BeamcheckError::Other(anyhow!("Negative position {}", position)))?,
    })
}

fn row_to_request(row: &PgRow, items: Vec<LineItem>) -> Result<Request> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    let status = status
        .parse::<RequestStatus>()
        .map_err(|e| BeamcheckError::Other(anyhow!(e)))?;

    let deflection_mm: Option<f64> = row.try_get("result_deflection_mm").map_err(decode_err)?;
    let within_norm: Option<bool> = row.try_get("within_norm").map_err(decode_err)?;
    let calculated_at: Option<chrono::DateTime<Utc>> =
        row.try_get("calculated_at").map_err(decode_err)?;
    let result = match (deflection_mm, within_norm, calculated_at) {
        (Some(deflection_mm), Some(within_norm), Some(calculated_at)) => Some(CalculationResult {
            deflection_mm,
            within_norm,
            calculated_at,
        }),
        _ => None,
    };

    let generation: i64 = row.try_get("generation").map_err(decode_err)?;
    let version: i64 = row.try_get("version").map_err(decode_err)?;

    Ok(Request {
        id: RequestId(row.try_get("id").map_err(decode_err)?),
        status,
        creator_id: ActorId(row.try_get("creator_id").map_err(decode_err)?),
        moderator_id: row
            .try_get::<Option<String>, _>("moderator_id")
            .map_err(decode_err)?
            .map(ActorId),
        note: row.try_get("note").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        formed_at: row.try_get("formed_at").map_err(decode_err)?,
        completed_at: row.try_get("completed_at").map_err(decode_err)?,
        result,
        generation: generation as u64,
        version: version as u64,
        items,
    })
}

fn decode_err(e: sqlx::Error) -> BeamcheckError {
    BeamcheckError::Other(anyhow!("Failed to decode row: {}", e))
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(skip(self), fields(creator = %creator))]
    async fn ensure_draft(&self, creator: &ActorId) -> Result<Request> {
        // The partial unique index turns concurrent inserts into no-ops
        sqlx::query(
            r#"
            INSERT INTO requests (id, status, creator_id, created_at)
            VALUES ($1, 'draft', $2, NOW())
            ON CONFLICT (creator_id) WHERE status = 'draft' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&creator.0)
        .execute(&self.pool)
        .await
        .map_err(|e| BeamcheckError::Other(anyhow!("Failed to create draft: {}", e)))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM requests WHERE creator_id = $1 AND status = 'draft'",
            REQUEST_COLUMNS
        ))
        .bind(&creator.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BeamcheckError::Other(anyhow!("Failed to load draft: {}", e)))?;

        let id = RequestId(row.try_get("id").map_err(decode_err)?);
        let items = Self::load_items(&self.pool, id).await?;
        row_to_request(&row, items)
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(*id as Uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BeamcheckError::Other(anyhow!("Failed to load request: {}", e)))?
        .ok_or(BeamcheckError::RequestNotFound(id))?;

        let items = Self::load_items(&self.pool, id).await?;
        row_to_request(&row, items)
    }

    #[tracing::instrument(skip(self, f), fields(request_id = %id))]
    async fn update_request<F, T>(&self, id: RequestId, f: F) -> Result<(Request, T)>
    where
        F: FnOnce(&mut Request) -> Result<T> + Send,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BeamcheckError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        ))
        .bind(*id as Uuid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BeamcheckError::Other(anyhow!("Failed to lock request: {}", e)))?
        .ok_or(BeamcheckError::RequestNotFound(id))?;

        let items = Self::load_items(&mut *tx, id).await?;
        let current = row_to_request(&row, items)?;

        let mut candidate = current.clone();
        // Dropping `tx` on error rolls back and releases the row lock
        let output = f(&mut candidate)?;
        candidate.version = current.version + 1;

        let (deflection_mm, within_norm, calculated_at) = match &candidate.result {
            Some(r) => (Some(r.deflection_mm), Some(r.within_norm), Some(r.calculated_at)),
            None => (None, None, None),
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE requests SET
                status = $3,
                moderator_id = $4,
                note = $5,
                formed_at = $6,
                completed_at = $7,
                result_deflection_mm = $8,
                within_norm = $9,
                calculated_at = $10,
                generation = $11,
                version = $12
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(*id as Uuid)
        .bind(current.version as i64)
        .bind(candidate.status.as_str())
        .bind(candidate.moderator_id.as_ref().map(|m| m.0.clone()))
        .bind(&candidate.note)
        .bind(candidate.formed_at)
        .bind(candidate.completed_at)
        .bind(deflection_mm)
        .bind(within_norm)
        .bind(calculated_at)
        .bind(candidate.generation as i64)
        .bind(candidate.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| BeamcheckError::Other(anyhow!("Failed to update request: {}", e)))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(BeamcheckError::Other(anyhow!(
                "Concurrent modification of request {}",
                id
            )));
        }

        if candidate.items != current.items {
            Self::replace_items(&mut tx, id, &candidate.items).await?;
        }

        tx.commit()
            .await
            .map_err(|e| BeamcheckError::Other(anyhow!("Failed to commit request: {}", e)))?;

        Ok((candidate, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::actor::Actor;

    async fn storage(pool: PgPool) -> PostgresStorage {
        PostgresStorage::new(pool)
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_ensure_draft_is_idempotent(pool: PgPool) {
        let storage = storage(pool).await;
        let alice = ActorId::from("alice");
        let a = storage.ensure_draft(&alice).await.unwrap();
        let b = storage.ensure_draft(&alice).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, RequestStatus::Draft);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_update_round_trips_items_and_result(pool: PgPool) {
        let storage = storage(pool).await;
        let alice = Actor::user("alice");
        let moderator = Actor::moderator("mod");
        let draft = storage.ensure_draft(&alice.id).await.unwrap();

        storage
            .update_request(draft.id, |r| {
                r.add_item(&alice, BeamId(10), 2)?;
                r.items[0].length_m = Some(4.0);
                r.items[0].udl_kn_m = Some(10.0);
                r.form(&alice, Utc::now())
            })
            .await
            .unwrap();

        let (_, generation) = storage
            .update_request(draft.id, |r| r.complete(&moderator, Utc::now()))
            .await
            .unwrap();

        storage
            .update_request(draft.id, |r| {
                r.apply_callback_result(
                    Some(generation),
                    CalculationResult {
                        deflection_mm: 0.25,
                        within_norm: true,
                        calculated_at: Utc::now(),
                    },
                )
            })
            .await
            .unwrap();

        let stored = storage.get_request(draft.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].quantity, 2);
        assert_eq!(stored.result.unwrap().deflection_mm, 0.25);
        assert_eq!(stored.version, 3);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_failed_guard_rolls_back(pool: PgPool) {
        let storage = storage(pool).await;
        let alice = Actor::user("alice");
        let draft = storage.ensure_draft(&alice.id).await.unwrap();

        let err = storage
            .update_request(draft.id, |r| r.form(&alice, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, BeamcheckError::Validation(_)));

        let stored = storage.get_request(draft.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Draft);
        assert_eq!(stored.version, 0);
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use super::{Store, StoreError, StoreResult};
use crate::delivery::{Delivery, DeliveryGuard, DeliveryStatus, RetryPhase};
use crate::destination::{Destination, FilterKind, FilterOperator, FilterRule, NewDestination};
use crate::event::{Event, NewEvent};
use crate::retry::MAX_TOTAL_ATTEMPTS;

const DELIVERY_COLUMNS: &str = r#"
    id, event_id, destination_id, status, status_code, response_body, error_message,
    attempts, dispatched_at, last_attempt_at, retry_phase, next_attempt_at, in_flight, created_at
"#;

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    headers: Json<HashMap<String, String>>,
    payload: Vec<u8>,
    content_type: String,
    source_ip: String,
    received_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            headers: row.headers.0,
            payload: row.payload,
            content_type: row.content_type,
            source_ip: row.source_ip,
            received_at: row.received_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DestinationRow {
    id: i64,
    name: String,
    url: String,
    active: bool,
    custom_headers: Json<HashMap<String, String>>,
    timeout_secs: i32,
}

#[derive(sqlx::FromRow)]
struct FilterRuleRow {
    destination_id: i64,
    kind: FilterKind,
    field: String,
    operator: FilterOperator,
    value: Option<String>,
}

/// A `Store` backed by PostgreSQL tables created by the migrations in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

impl PgStore {
    /// Connect a new pool to the database at `url`.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn attach_filters(&self, rows: Vec<DestinationRow>) -> StoreResult<Vec<Destination>> {
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();

        let rule_rows: Vec<FilterRuleRow> = sqlx::query_as(
            r#"
SELECT destination_id, kind, field, operator, value
FROM filter_rules
WHERE destination_id = ANY($1)
ORDER BY id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        let mut rules: HashMap<i64, Vec<FilterRule>> = HashMap::new();
        for row in rule_rows {
            let rule = FilterRule::new(row.kind, &row.field, row.operator, row.value.as_deref())?;
            rules.entry(row.destination_id).or_default().push(rule);
        }

        Ok(rows
            .into_iter()
            .map(|row| Destination {
                filters: rules.remove(&row.id).unwrap_or_default(),
                id: row.id,
                name: row.name,
                url: row.url,
                active: row.active,
                custom_headers: row.custom_headers.0,
                timeout_secs: row.timeout_secs,
            })
            .collect())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;
        Ok(())
    }

    async fn insert_event(&self, event: NewEvent) -> StoreResult<Event> {
        let row: EventRow = sqlx::query_as(
            r#"
INSERT INTO events (headers, payload, content_type, source_ip, received_at)
VALUES ($1, $2, $3, $4, $5)
RETURNING id, headers, payload, content_type, source_ip, received_at
            "#,
        )
        .bind(Json(&event.headers))
        .bind(&event.payload)
        .bind(&event.content_type)
        .bind(&event.source_ip)
        .bind(event.received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("INSERT"))?;

        Ok(row.into())
    }

    async fn get_event(&self, id: i64) -> StoreResult<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT id, headers, payload, content_type, source_ip, received_at FROM events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(row.map(Event::from))
    }

    async fn delete_events_received_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE received_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }

    async fn insert_destination(&self, destination: NewDestination) -> StoreResult<Destination> {
        destination.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("BEGIN"))?;

        let row: DestinationRow = sqlx::query_as(
            r#"
INSERT INTO destinations (name, url, active, custom_headers, timeout_secs)
VALUES ($1, $2, $3, $4, $5)
RETURNING id, name, url, active, custom_headers, timeout_secs
            "#,
        )
        .bind(&destination.name)
        .bind(&destination.url)
        .bind(destination.active)
        .bind(Json(&destination.custom_headers))
        .bind(destination.timeout_secs)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error("INSERT"))?;

        for rule in &destination.filters {
            sqlx::query(
                r#"
INSERT INTO filter_rules (destination_id, kind, field, operator, value)
VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(row.id)
            .bind(rule.kind)
            .bind(&rule.field)
            .bind(rule.operator)
            .bind(&rule.value)
            .execute(&mut *tx)
            .await
            .map_err(query_error("INSERT"))?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;

        Ok(Destination {
            id: row.id,
            name: row.name,
            url: row.url,
            active: row.active,
            custom_headers: row.custom_headers.0,
            timeout_secs: row.timeout_secs,
            filters: destination.filters,
        })
    }

    async fn get_destination(&self, id: i64) -> StoreResult<Option<Destination>> {
        let rows: Vec<DestinationRow> = sqlx::query_as(
            "SELECT id, name, url, active, custom_headers, timeout_secs FROM destinations WHERE id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(self.attach_filters(rows).await?.pop())
    }

    async fn active_destinations(&self) -> StoreResult<Vec<Destination>> {
        let rows: Vec<DestinationRow> = sqlx::query_as(
            "SELECT id, name, url, active, custom_headers, timeout_secs FROM destinations WHERE active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        self.attach_filters(rows).await
    }

    async fn create_delivery(&self, event_id: i64, destination_id: i64) -> StoreResult<Delivery> {
        let query = format!(
            r#"
INSERT INTO deliveries (event_id, destination_id, status, attempts, retry_phase, in_flight, created_at)
VALUES ($1, $2, 'pending', 0, 'immediate', FALSE, NOW())
RETURNING {DELIVERY_COLUMNS}
            "#
        );

        sqlx::query_as(&query)
            .bind(event_id)
            .bind(destination_id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("INSERT"))
    }

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<Delivery>> {
        let query = format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1");

        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn deliveries_for_event(&self, event_id: i64) -> StoreResult<Vec<Delivery>> {
        let query =
            format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE event_id = $1 ORDER BY id");

        sqlx::query_as(&query)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn update_delivery_if(
        &self,
        guard: DeliveryGuard,
        updated: &Delivery,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE deliveries
SET
    status = $5,
    status_code = $6,
    response_body = $7,
    error_message = $8,
    attempts = $9,
    dispatched_at = $10,
    last_attempt_at = $11,
    retry_phase = $12,
    next_attempt_at = $13,
    in_flight = $14
WHERE
    id = $1
    AND status = $2
    AND attempts = $3
    AND in_flight = $4
            "#,
        )
        .bind(guard.id)
        .bind(guard.status)
        .bind(guard.attempts)
        .bind(guard.in_flight)
        .bind(updated.status)
        .bind(updated.status_code)
        .bind(&updated.response_body)
        .bind(&updated.error_message)
        .bind(updated.attempts)
        .bind(updated.dispatched_at)
        .bind(updated.last_attempt_at)
        .bind(updated.retry_phase)
        .bind(updated.next_attempt_at)
        .bind(updated.in_flight)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn deliveries_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Delivery>> {
        let query = format!(
            r#"
SELECT {DELIVERY_COLUMNS}
FROM deliveries
WHERE
    status = $1
    AND retry_phase = $2
    AND next_attempt_at <= $3
    AND attempts < $4
    AND NOT in_flight
ORDER BY id
LIMIT $5
            "#
        );

        sqlx::query_as(&query)
            .bind(DeliveryStatus::Failed)
            .bind(RetryPhase::Scheduled)
            .bind(now)
            .bind(MAX_TOTAL_ATTEMPTS)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn unfinished_deliveries(&self) -> StoreResult<Vec<Delivery>> {
        let query = format!(
            r#"
SELECT {DELIVERY_COLUMNS}
FROM deliveries
WHERE status = 'pending' OR (status = 'failed' AND retry_phase = 'immediate')
ORDER BY id
            "#
        );

        sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }
}

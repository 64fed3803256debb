//! Webhook endpoint repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use courier_core::{
    CreateEndpointRequest, EndpointRepository, Error, Result, UpdateEndpointRequest,
    WebhookEndpoint,
};

/// PostgreSQL webhook endpoint repository.
#[derive(Clone)]
pub struct PgWebhookEndpointRepository {
    pool: Pool<Postgres>,
}

impl PgWebhookEndpointRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Register a new endpoint. New endpoints are active.
    pub async fn create(&self, req: CreateEndpointRequest) -> Result<WebhookEndpoint> {
        if req.url.trim().is_empty() {
            return Err(Error::InvalidInput("endpoint url must not be empty".into()));
        }

        let id = courier_core::new_v7();
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO webhook_endpoint (id, url, secret, event_types, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, true, $5, $5)
             RETURNING id, url, secret, event_types, is_active, created_at, updated_at",
        )
        .bind(id)
        .bind(&req.url)
        .bind(&req.secret)
        .bind(&req.event_types)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_row(&row))
    }

    /// List all endpoints, newest first.
    pub async fn list(&self) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(
            "SELECT id, url, secret, event_types, is_active, created_at, updated_at
             FROM webhook_endpoint ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::parse_row).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<WebhookEndpoint>> {
        let row = sqlx::query(
            "SELECT id, url, secret, event_types, is_active, created_at, updated_at
             FROM webhook_endpoint WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.as_ref().map(Self::parse_row))
    }

    /// Update endpoint fields. Only `Some` fields change.
    pub async fn update(&self, id: Uuid, req: UpdateEndpointRequest) -> Result<WebhookEndpoint> {
        let row = sqlx::query(
            "UPDATE webhook_endpoint SET
                url = COALESCE($1, url),
                secret = COALESCE($2, secret),
                event_types = COALESCE($3, event_types),
                is_active = COALESCE($4, is_active),
                updated_at = $5
             WHERE id = $6
             RETURNING id, url, secret, event_types, is_active, created_at, updated_at",
        )
        .bind(req.url)
        .bind(req.secret)
        .bind(req.event_types)
        .bind(req.is_active)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(Self::parse_row)
            .ok_or_else(|| Error::NotFound(format!("webhook endpoint {}", id)))
    }

    /// Delete an endpoint. Returns whether a row was removed.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_endpoint WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    fn parse_row(r: &sqlx::postgres::PgRow) -> WebhookEndpoint {
        WebhookEndpoint {
            id: r.get("id"),
            url: r.get("url"),
            secret: r.get("secret"),
            event_types: r.get("event_types"),
            is_active: r.get("is_active"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }
    }
}

#[async_trait]
impl EndpointRepository for PgWebhookEndpointRepository {
    async fn list_active(&self) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(
            "SELECT id, url, secret, event_types, is_active, created_at, updated_at
             FROM webhook_endpoint
             WHERE is_active = true
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::parse_row).collect())
    }
}

//! Store collaborators consumed by the realtime core
//!
//! The notification tables are owned by the CRUD services; the realtime core
//! only creates records, flags them as pushed, and reads preferences.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::{OffsetDateTime, Time};

use crate::error::StoreError;
use crate::types::{
    EntityId, NewNotification, Notification, NotificationId, NotificationPreferences, QuietHours,
    UserId,
};

/// Notification persistence used by the dispatch policy
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new, unread and unpushed notification
    async fn create_notification(&self, new: &NewNotification) -> Result<Notification, StoreError>;

    /// Flag a notification as pushed at `pushed_at`
    async fn mark_notification_as_pushed(
        &self,
        id: NotificationId,
        pushed_at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Load the user's preferences; `Ok(None)` when the user never saved any
    async fn get_preferences(
        &self,
        user_id: UserId,
    ) -> Result<Option<NotificationPreferences>, StoreError>;
}

/// Rider business state consulted before a rider connection is upgraded
#[async_trait]
pub trait RiderDirectory: Send + Sync {
    /// Whether the rider has switched themselves online; unknown riders are offline
    async fn is_rider_online(&self, rider_id: EntityId) -> Result<bool, StoreError>;
}

/// PostgreSQL implementation of the store collaborators
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct PreferencesRow {
    user_id: UserId,
    order_enabled: bool,
    payment_enabled: bool,
    delivery_enabled: bool,
    system_enabled: bool,
    food_safety_enabled: bool,
    quiet_hours_start: Option<Time>,
    quiet_hours_end: Option<Time>,
}

impl From<PreferencesRow> for NotificationPreferences {
    fn from(row: PreferencesRow) -> Self {
        let quiet_hours = match (row.quiet_hours_start, row.quiet_hours_end) {
            (Some(start), Some(end)) => Some(QuietHours::new(start, end)),
            _ => None,
        };

        Self {
            user_id: row.user_id,
            order_enabled: row.order_enabled,
            payment_enabled: row.payment_enabled,
            delivery_enabled: row.delivery_enabled,
            system_enabled: row.system_enabled,
            food_safety_enabled: row.food_safety_enabled,
            quiet_hours,
        }
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn create_notification(&self, new: &NewNotification) -> Result<Notification, StoreError> {
        let (related_type, related_id) = match &new.related {
            Some(related) => (Some(related.kind.as_str()), Some(related.id)),
            None => (None, None),
        };

        let notification = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (
                user_id, category, title, body,
                related_type, related_id, extra, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, user_id, category, title, body, related_type, related_id,
                      extra, is_read, read_at, is_pushed, pushed_at, expires_at, created_at
            "#,
        )
        .bind(new.user_id)
        .bind(new.category)
        .bind(&new.title)
        .bind(&new.body)
        .bind(related_type)
        .bind(related_id)
        .bind(&new.extra)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn mark_notification_as_pushed(
        &self,
        id: NotificationId,
        pushed_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET is_pushed = true, pushed_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(pushed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("notification {}", id)));
        }

        Ok(())
    }

    async fn get_preferences(
        &self,
        user_id: UserId,
    ) -> Result<Option<NotificationPreferences>, StoreError> {
        let row: Option<PreferencesRow> = sqlx::query_as(
            r#"
            SELECT user_id, order_enabled, payment_enabled, delivery_enabled,
                   system_enabled, food_safety_enabled,
                   quiet_hours_start, quiet_hours_end
            FROM notification_preferences
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(NotificationPreferences::from))
    }
}

#[async_trait]
impl RiderDirectory for PgStore {
    async fn is_rider_online(&self, rider_id: EntityId) -> Result<bool, StoreError> {
        let online: Option<bool> =
            sqlx::query_scalar("SELECT is_online FROM riders WHERE id = $1")
                .bind(rider_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(online.unwrap_or(false))
    }
}

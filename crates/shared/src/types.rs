//! Common types used across Courier

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{OffsetDateTime, Time};

// =============================================================================
// ID Wrappers
// =============================================================================

/// Role-scoped numeric id of a rider, merchant, or platform operator account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct EntityId(pub i64);

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Login account id (one user may act for a rider, merchant or the platform)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification record id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct NotificationId(pub i64);

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Kind of account a realtime connection acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Rider,
    Merchant,
    Platform,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Rider, Role::Merchant, Role::Platform];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rider => "rider",
            Self::Merchant => "merchant",
            Self::Platform => "platform",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rider" => Ok(Self::Rider),
            "merchant" => Ok(Self::Merchant),
            "platform" => Ok(Self::Platform),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Verified identity attached to a connection before it is registered.
///
/// Produced by the authentication layer and threaded explicitly through the
/// upgrade path; nothing downstream re-derives it from request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub role: Role,
    pub entity_id: EntityId,
    pub user_id: UserId,
}

impl Identity {
    pub fn new(role: Role, entity_id: i64, user_id: i64) -> Self {
        Self {
            role,
            entity_id: EntityId(entity_id),
            user_id: UserId(user_id),
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification category, each of which can be muted by the recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Order,
    Payment,
    Delivery,
    System,
    FoodSafety,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Payment => "payment",
            Self::Delivery => "delivery",
            Self::System => "system",
            Self::FoodSafety => "food_safety",
        }
    }
}

impl std::fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the business object a notification is about (an order, a payout...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i64,
}

/// A persisted notification record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    pub related_type: Option<String>,
    pub related_id: Option<i64>,
    pub extra: serde_json::Value,
    pub is_read: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
    pub is_pushed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pushed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields needed to create a notification record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: UserId,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub related: Option<RelatedEntity>,
    #[serde(default)]
    pub extra: serde_json::Value,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

// =============================================================================
// Preferences
// =============================================================================

/// Recurring daily do-not-disturb window `[start, end)` in platform local time.
///
/// A window whose start is after its end wraps past midnight. `start == end`
/// is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: Time,
    pub end: Time,
}

impl QuietHours {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    /// Whether `now` (time of day) falls inside the window
    pub fn contains(&self, now: Time) -> bool {
        if self.start <= self.end {
            now >= self.start && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

/// Per-user notification preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: UserId,
    pub order_enabled: bool,
    pub payment_enabled: bool,
    pub delivery_enabled: bool,
    pub system_enabled: bool,
    pub food_safety_enabled: bool,
    pub quiet_hours: Option<QuietHours>,
}

impl NotificationPreferences {
    /// Preferences applied when the user never saved any: everything enabled, no quiet hours
    pub fn defaults_for(user_id: UserId) -> Self {
        Self {
            user_id,
            order_enabled: true,
            payment_enabled: true,
            delivery_enabled: true,
            system_enabled: true,
            food_safety_enabled: true,
            quiet_hours: None,
        }
    }

    /// Whether the user wants notifications of this category at all
    pub fn allows(&self, category: NotificationCategory) -> bool {
        match category {
            NotificationCategory::Order => self.order_enabled,
            NotificationCategory::Payment => self.payment_enabled,
            NotificationCategory::Delivery => self.delivery_enabled,
            NotificationCategory::System => self.system_enabled,
            NotificationCategory::FoodSafety => self.food_safety_enabled,
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Merchant {
    pub id: Uuid,
    pub name: String,
    pub contact_email: Option<String>,
    pub brand_color: String,      // "#RRGGBB"
    pub foreground_color: String, // "#RRGGBB"
    pub strip_color: String,      // "#RRGGBB"
    pub logo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn merchant() -> Merchant {
        let created = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Merchant {
            id: Uuid::new_v4(),
            name: "Froyo Corner".to_string(),
            contact_email: Some("hello@froyo.example".to_string()),
            brand_color: "#111111".to_string(),
            foreground_color: "#FFFFFF".to_string(),
            strip_color: "#6E463A".to_string(),
            logo_url: None,
            created_at: created,
            updated_at: created,
        }
    }
}

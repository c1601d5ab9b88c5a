//! Pass renderer
//!
//! Maps a card snapshot to the canonical `pass.json` document. Rendering is pure: no
//! clock reads, no I/O. Field order is fixed by the struct definitions, so identical
//! inputs always serialize to identical bytes.

use serde::Serialize;

use crate::models::{CardStatus, Merchant, PassContext, PunchProgram, WalletCard};

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Card state violates invariants: {0}")]
    InvalidState(String),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deployment-wide values that appear on every pass
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub pass_type_id: String,
    pub team_id: String,
    pub organization_name: String,
    pub web_service_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassDescription {
    pub format_version: u8,
    pub pass_type_identifier: String,
    pub team_identifier: String,
    pub organization_name: String,
    pub description: String,
    pub logo_text: String,
    pub serial_number: String,
    pub authentication_token: String,
    #[serde(rename = "webServiceURL")]
    pub web_service_url: String,
    pub foreground_color: String,
    pub background_color: String,
    pub grouping_identifier: String,
    pub barcode: Barcode,
    pub store_card: StoreCard,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub voided: bool,
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Barcode {
    pub format: String,
    pub message: String,
    pub message_encoding: String,
    pub alt_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCard {
    pub secondary_fields: Vec<PassField>,
    pub auxiliary_fields: Vec<PassField>,
    pub back_fields: Vec<PassField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassField {
    pub key: String,
    pub label: String,
    pub value: String,
}

/// Machine-readable state carried alongside the display fields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub pass_version: i64,
    pub current_punches: i32,
    pub punches_required: i32,
    pub reward_credits: i32,
}

impl PassDescription {
    /// Canonical `pass.json` bytes
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, RenderError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn pass_version(&self) -> i64 {
        self.user_info.pass_version
    }
}

fn field(key: &str, label: &str, value: String) -> PassField {
    PassField {
        key: key.to_string(),
        label: label.to_string(),
        value,
    }
}

/// Parses `#RRGGBB` into its components
pub fn parse_hex_color(color: &str) -> Option<(u8, u8, u8)> {
    let hex = color.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }

    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

fn wallet_color(color: &str) -> Result<String, RenderError> {
    let (r, g, b) = parse_hex_color(color)
        .ok_or_else(|| RenderError::InvalidState(format!("invalid color {:?}", color)))?;
    Ok(format!("rgb({},{},{})", r, g, b))
}

fn validate(
    card: &WalletCard,
    program: &PunchProgram,
    merchant: &Merchant,
) -> Result<(), RenderError> {
    if program.punches_required < 1 {
        return Err(RenderError::InvalidState(format!(
            "program {} requires {} punches",
            program.id, program.punches_required
        )));
    }
    if card.current_punches < 0 || card.reward_credits < 0 {
        return Err(RenderError::InvalidState(format!(
            "card {} has negative balance ({} punches, {} credits)",
            card.id, card.current_punches, card.reward_credits
        )));
    }
    if card.current_punches >= program.punches_required {
        return Err(RenderError::InvalidState(format!(
            "card {} holds {} punches but program requires {}",
            card.id, card.current_punches, program.punches_required
        )));
    }
    if card.program_id != program.id {
        return Err(RenderError::InvalidState(format!(
            "card {} belongs to program {}, not {}",
            card.id, card.program_id, program.id
        )));
    }
    if program.merchant_id != merchant.id {
        return Err(RenderError::InvalidState(format!(
            "program {} belongs to merchant {}, not {}",
            program.id, program.merchant_id, merchant.id
        )));
    }
    Ok(())
}

/// Renders the pass description for a card snapshot
pub fn render(
    snapshot: &PassContext,
    context: &RenderContext,
) -> Result<PassDescription, RenderError> {
    let PassContext {
        card,
        program,
        merchant,
    } = snapshot;
    validate(card, program, merchant)?;

    let serial = card.serial_number();
    let short_code = serial
        .split('-')
        .next()
        .unwrap_or_default()
        .to_uppercase();

    let mut secondary_fields = Vec::with_capacity(2);
    if card.reward_credits > 0 {
        secondary_fields.push(field(
            "rewards",
            "REWARDS AVAILABLE",
            card.reward_credits.to_string(),
        ));
    }
    secondary_fields.push(field(
        "progress",
        "PROGRESS",
        format!("{} of {}", card.current_punches, program.punches_required),
    ));

    let voided = card.status == CardStatus::Expired;
    let mut auxiliary_fields = Vec::new();
    if voided {
        auxiliary_fields.push(field("expiration", "STATUS", "EXPIRED".to_string()));
    } else if let Some(expires_at) = card.expires_at {
        auxiliary_fields.push(field(
            "expiration",
            "VALID UNTIL",
            expires_at.format("%b %d, %Y").to_string(),
        ));
    }

    let mut back_fields = vec![field(
        "terms",
        "Terms & Conditions",
        program
            .terms_and_conditions
            .clone()
            .unwrap_or_else(|| "Valid at participating locations. Not transferable.".to_string()),
    )];
    if let Some(email) = &merchant.contact_email {
        back_fields.push(field("contact", "Contact Info", email.clone()));
    }

    Ok(PassDescription {
        format_version: 1,
        pass_type_identifier: context.pass_type_id.clone(),
        team_identifier: context.team_id.clone(),
        organization_name: context.organization_name.clone(),
        description: format!("{} Punch Card", program.name),
        logo_text: merchant.name.clone(),
        serial_number: serial.clone(),
        authentication_token: card.auth_token.clone(),
        web_service_url: context.web_service_url.clone(),
        foreground_color: wallet_color(&merchant.foreground_color)?,
        background_color: wallet_color(&merchant.brand_color)?,
        grouping_identifier: program.id.to_string(),
        barcode: Barcode {
            format: "PKBarcodeFormatQR".to_string(),
            message: serial,
            message_encoding: "iso-8859-1".to_string(),
            alt_text: short_code,
        },
        store_card: StoreCard {
            secondary_fields,
            auxiliary_fields,
            back_fields,
        },
        expiration_date: card.expires_at.map(|at| at.to_rfc3339()),
        voided,
        user_info: UserInfo {
            pass_version: card.update_tag,
            current_punches: card.current_punches,
            punches_required: program.punches_required,
            reward_credits: card.reward_credits,
        },
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::models::card::NewCardData;
    use crate::models::{merchant, program};
    use crate::store::TagClock;
    use chrono::Utc;
    use uuid::Uuid;

    pub fn context() -> RenderContext {
        RenderContext {
            pass_type_id: "pass.com.example.punch".to_string(),
            team_id: "TEAM123456".to_string(),
            organization_name: "Punchpass".to_string(),
            web_service_url: "https://passes.example.com".to_string(),
        }
    }

    pub fn snapshot(punches_required: i32) -> PassContext {
        let merchant = merchant::fixtures::merchant();
        let program = program::fixtures::program(merchant.id, punches_required);
        let card = WalletCard::new_for_program(
            NewCardData {
                user_id: Uuid::new_v4(),
                program_id: program.id,
                auth_token: "a".repeat(64),
            },
            &program,
            &TagClock::Logical,
            Utc::now(),
        );
        PassContext {
            card,
            program,
            merchant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[test]
    fn test_render_is_deterministic() {
        let snapshot = fixtures::snapshot(5);
        let a = render(&snapshot, &fixtures::context()).unwrap();
        let b = render(&snapshot.clone(), &fixtures::context()).unwrap();
        assert_eq!(
            a.to_canonical_bytes().unwrap(),
            b.to_canonical_bytes().unwrap()
        );
    }

    #[test]
    fn test_render_fields() {
        let mut snapshot = fixtures::snapshot(5);
        snapshot.card.current_punches = 3;
        snapshot.card.reward_credits = 2;
        snapshot.card.update_tag = 101;

        let pass = render(&snapshot, &fixtures::context()).unwrap();
        assert_eq!(pass.serial_number, snapshot.card.id.to_string());
        assert_eq!(pass.pass_version(), 101);
        assert_eq!(pass.background_color, "rgb(17,17,17)");
        assert_eq!(pass.store_card.secondary_fields.len(), 2);
        assert_eq!(pass.store_card.secondary_fields[0].value, "2");
        assert_eq!(pass.store_card.secondary_fields[1].value, "3 of 5");
        assert!(!pass.voided);

        let json: serde_json::Value =
            serde_json::from_slice(&pass.to_canonical_bytes().unwrap()).unwrap();
        assert_eq!(json["formatVersion"], 1);
        assert_eq!(json["webServiceURL"], "https://passes.example.com");
        assert_eq!(json["authenticationToken"], "a".repeat(64));
        assert!(json.get("voided").is_none());
        assert!(json.get("expirationDate").is_none());
    }

    #[test]
    fn test_rewards_field_hidden_without_credits() {
        let snapshot = fixtures::snapshot(5);
        let pass = render(&snapshot, &fixtures::context()).unwrap();
        assert_eq!(pass.store_card.secondary_fields.len(), 1);
        assert_eq!(pass.store_card.secondary_fields[0].key, "progress");
    }

    #[test]
    fn test_expired_card_renders_voided() {
        let mut snapshot = fixtures::snapshot(5);
        snapshot.card.status = CardStatus::Expired;
        snapshot.card.expires_at = Some(
            DateTime::parse_from_rfc3339("2025-02-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );

        let pass = render(&snapshot, &fixtures::context()).unwrap();
        assert!(pass.voided);
        assert_eq!(
            pass.expiration_date.as_deref(),
            Some("2025-02-01T00:00:00+00:00")
        );
        assert_eq!(pass.store_card.auxiliary_fields[0].value, "EXPIRED");
    }

    #[test]
    fn test_invalid_state_rejected() {
        let mut overfull = fixtures::snapshot(5);
        overfull.card.current_punches = 5;
        assert!(matches!(
            render(&overfull, &fixtures::context()),
            Err(RenderError::InvalidState(_))
        ));

        let mut negative = fixtures::snapshot(5);
        negative.card.reward_credits = -1;
        assert!(matches!(
            render(&negative, &fixtures::context()),
            Err(RenderError::InvalidState(_))
        ));

        let mut mismatched = fixtures::snapshot(5);
        mismatched.program.merchant_id = uuid::Uuid::new_v4();
        assert!(matches!(
            render(&mismatched, &fixtures::context()),
            Err(RenderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#6E463A"), Some((0x6e, 0x46, 0x3a)));
        assert_eq!(parse_hex_color("6E463A"), None);
        assert_eq!(parse_hex_color("#6E46"), None);
        assert_eq!(parse_hex_color("#GG0000"), None);
    }
}

//! Core data model: contacts, automation rules, templates and trigger logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Country code used when canonicalizing local-format phone numbers.
pub const DEFAULT_COUNTRY_CODE: &str = "62";

// ── Contacts ────────────────────────────────────────────────────────

/// Contact classification that decides the daily message cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    /// Parse a tier name. Unknown names fall back to `Basic`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "premium" => Self::Premium,
            "enterprise" => Self::Enterprise,
            _ => Self::Basic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A WhatsApp contact as seen by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Canonical phone number (digits only, country code first).
    pub id: String,
    /// Display name, if the gateway provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub opt_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opted_in_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opted_out_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tier: Tier,
    /// Timestamp of the last customer-initiated (inbound) message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_customer_message_at: Option<DateTime<Utc>>,
    /// End of the 24h conversation window. Only inbound messages move it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    /// A freshly seen contact: not opted in, basic tier, no window.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: None,
            opt_in: false,
            opted_in_at: None,
            opted_out_at: None,
            tier: Tier::Basic,
            last_customer_message_at: None,
            window_expires_at: None,
            created_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_opt_in(mut self, opt_in: bool) -> Self {
        self.opt_in = opt_in;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Whether the conversation window is open at `now`. No window means closed.
    pub fn within_window(&self, now: DateTime<Utc>) -> bool {
        self.window_expires_at.is_some_and(|expires| now < expires)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &ContactPatch) {
        if let Some(opt_in) = patch.opt_in {
            self.opt_in = opt_in;
        }
        if let Some(at) = patch.opted_in_at {
            self.opted_in_at = Some(at);
        }
        if let Some(at) = patch.opted_out_at {
            self.opted_out_at = Some(at);
        }
        if let Some(tier) = patch.tier {
            self.tier = tier;
        }
        if let Some(at) = patch.last_customer_message_at {
            self.last_customer_message_at = Some(at);
        }
        if let Some(at) = patch.window_expires_at {
            self.window_expires_at = Some(at);
        }
    }
}

/// Partial contact update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactPatch {
    pub opt_in: Option<bool>,
    pub opted_in_at: Option<DateTime<Utc>>,
    pub opted_out_at: Option<DateTime<Utc>>,
    pub tier: Option<Tier>,
    pub last_customer_message_at: Option<DateTime<Utc>>,
    pub window_expires_at: Option<DateTime<Utc>>,
}

impl ContactPatch {
    pub fn opt_in(now: DateTime<Utc>) -> Self {
        Self {
            opt_in: Some(true),
            opted_in_at: Some(now),
            ..Default::default()
        }
    }

    pub fn opt_out(now: DateTime<Utc>) -> Self {
        Self {
            opt_in: Some(false),
            opted_out_at: Some(now),
            ..Default::default()
        }
    }

    /// Record an inbound message at `now` and open the window until `expires_at`.
    pub fn inbound(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            last_customer_message_at: Some(now),
            window_expires_at: Some(expires_at),
            ..Default::default()
        }
    }
}

/// Canonicalize a phone number into the form used as a contact id.
///
/// Keeps digits only, drops a leading `+` or international `00`, and
/// rewrites the local trunk prefix `0` to the country code. Returns `None`
/// when no usable digits remain.
pub fn canonicalize_phone(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.split('@').next().unwrap_or(raw);
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(international) = digits.strip_prefix("00") {
        return match international.trim_start_matches('0') {
            "" => None,
            number => Some(number.to_string()),
        };
    }
    match digits.strip_prefix('0') {
        Some(rest) if !rest.is_empty() => Some(format!("{DEFAULT_COUNTRY_CODE}{rest}")),
        Some(_) => None,
        None if digits.is_empty() => None,
        None => Some(digits),
    }
}

/// Normalize a message body for matching: lowercase, trimmed, single spaces.
pub fn normalize_body(body: &str) -> String {
    body.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Automation rules ────────────────────────────────────────────────

/// How a rule decides whether it matches a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleMatcherKind {
    /// Any keyword (case-insensitive) appearing in the body matches; the rule
    /// answers with its fixed template.
    Keyword {
        keywords: Vec<String>,
        template_id: i64,
    },
    /// Score all templates of a category by keyword overlap and answer with
    /// the best one above the confidence threshold.
    TemplateCategory {
        category: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_confidence: Option<f32>,
    },
}

impl RuleMatcherKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Keyword { .. } => "keyword",
            Self::TemplateCategory { .. } => "template_category",
        }
    }
}

/// An operator-defined automation rule. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: i64,
    pub name: String,
    /// Higher wins.
    pub priority: i32,
    pub is_active: bool,
    pub matcher: RuleMatcherKind,
    /// Minimum minutes between triggers for the same contact (0 = none).
    #[serde(default)]
    pub cooldown_minutes: u32,
    /// Lifetime trigger cap per contact (0 = unlimited).
    #[serde(default)]
    pub max_triggers_per_contact: u32,
    pub created_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn keyword(
        id: i64,
        name: impl Into<String>,
        priority: i32,
        keywords: &[&str],
        template_id: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            priority,
            is_active: true,
            matcher: RuleMatcherKind::Keyword {
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                template_id,
            },
            cooldown_minutes: 0,
            max_triggers_per_contact: 0,
            created_at,
        }
    }

    pub fn template_category(
        id: i64,
        name: impl Into<String>,
        priority: i32,
        category: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            priority,
            is_active: true,
            matcher: RuleMatcherKind::TemplateCategory {
                category: category.into(),
                min_confidence: None,
            },
            cooldown_minutes: 0,
            max_triggers_per_contact: 0,
            created_at,
        }
    }

    pub fn with_cooldown(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_max_triggers(mut self, max: u32) -> Self {
        self.max_triggers_per_contact = max;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// A response template. `is_approved` marks a platform pre-approved template
/// that may be sent outside the conversation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub body: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub is_active: bool,
    #[serde(default)]
    pub is_approved: bool,
    /// Language code used for platform template sends.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "id".to_string()
}

impl Template {
    pub fn new(id: i64, name: impl Into<String>, category: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            category: category.into(),
            body: body.into(),
            keywords: Vec::new(),
            priority: 0,
            is_active: true,
            is_approved: false,
            language: default_language(),
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn approved(mut self) -> Self {
        self.is_approved = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Substitute `{{name}}` and `{{phone}}` placeholders from the contact.
    pub fn render(&self, contact: &Contact) -> String {
        let name = contact.name.as_deref().unwrap_or("Kak");
        self.body
            .replace("{{name}}", name)
            .replace("{{phone}}", &contact.id)
    }
}

// ── Trigger log ─────────────────────────────────────────────────────

/// Outcome recorded for one rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The rule won and its template was selected.
    Matched,
    /// The rule matched the content but was skipped (cooldown, cap, template).
    Skipped(String),
    /// No rule answered the message.
    NoMatch,
}

impl TriggerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Skipped(_) => "skipped",
            Self::NoMatch => "no_match",
        }
    }
}

/// Append-only audit record of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTriggerLog {
    /// `None` for the no-match record.
    pub rule_id: Option<i64>,
    pub contact_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: TriggerOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn canonicalizes_local_and_international_numbers() {
        assert_eq!(canonicalize_phone("0812-3456-789").as_deref(), Some("628123456789"));
        assert_eq!(canonicalize_phone("+62 812 3456 789").as_deref(), Some("628123456789"));
        assert_eq!(canonicalize_phone("628123456789@c.us").as_deref(), Some("628123456789"));
        assert_eq!(canonicalize_phone("  "), None);
        assert_eq!(canonicalize_phone("0"), None);
        assert_eq!(canonicalize_phone("0062 812 3456 789").as_deref(), Some("628123456789"));
        assert_eq!(canonicalize_phone("00"), None);
    }

    #[test]
    fn unknown_tier_is_basic() {
        assert_eq!(Tier::from_name("Premium"), Tier::Premium);
        assert_eq!(Tier::from_name("enterprise"), Tier::Enterprise);
        assert_eq!(Tier::from_name("gold"), Tier::Basic);
        assert_eq!(Tier::from_name(""), Tier::Basic);
    }

    #[test]
    fn normalizes_whitespace_and_case() {
        assert_eq!(normalize_body("  Paket   9\tHARI \n"), "paket 9 hari");
    }

    #[test]
    fn window_absent_means_closed() {
        let now = Utc::now();
        let mut contact = Contact::new("6281", now);
        assert!(!contact.within_window(now));

        contact.apply(&ContactPatch::inbound(now, now + Duration::hours(24)));
        assert!(contact.within_window(now + Duration::hours(23)));
        assert!(!contact.within_window(now + Duration::hours(24)));
    }

    #[test]
    fn patch_leaves_unset_fields_alone() {
        let now = Utc::now();
        let mut contact = Contact::new("6281", now).with_opt_in(true).with_tier(Tier::Premium);
        contact.apply(&ContactPatch::opt_out(now));
        assert!(!contact.opt_in);
        assert_eq!(contact.opted_out_at, Some(now));
        assert_eq!(contact.tier, Tier::Premium);
    }

    #[test]
    fn renders_placeholders() {
        let contact = Contact::new("628123", Utc::now()).with_name("Budi");
        let template = Template::new(1, "greet", "general", "Halo {{name}} ({{phone}}), {{unknown}}");
        assert_eq!(template.render(&contact), "Halo Budi (628123), {{unknown}}");
    }

    #[test]
    fn trigger_outcome_serialization() {
        let json = serde_json::to_value(TriggerOutcome::Skipped("cooldown".into())).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["detail"], "cooldown");
    }
}

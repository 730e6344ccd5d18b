//! Keyword and sender-domain rules that pick priority, category and assignee
//! for newly created tickets.

use serde::{Deserialize, Serialize};
use service_api_module::TicketPriority;

use crate::inbound::InboundEmail;
use crate::mail::email_domain;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Also search the body, not only the subject.
    #[serde(default)]
    pub match_body: bool,
    #[serde(default)]
    pub sender_domains: Vec<String>,
    #[serde(default)]
    pub priority: Option<TicketPriority>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub assign_agent_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RoutingRule {
    pub fn matches(&self, email: &InboundEmail) -> bool {
        if let Some(domain) = email.from_address.as_deref().and_then(email_domain) {
            if self
                .sender_domains
                .iter()
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(domain))
            {
                return true;
            }
        }

        let mut haystack = email.subject.clone().unwrap_or_default().to_lowercase();
        if self.match_body {
            if let Some(body) = email.text_body.as_deref().or(email.html_body.as_deref()) {
                haystack.push('\n');
                haystack.push_str(&body.to_lowercase());
            }
        }
        self.keywords
            .iter()
            .map(|keyword| keyword.trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .any(|keyword| haystack.contains(&keyword))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingOutcome {
    /// Name of the rule that fired, if any.
    pub rule: Option<String>,
    pub priority: TicketPriority,
    pub category_id: Option<i64>,
    pub department: Option<String>,
    pub assigned_agent_id: Option<i64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingDefaults {
    pub priority: Option<TicketPriority>,
    pub category_id: Option<i64>,
}

/// First matching rule wins; fields a rule leaves unset fall back to the
/// account defaults.
pub fn route(rules: &[RoutingRule], defaults: &RoutingDefaults, email: &InboundEmail) -> RoutingOutcome {
    let fallback_priority = defaults.priority.unwrap_or_default();
    match rules.iter().find(|rule| rule.matches(email)) {
        Some(rule) => RoutingOutcome {
            rule: Some(rule.name.clone()),
            priority: rule.priority.unwrap_or(fallback_priority),
            category_id: rule.category_id.or(defaults.category_id),
            department: rule.department.clone(),
            assigned_agent_id: rule.assign_agent_id,
            tags: rule.tags.clone(),
        },
        None => RoutingOutcome {
            rule: None,
            priority: fallback_priority,
            category_id: defaults.category_id,
            ..RoutingOutcome::default()
        },
    }
}

//! Default models per agent role, and token accounting

use serde::{Deserialize, Serialize};

/// Output cap applied to every completion unless config overrides it.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 16_384;

/// Agent roles that get their own model. Config may override each id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentModel {
    /// Plans and advisory reviews
    Planner,
    /// Writes the edit actions
    Implementer,
    /// Cheap model that fixes malformed JSON
    Repair,
}

impl AgentModel {
    pub fn default_id(self) -> &'static str {
        match self {
            AgentModel::Planner => "anthropic/claude-sonnet-4.5:nitro",
            AgentModel::Implementer => "anthropic/claude-opus-4.5:nitro",
            AgentModel::Repair => "openai/gpt-oss-120b:nitro",
        }
    }
}

/// Token usage of one call, or a running total over a run.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// USD, when the provider reports it (OpenRouter sends `total_cost`)
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost = match (self.cost, other.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_have_distinct_defaults() {
        let ids = [
            AgentModel::Planner.default_id(),
            AgentModel::Implementer.default_id(),
            AgentModel::Repair.default_id(),
        ];
        assert!(ids.iter().all(|id| id.contains('/')));
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn provider_usage_with_total_cost_parses() {
        let json = r#"{"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150, "total_cost": 0.0025}"#;
        let usage: Usage = serde_json::from_str(json).unwrap();
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.cost, Some(0.0025));

        let bare: Usage = serde_json::from_str(r#"{"total_tokens": 7}"#).unwrap();
        assert_eq!(bare.prompt_tokens, 0);
        assert_eq!(bare.cost, None);
    }

    #[test]
    fn running_total_keeps_cost_once_any_call_reports_it() {
        let mut total = Usage::default();
        total.add(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: None,
        });
        total.add(&Usage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
            cost: Some(0.5),
        });
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 18);
        assert_eq!(total.cost, Some(0.5));
    }
}

//! Static, declarative blueprint of a multi-agent world.
//!
//! A [`Situation`] JSON document defines a multi-agent simulation:
//!
//! ```text
//! {
//!   "name": "string",
//!   "description": "string",
//!   "rules_text": "string - natural language rules all agents see",
//!   "items": [{"name": "string", "description": "string", "tradable": true/false}],
//!   "agents": [{
//!     "name": "string",
//!     "persona": [{"key": "string", "value": "string", "hidden": true/false}],
//!     "starting_inventory": {"item_name": quantity},
//!     "special_actions": [<ActionDefinition>],
//!     "inventory_rules": [<InventoryRule>],
//!     "ai_model": "string"
//!   }],
//!   "environment": {
//!     "description": "string",
//!     "inventory": {"item_name": quantity},
//!     "global_actions": [<ActionDefinition>],
//!     "inventory_rules": [<InventoryRule>]
//!   },
//!   "communication": {
//!     "channels": [{"name": "string", "members": ["agent1", "agent2"] | "everyone", "description": "string"}],
//!     "dm_blacklist": [["agent1", "agent2"]]
//!   },
//!   "max_steps": 50
//! }
//! ```
//!
//! Effect types are documented on [`Effect`]. Parameter references use
//! `{param_name}` inside `target`, `source`, `item_name`, and `quantity`.
//! A `Situation` is never mutated once loaded; the intervention runner
//! produces an independent modified copy rather than editing it in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SitsimResult};

/// The reserved `target`/`source` token meaning "the agent performing the action".
pub const ACTOR_TOKEN: &str = "actor";
/// The reserved `target`/`source` token meaning "the environment's inventory".
pub const ENVIRONMENT_TOKEN: &str = "environment";
/// The reserved member-list value meaning "every declared agent".
pub const EVERYONE_TOKEN: &str = "everyone";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Situation {
    pub name: String,
    pub description: String,
    pub rules_text: String,
    pub items: Vec<ItemDefinition>,
    pub agents: Vec<AgentDefinition>,
    pub environment: EnvironmentDefinition,
    pub communication: Communication,
    pub max_steps: u32,
}

impl Situation {
    /// Validates the static cross-references a well-formed situation must
    /// satisfy: unique names, no dangling agent references, a positive
    /// step budget. Called once at load time; nothing past this point
    /// re-validates the situation.
    pub fn validate(&self) -> SitsimResult<()> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents.into());
        }
        if self.max_steps == 0 {
            return Err(ConfigError::InvalidMaxSteps.into());
        }

        let mut seen_agents = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen_agents.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgentName(agent.name.clone()).into());
            }
        }

        let mut seen_items = std::collections::HashSet::new();
        for item in &self.items {
            if !seen_items.insert(item.name.as_str()) {
                return Err(ConfigError::DuplicateItemName(item.name.clone()).into());
            }
        }

        let agent_exists = |name: &str| seen_agents.contains(name);

        for action in self
            .environment
            .global_actions
            .iter()
            .chain(self.agents.iter().flat_map(|a| a.special_actions.iter()))
        {
            if let Availability::Agents(names) = &action.available_to {
                for name in names {
                    if !agent_exists(name) {
                        return Err(ConfigError::DanglingAvailability {
                            action: action.name.clone(),
                            agent: name.clone(),
                        }
                        .into());
                    }
                }
            }
        }

        for channel in &self.communication.channels {
            if let Membership::Agents(names) = &channel.members {
                for name in names {
                    if !agent_exists(name) {
                        return Err(ConfigError::DanglingChannelMember(name.clone()).into());
                    }
                }
            }
        }

        for pair in &self.communication.dm_blacklist {
            if !agent_exists(&pair.0) {
                return Err(ConfigError::DanglingBlacklistEntry(pair.0.clone()).into());
            }
            if !agent_exists(&pair.1) {
                return Err(ConfigError::DanglingBlacklistEntry(pair.1.clone()).into());
            }
        }

        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn item(&self, name: &str) -> Option<&ItemDefinition> {
        self.items.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemDefinition {
    pub name: String,
    pub description: String,
    pub tradable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub persona: Vec<PersonaField>,
    pub starting_inventory: BTreeMap<String, u64>,
    #[serde(default)]
    pub special_actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub inventory_rules: Vec<InventoryRule>,
    pub ai_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonaField {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentDefinition {
    pub description: String,
    pub inventory: BTreeMap<String, u64>,
    #[serde(default)]
    pub global_actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub inventory_rules: Vec<InventoryRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Communication {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub dm_blacklist: Vec<(String, String)>,
}

impl Communication {
    /// True if `a` and `b` (in either order) are forbidden from DMing each other.
    pub fn is_blacklisted(&self, a: &str, b: &str) -> bool {
        self.dm_blacklist
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub name: String,
    pub members: Membership,
    #[serde(default)]
    pub description: String,
}

impl Channel {
    pub fn allows(&self, agent_name: &str) -> bool {
        match &self.members {
            Membership::Everyone => true,
            Membership::Agents(names) => names.iter().any(|n| n == agent_name),
        }
    }
}

/// Either the literal string `"everyone"` or an explicit set of agent names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Membership {
    Everyone(EveryoneTag),
    Agents(Vec<String>),
}

/// A marker that deserializes only from the literal string `"everyone"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct EveryoneTag;

impl TryFrom<String> for EveryoneTag {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == EVERYONE_TOKEN {
            Ok(EveryoneTag)
        } else {
            Err(format!("expected \"{EVERYONE_TOKEN}\", got \"{value}\""))
        }
    }
}

impl From<EveryoneTag> for String {
    fn from(_: EveryoneTag) -> Self {
        EVERYONE_TOKEN.to_string()
    }
}

/// Same `"everyone"` | `[agent_name, ...]` shape as [`Membership`], reused
/// for `ActionDefinition::available_to`.
pub type Availability = Membership;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    pub effects: Vec<Effect>,
    pub available_to: Availability,
}

impl ActionDefinition {
    pub fn is_available_to(&self, agent_name: &str) -> bool {
        match &self.available_to {
            Membership::Everyone(_) => true,
            Membership::Agents(names) => names.iter().any(|n| n == agent_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParameterKind {
    String,
    Int,
    Float,
    AgentName,
    ItemName,
}

/// A value that is either a literal quantity or a `{param_name}` reference
/// to be substituted per action invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum QuantityRef {
    Literal(i64),
    Param(String),
}

/// Tagged effect variant. On the wire this is discriminated by `type`;
/// in Rust it is a closed sum type rather than a dynamic dispatch on a
/// string name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    AddItem {
        target: String,
        item_name: String,
        quantity: QuantityRef,
    },
    RemoveItem {
        target: String,
        item_name: String,
        quantity: QuantityRef,
    },
    TransferItem {
        source: String,
        target: String,
        item_name: String,
        quantity: QuantityRef,
    },
    RandomOutcome { outcomes: Vec<RandomOutcomeBranch> },
    Message { target: String, message_text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomOutcomeBranch {
    pub probability: f64,
    pub effects: Vec<Effect>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: Vec<InventoryCondition>,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryCondition {
    pub item_name: String,
    pub operator: ComparisonOperator,
    pub threshold: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum ComparisonOperator {
    #[serde(rename = ">=")]
    #[strum(serialize = ">=")]
    Ge,
    #[serde(rename = "<=")]
    #[strum(serialize = "<=")]
    Le,
    #[serde(rename = "==")]
    #[strum(serialize = "==")]
    Eq,
    #[serde(rename = ">")]
    #[strum(serialize = ">")]
    Gt,
    #[serde(rename = "<")]
    #[strum(serialize = "<")]
    Lt,
    #[serde(rename = "!=")]
    #[strum(serialize = "!=")]
    Ne,
}

impl ComparisonOperator {
    pub fn evaluate(self, actual: i64, threshold: i64) -> bool {
        match self {
            Self::Ge => actual >= threshold,
            Self::Le => actual <= threshold,
            Self::Eq => actual == threshold,
            Self::Gt => actual > threshold,
            Self::Lt => actual < threshold,
            Self::Ne => actual != threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_situation() -> Situation {
        Situation {
            name: "Test Situation".into(),
            description: "d".into(),
            rules_text: "Test rules".into(),
            items: vec![ItemDefinition {
                name: "gold".into(),
                description: "currency".into(),
                tradable: true,
            }],
            agents: vec![AgentDefinition {
                name: "Alice".into(),
                persona: vec![],
                starting_inventory: BTreeMap::from([("gold".to_string(), 10)]),
                special_actions: vec![],
                inventory_rules: vec![],
                ai_model: "test-model".into(),
            }],
            environment: EnvironmentDefinition {
                description: "d".into(),
                inventory: BTreeMap::new(),
                global_actions: vec![],
                inventory_rules: vec![],
            },
            communication: Communication {
                channels: vec![],
                dm_blacklist: vec![],
            },
            max_steps: 10,
        }
    }

    #[test]
    fn validate_accepts_minimal_situation() {
        assert!(minimal_situation().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_agent_names() {
        let mut s = minimal_situation();
        s.agents.push(s.agents[0].clone());
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_availability() {
        let mut s = minimal_situation();
        s.environment.global_actions.push(ActionDefinition {
            name: "do_thing".into(),
            description: "".into(),
            parameters: vec![],
            effects: vec![],
            available_to: Membership::Agents(vec!["Nobody".into()]),
        });
        assert!(s.validate().is_err());
    }

    #[test]
    fn situation_json_round_trip() {
        let s = minimal_situation();
        let json = serde_json::to_string(&s).unwrap();
        let back: Situation = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn effect_discriminator_round_trips() {
        let effect = Effect::AddItem {
            target: "actor".into(),
            item_name: "gold".into(),
            quantity: QuantityRef::Literal(5),
        };
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json["type"], "add_item");
        let back: Effect = serde_json::from_value(json).unwrap();
        assert_eq!(effect, back);
    }
}

//! The single mutable carrier of simulation progress.
//!
//! A [`SimulationState`] is created once per branch, mutated only by the
//! effect engine and the simulator during a step, and deep-copied (via
//! [`Clone`]) at every branch point. Every field is an owned value — no
//! `Rc`/`Arc` aliasing — so a structural clone is a deep copy by
//! construction and two branches can never observe each other's mutations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::situation::Situation;

/// `agent name -> item name -> count`. Zero counts are removed rather than
/// stored, per the data model invariant that inventory keys are always > 0.
pub type Inventory = BTreeMap<String, u64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationState {
    pub step_number: u32,
    pub inventories: BTreeMap<String, Inventory>,
    pub environment_inventory: Inventory,
    pub message_history: Vec<Message>,
    pub pending_trades: Vec<TradeProposal>,
    pub trade_history: Vec<TradeRecord>,
    pub action_log: Vec<AgentAction>,
    next_trade_id: u64,
}

impl SimulationState {
    pub fn new(
        inventories: BTreeMap<String, Inventory>,
        environment_inventory: Inventory,
    ) -> Self {
        Self {
            step_number: 0,
            inventories,
            environment_inventory,
            message_history: Vec::new(),
            pending_trades: Vec::new(),
            trade_history: Vec::new(),
            action_log: Vec::new(),
            next_trade_id: 0,
        }
    }

    pub fn agent_inventory(&self, agent_name: &str) -> Inventory {
        self.inventories.get(agent_name).cloned().unwrap_or_default()
    }

    pub fn item_count(&self, agent_name: &str, item_name: &str) -> u64 {
        self.inventories
            .get(agent_name)
            .and_then(|inv| inv.get(item_name))
            .copied()
            .unwrap_or(0)
    }

    /// Allocates the next unique trade id for this state (monotonic per state).
    pub fn next_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.next_trade_id);
        self.next_trade_id += 1;
        id
    }

    pub fn pending_trade_mut(&mut self, id: TradeId) -> Option<&mut TradeProposal> {
        self.pending_trades.iter_mut().find(|t| t.id == id)
    }
}

/// Distinguishes trade ids from raw integers at the type level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, schemars::JsonSchema)]
#[serde(transparent)]
pub struct TradeId(pub u64);

crate::impl_from_primitive!(TradeId, u64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct Message {
    pub step: u32,
    pub sender: String,
    /// `None` means a direct message; `Some(channel_name)` means a broadcast.
    pub channel: Option<String>,
    pub recipients: Vec<String>,
    pub content: String,
}

impl Message {
    pub fn is_dm(&self) -> bool {
        self.channel.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeProposal {
    pub id: TradeId,
    pub proposer: String,
    pub eligible_acceptors: Vec<String>,
    pub offering: BTreeMap<String, u64>,
    pub requesting: BTreeMap<String, u64>,
    pub proposed_at_step: u32,
    pub expires_at_step: u32,
    pub status: TradeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub item_name: String,
    pub quantity: u64,
    pub from_agent: String,
    pub to_agent: String,
    pub step: u32,
    pub trade_id: TradeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct AgentAction {
    pub agent_name: String,
    pub action_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub messages_to_send: Vec<Message>,
    #[serde(default)]
    pub trade_proposal: Option<TradeProposalRequest>,
    #[serde(default)]
    pub trade_acceptance_id: Option<TradeId>,
}

impl AgentAction {
    pub fn no_action(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            action_name: "no_action".to_string(),
            parameters: BTreeMap::new(),
            messages_to_send: Vec::new(),
            trade_proposal: None,
            trade_acceptance_id: None,
        }
    }
}

/// The payload of a `trade_propose` action, before an id has been assigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct TradeProposalRequest {
    pub eligible_acceptors: Vec<String>,
    pub offering: BTreeMap<String, u64>,
    pub requesting: BTreeMap<String, u64>,
    pub expires_at_step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationStep {
    pub step_number: u32,
    pub agent_actions: Vec<AgentAction>,
    pub triggered_effects_log: Vec<String>,
    pub state_before: SimulationState,
    pub state_after: SimulationState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationResult {
    pub situation: Situation,
    pub steps: Vec<SimulationStep>,
    pub final_state: SimulationState,
}

/// Reserved action names with built-in dispatch, outside the
/// `ActionDefinition` lookup tables.
pub mod builtin_actions {
    pub const NO_ACTION: &str = "no_action";
    pub const TRADE_PROPOSE: &str = "trade_propose";
    pub const TRADE_ACCEPT: &str = "trade_accept";
    pub const TRADE_REJECT: &str = "trade_reject";
}


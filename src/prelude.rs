//! Convenience re-exports for downstream crates that drive the simulator
//! and intervention runner without wanting to spell out every module path.

// 1. Core data model
pub use crate::situation::{
    ActionDefinition, AgentDefinition, Availability, Channel, ComparisonOperator, Communication,
    Effect, EnvironmentDefinition, InventoryCondition, InventoryRule, ItemDefinition, Membership,
    ParameterDefinition, ParameterKind, PersonaField, QuantityRef, Situation,
};
pub use crate::state::{
    AgentAction, Inventory, Message, SimulationResult, SimulationState, SimulationStep, TradeId,
    TradeProposal, TradeProposalRequest, TradeRecord, TradeStatus,
};

// 2. The simulation loop
pub use crate::simulator::{create_initial_state, Simulator};

// 3. Intervention testing
pub use crate::intervention::{BatchRunReport, InterventionRun, InterventionRunner, RunId};
pub use crate::policy::PolicyAgentResult;

// 4. Forecast scoring
pub use crate::forecast::{
    calculate_brier_score, resolve_all_forecasts, ForecastCategory, HardMetricCriteria,
    InterventionForecast,
};

// 5. The LLM boundary (external collaborators implement these)
pub use crate::llm::{extract, CompletionRequest, CompletionResponse, LlmClient, StructuredExtractor};

// 6. Cost budgeting
pub use crate::cost::{ensure_budget_available, record_cost, CostScope};

// 7. Persistence
pub use crate::io::{JsonlRunStore, RunDirWriter};

// 8. Errors
pub use crate::error::{ConfigError, CostError, IoError, LlmError, SitsimError, SitsimResult};

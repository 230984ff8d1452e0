//! Effect engine: the atomic interpreter for [`Effect`]s, trade resolution,
//! and step-end rule firing.
//!
//! Stateless except for its reference to the current [`SimulationState`]
//! and [`Situation`] passed into each call. Effect application is
//! best-effort and resilient: unknown targets, unknown items, malformed
//! parameter references, or negative computed quantities are clamped or
//! logged rather than raised. Trade failures are reported as return values,
//! never as errors.

use std::collections::BTreeMap;

use rand::Rng;
use tracing::warn;

use crate::situation::{Effect, QuantityRef, Situation, ACTOR_TOKEN, ENVIRONMENT_TOKEN};
use crate::state::{SimulationState, TradeId, TradeRecord, TradeStatus};

/// Applies a list of effects in order, substituting `params` into each
/// effect's `target`/`source`/`item_name`/`quantity` fields, and returns a
/// human-readable log line per effect for transcript assembly.
///
/// `rng` drives `random_outcome`'s draw; callers that need a reproducible
/// run (e.g. a seeded scenario) pass a seeded `StdRng`, matching the
/// `&mut StdRng` threading convention used for reproducible draws elsewhere
/// in this codebase.
pub fn apply_effects(
    state: &mut SimulationState,
    situation: &Situation,
    effects: &[Effect],
    actor: &str,
    params: &BTreeMap<String, String>,
    rng: &mut impl Rng,
) -> Vec<String> {
    let mut log = Vec::with_capacity(effects.len());
    for effect in effects {
        apply_single_effect(state, situation, effect, actor, params, rng, &mut log);
    }
    log
}

fn apply_single_effect(
    state: &mut SimulationState,
    situation: &Situation,
    effect: &Effect,
    actor: &str,
    params: &BTreeMap<String, String>,
    rng: &mut impl Rng,
    log: &mut Vec<String>,
) {
    match effect {
        Effect::AddItem {
            target,
            item_name,
            quantity,
        } => {
            let target = resolve_owner(target, actor, params);
            let item_name = resolve_param_refs(item_name, params);
            let qty = resolve_quantity(quantity, params);
            let new_total = modify_inventory(state, &target, &item_name, qty as i64);
            log.push(format!("{target} gained {qty} {item_name} (now {new_total})"));
        }
        Effect::RemoveItem {
            target,
            item_name,
            quantity,
        } => {
            let target = resolve_owner(target, actor, params);
            let item_name = resolve_param_refs(item_name, params);
            let qty = resolve_quantity(quantity, params);
            let current = inventory_count(state, &target, &item_name);
            let removed = current.min(qty.max(0) as u64);
            modify_inventory(state, &target, &item_name, -(removed as i64));
            log.push(format!("{target} lost {removed} {item_name}"));
        }
        Effect::TransferItem {
            source,
            target,
            item_name,
            quantity,
        } => {
            let source = resolve_owner(source, actor, params);
            let target = resolve_owner(target, actor, params);
            let item_name = resolve_param_refs(item_name, params);
            let qty = resolve_quantity(quantity, params);
            let available = inventory_count(state, &source, &item_name);
            let moved = available.min(qty.max(0) as u64);
            modify_inventory(state, &source, &item_name, -(moved as i64));
            modify_inventory(state, &target, &item_name, moved as i64);
            log.push(format!("{moved} {item_name} moved from {source} to {target}"));
        }
        Effect::RandomOutcome { outcomes } => {
            let roll: f64 = rng.random();
            let mut cumulative = 0.0;
            let chosen = outcomes
                .iter()
                .find(|branch| {
                    cumulative += branch.probability;
                    roll <= cumulative
                })
                .or_else(|| outcomes.last());

            if let Some(branch) = chosen {
                log.push(format!("random_outcome chose: {}", branch.description));
                for nested in &branch.effects {
                    apply_single_effect(state, situation, nested, actor, params, rng, log);
                }
            }
        }
        Effect::Message { target, message_text } => {
            let target = resolve_owner(target, actor, params);
            let message_text = resolve_param_refs(message_text, params);
            log.push(format!("message to {target}: {message_text}"));
        }
    }
}

/// Resolves a `target`/`source` string: `actor` -> the acting agent's name,
/// `environment` -> the reserved environment token, `{param}` -> the
/// substituted parameter value, anything else -> a literal agent name.
fn resolve_owner(raw: &str, actor: &str, params: &BTreeMap<String, String>) -> String {
    let substituted = resolve_param_refs(raw, params);
    match substituted.as_str() {
        ACTOR_TOKEN => actor.to_string(),
        other => other.to_string(),
    }
}

/// Single-token `{name}` substitution. Deliberately restricted: no nested
/// references, no expression evaluation.
fn resolve_param_refs(raw: &str, params: &BTreeMap<String, String>) -> String {
    if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}'))
        && let Some(value) = params.get(inner)
    {
        return value.clone();
    }
    raw.to_string()
}

fn resolve_quantity(quantity: &QuantityRef, params: &BTreeMap<String, String>) -> i64 {
    match quantity {
        QuantityRef::Literal(n) => *n,
        QuantityRef::Param(name) => {
            let substituted = resolve_param_refs(name, params);
            substituted.parse::<i64>().unwrap_or_else(|_| {
                warn!("failed to parse quantity param '{substituted}' as an integer, defaulting to 0");
                0
            })
        }
    }
}

fn inventory_count(state: &SimulationState, owner: &str, item_name: &str) -> u64 {
    if owner == ENVIRONMENT_TOKEN {
        state.environment_inventory.get(item_name).copied().unwrap_or(0)
    } else {
        state.item_count(owner, item_name)
    }
}

/// Adds `delta` (signed) to `owner`'s count of `item_name`, clamping at 0
/// and removing the key entirely when it reaches 0. Returns the new count.
fn modify_inventory(state: &mut SimulationState, owner: &str, item_name: &str, delta: i64) -> u64 {
    let inventory = if owner == ENVIRONMENT_TOKEN {
        &mut state.environment_inventory
    } else {
        state.inventories.entry(owner.to_string()).or_default()
    };

    let current = inventory.get(item_name).copied().unwrap_or(0) as i64;
    let updated = (current + delta).max(0) as u64;

    if updated == 0 {
        inventory.remove(item_name);
    } else {
        inventory.insert(item_name.to_string(), updated);
    }
    updated
}

/// Attempts to resolve a pending trade in `acceptor`'s favor. Fails with a
/// reason (never raises) if the proposal is missing, not pending, the
/// acceptor is ineligible, or either party can no longer fulfil their side.
pub fn resolve_trade(state: &mut SimulationState, proposal_id: TradeId, acceptor: &str) -> (bool, String) {
    let Some(index) = state.pending_trades.iter().position(|t| t.id == proposal_id) else {
        return (false, format!("no such trade proposal: {proposal_id:?}"));
    };

    if state.pending_trades[index].status != TradeStatus::Pending {
        return (false, "trade proposal is not pending".to_string());
    }

    if !state.pending_trades[index]
        .eligible_acceptors
        .iter()
        .any(|a| a == acceptor)
    {
        return (false, format!("{acceptor} is not an eligible acceptor"));
    }

    let proposer = state.pending_trades[index].proposer.clone();
    let offering = state.pending_trades[index].offering.clone();
    let requesting = state.pending_trades[index].requesting.clone();

    let proposer_has_offering = offering
        .iter()
        .all(|(item, qty)| state.item_count(&proposer, item) >= *qty);

    if !proposer_has_offering {
        state.pending_trades[index].status = TradeStatus::Expired;
        return (false, format!("{proposer} can no longer fulfil the offered items"));
    }

    let acceptor_has_requesting = requesting
        .iter()
        .all(|(item, qty)| state.item_count(acceptor, item) >= *qty);

    if !acceptor_has_requesting {
        return (false, format!("{acceptor} lacks the requested items"));
    }

    let step = state.step_number;
    for (item, qty) in &offering {
        modify_inventory(state, &proposer, item, -(*qty as i64));
        modify_inventory(state, acceptor, item, *qty as i64);
        state.trade_history.push(TradeRecord {
            item_name: item.clone(),
            quantity: *qty,
            from_agent: proposer.clone(),
            to_agent: acceptor.to_string(),
            step,
            trade_id: proposal_id,
        });
    }
    for (item, qty) in &requesting {
        modify_inventory(state, acceptor, item, -(*qty as i64));
        modify_inventory(state, &proposer, item, *qty as i64);
        state.trade_history.push(TradeRecord {
            item_name: item.clone(),
            quantity: *qty,
            from_agent: acceptor.to_string(),
            to_agent: proposer.clone(),
            step,
            trade_id: proposal_id,
        });
    }

    state.pending_trades[index].status = TradeStatus::Accepted;
    (true, format!("{acceptor} accepted trade {proposal_id:?} from {proposer}"))
}

/// Sets a pending proposal's status to `rejected`. No-op (reported, not
/// raised) if the proposal is missing or already resolved.
pub fn reject_trade(state: &mut SimulationState, proposal_id: TradeId) -> (bool, String) {
    match state.pending_trade_mut(proposal_id) {
        Some(trade) if trade.status == TradeStatus::Pending => {
            trade.status = TradeStatus::Rejected;
            (true, format!("trade {proposal_id:?} rejected"))
        }
        Some(_) => (false, "trade proposal is not pending".to_string()),
        None => (false, format!("no such trade proposal: {proposal_id:?}")),
    }
}

/// Expires any pending trade whose deadline has passed relative to the
/// current step number.
pub fn expire_trades(state: &mut SimulationState) -> Vec<String> {
    let step = state.step_number;
    let mut log = Vec::new();
    for trade in &mut state.pending_trades {
        if trade.status == TradeStatus::Pending && step > trade.expires_at_step {
            trade.status = TradeStatus::Expired;
            log.push(format!("trade {:?} expired at step {step}", trade.id));
        }
    }
    log
}

/// Fires every inventory rule whose conditions hold, for every agent (in
/// declaration order) then the environment. Rules do not recurse: a rule's
/// own effects are never re-checked within the same pass.
pub fn process_step_end_rules(state: &mut SimulationState, situation: &Situation, rng: &mut impl Rng) -> Vec<String> {
    let mut log = Vec::new();

    for agent in &situation.agents {
        for rule in &agent.inventory_rules {
            let holds = evaluate_conditions(state, &rule.conditions, &agent.name);
            if holds {
                let params = BTreeMap::new();
                log.push(format!("rule '{}' fired for {}", rule.name, agent.name));
                log.extend(apply_effects(state, situation, &rule.effects, &agent.name, &params, rng));
            }
        }
    }

    for rule in &situation.environment.inventory_rules {
        let holds = evaluate_conditions(state, &rule.conditions, ENVIRONMENT_TOKEN);
        if holds {
            let params = BTreeMap::new();
            log.push(format!("rule '{}' fired for environment", rule.name));
            log.extend(apply_effects(state, situation, &rule.effects, ENVIRONMENT_TOKEN, &params, rng));
        }
    }

    log
}

/// Empty condition list is always-true. Missing items are treated as count 0.
fn evaluate_conditions(
    state: &SimulationState,
    conditions: &[crate::situation::InventoryCondition],
    owner: &str,
) -> bool {
    conditions.iter().all(|cond| {
        let actual = inventory_count(state, owner, &cond.item_name) as i64;
        cond.operator.evaluate(actual, cond.threshold)
    })
}

//! Ready and Progressing conditions for `ChiStatus`.

use crate::crd::{ChiPhase, Condition};

/// Merges new conditions into an existing list, one per type.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Start from the conditions already on the object.
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition. The transition time is kept when the
    /// status did not change.
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    pub fn progressing(
        &mut self,
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::progressing(
            progressing,
            reason,
            message,
            generation,
        ))
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Conditions describing a phase.
pub fn phase_conditions(
    existing: &[Condition],
    phase: ChiPhase,
    message: &str,
    generation: Option<i64>,
) -> Vec<Condition> {
    let mut builder = ConditionBuilder::from_existing(existing);
    match phase {
        ChiPhase::New => builder
            .ready(false, "Pending", message, generation)
            .progressing(false, "Pending", message, generation),
        ChiPhase::InProgress => builder
            .ready(false, "Reconciling", message, generation)
            .progressing(true, "Reconciling", message, generation),
        ChiPhase::Completed => builder
            .ready(true, "Completed", message, generation)
            .progressing(false, "Completed", message, generation),
        ChiPhase::Failed => builder
            .ready(false, "ReconcileFailed", message, generation)
            .progressing(false, "ReconcileFailed", message, generation),
    };
    builder.build()
}

/// Whether the condition of `condition_type` has status "True".
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

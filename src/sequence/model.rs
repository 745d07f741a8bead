//! Sequence runs, rules, and the run state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two rule families. Same scheduling algorithm, different keys and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceFamily {
    /// Inactivity follow-up; rules ordered by delay.
    FollowUp,
    /// Abandoned-cart recovery; rules ordered by explicit position.
    AbandonedCart,
}

impl SequenceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FollowUp => "follow_up",
            Self::AbandonedCart => "abandoned_cart",
        }
    }
}

impl fmt::Display for SequenceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SequenceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow_up" => Ok(Self::FollowUp),
            "abandoned_cart" => Ok(Self::AbandonedCart),
            other => Err(format!("unknown sequence family: {other}")),
        }
    }
}

/// Status of a sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequenceStatus {
    /// Timer chain is armed.
    Active,
    /// Manually held; firings no-op until resumed.
    Paused,
    /// Every rule was sent.
    Completed,
    /// Customer converted; stop.
    Converted,
    /// Stopped externally or by customer activity.
    Cancelled,
    /// Unrecoverable error.
    Failed,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Converted => "converted",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: SequenceStatus) -> bool {
        use SequenceStatus::*;

        matches!(
            (self, target),
            (Active, Paused) | (Active, Completed) | (Active, Converted) |
            (Active, Cancelled) | (Active, Failed) |
            (Paused, Active) | (Paused, Converted) | (Paused, Cancelled) | (Paused, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Converted | Self::Cancelled | Self::Failed
        )
    }
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SequenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "converted" => Ok(Self::Converted),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sequence status: {other}")),
        }
    }
}

/// One step template of a workspace's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRule {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub family: SequenceFamily,
    pub delay_seconds: i64,
    /// Instruction for the AI, also the fallback text when generation fails.
    pub instruction: String,
    pub position: i64,
}

impl SequenceRule {
    pub fn new(
        workspace_id: Uuid,
        family: SequenceFamily,
        delay: Duration,
        instruction: impl Into<String>,
        position: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            family,
            delay_seconds: delay.num_seconds(),
            instruction: instruction.into(),
            position,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::seconds(self.delay_seconds.max(0))
    }
}

/// Cart snapshot attached to an abandoned-cart run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cart_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<serde_json::Value>,
}

/// One run of a timed sequence for a client (follow-up) or conversation (cart).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRun {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub client_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub family: SequenceFamily,
    pub status: SequenceStatus,
    /// Index into the ordered rule list. Never decreases.
    pub current_step: i64,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set while `Paused`; the time left on the step is `next_fire_at - paused_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cart: Option<CartDetails>,
}

impl SequenceRun {
    pub fn new(
        workspace_id: Uuid,
        client_id: Uuid,
        conversation_id: Option<Uuid>,
        family: SequenceFamily,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            client_id,
            conversation_id,
            family,
            status: SequenceStatus::Active,
            current_step: 0,
            next_fire_at: None,
            started_at: now,
            completed_at: None,
            paused_at: None,
            cart: None,
        }
    }
}

/// Which run a step job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepTarget {
    FollowUp {
        #[serde(rename = "followUpId")]
        follow_up_id: Uuid,
    },
    Cart {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
}

/// Payload of a delayed sequence-step job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStepJob {
    #[serde(flatten)]
    pub target: StepTarget,
    pub rule_id: Uuid,
    pub workspace_id: Uuid,
}

impl SequenceStepJob {
    pub fn for_run(run: &SequenceRun, rule_id: Uuid) -> Option<Self> {
        let target = match run.family {
            SequenceFamily::FollowUp => StepTarget::FollowUp {
                follow_up_id: run.id,
            },
            SequenceFamily::AbandonedCart => StepTarget::Cart {
                conversation_id: run.conversation_id?,
            },
        };
        Some(Self {
            target,
            rule_id,
            workspace_id: run.workspace_id,
        })
    }

    /// Deterministic job id; re-enqueueing the same step is a no-op.
    pub fn job_id(&self) -> String {
        match self.target {
            StepTarget::FollowUp { follow_up_id } => {
                format!("seq_{}_step_{}", follow_up_id, self.rule_id)
            }
            StepTarget::Cart { conversation_id } => {
                format!("acart_{}_rule_{}", conversation_id, self.rule_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_exits() {
        use SequenceStatus::*;
        let all = [Active, Paused, Completed, Converted, Cancelled, Failed];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn step_job_ids_are_deterministic() {
        let rule = Uuid::new_v4();
        let ws = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let job = SequenceStepJob {
            target: StepTarget::FollowUp { follow_up_id: run_id },
            rule_id: rule,
            workspace_id: ws,
        };
        assert_eq!(job.job_id(), format!("seq_{run_id}_step_{rule}"));

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["followUpId"], run_id.to_string());
        assert_eq!(json["ruleId"], rule.to_string());
        let back: SequenceStepJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn cart_job_payload_is_keyed_by_conversation() {
        let conv = Uuid::new_v4();
        let json = serde_json::json!({
            "conversationId": conv,
            "ruleId": Uuid::new_v4(),
            "workspaceId": Uuid::new_v4(),
        });
        let job: SequenceStepJob = serde_json::from_value(json).unwrap();
        assert_eq!(job.target, StepTarget::Cart { conversation_id: conv });
        assert!(job.job_id().starts_with(&format!("acart_{conv}_rule_")));
    }

    #[test]
    fn cart_details_total_is_decimal() {
        let cart: CartDetails =
            serde_json::from_value(serde_json::json!({ "cartUrl": "https://s/c/1", "total": "149.90" }))
                .unwrap();
        assert_eq!(cart.total, Some(rust_decimal_macros::dec!(149.90)));
    }
}

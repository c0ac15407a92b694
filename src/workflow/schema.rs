//! Workflow data structures: plans, blocks, triggers, validation,
//! checkpoints, pacing. Blocks are declarative; the executor interprets
//! them.

use crate::container::schema::OperationId;
use crate::persist::shard::ShardSpec;
use serde::{Deserialize, Serialize};

/// An ordered sequence of blocks bound to one profile and one keyword
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub profile_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSpec>,
    pub blocks: Vec<BlockSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSpec {
    pub id: String,
    /// Runs only after all listed blocks succeeded.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointSpec>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry: u32,
    #[serde(default = "default_block_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub pacing: Pacing,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub on_failure: OnFailure,
    pub actions: Vec<BlockAction>,
}

fn default_block_timeout() -> u64 {
    120_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Trigger {
    /// Runs once at plan start, in declaration order.
    Startup,
    /// Runs each time the container event fires in the active page.
    #[serde(rename_all = "camelCase")]
    ContainerEvent {
        container: String,
        event: ContainerEventKind,
        #[serde(default)]
        once_per_appear: bool,
    },
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::Startup
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerEventKind {
    Appear,
    Exist,
    Change,
    Disappear,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Predicate>,
}

/// A conjunctive predicate over the page and one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_includes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_in: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerCheck>,
}

impl Predicate {
    pub fn is_empty(&self) -> bool {
        self.host_includes.is_none() && self.checkpoint_in.is_empty() && self.container.is_none()
    }
}

/// `selector` names a container in the library, not raw CSS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCheck {
    pub selector: String,
    #[serde(default)]
    pub must_exist: bool,
    #[serde(default)]
    pub min_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub target_checkpoint: String,
    #[serde(default)]
    pub recovery: Recovery,
    #[serde(default)]
    pub allow_one_level_up_fallback: bool,
    #[serde(default = "default_checkpoint_timeout")]
    pub timeout_ms: u64,
}

fn default_checkpoint_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recovery {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub actions: Vec<RecoveryAction>,
}

/// Recovery is deliberately narrow: key presses, declared back
/// containers, and waits. Page reloads are not a recovery action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecoveryAction {
    PressKey { key: String },
    ClickContainer { container: String },
    Wait { ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pacing {
    #[serde(default = "default_op_interval")]
    pub operation_min_interval_ms: u64,
    #[serde(default = "default_event_cooldown")]
    pub event_cooldown_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    #[serde(default = "default_nav_interval")]
    pub navigation_min_interval_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            operation_min_interval_ms: default_op_interval(),
            event_cooldown_ms: default_event_cooldown(),
            jitter_ms: default_jitter(),
            navigation_min_interval_ms: default_nav_interval(),
        }
    }
}

fn default_op_interval() -> u64 {
    800
}

fn default_event_cooldown() -> u64 {
    1_000
}

fn default_jitter() -> u64 {
    300
}

fn default_nav_interval() -> u64 {
    2_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Op,
    Script,
    Subscription,
}

impl Default for Impact {
    fn default() -> Self {
        Impact::Op
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Record the failure and keep going.
    Continue,
    /// Skip every block that depends (transitively) on this one.
    ChainStop,
    /// Fail the whole plan.
    StopAll,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::ChainStop
    }
}

/// The step vocabulary a block is composed of. Everything runs through
/// the session service and the operation executor; no raw DOM access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BlockAction {
    #[serde(rename_all = "camelCase")]
    Goto {
        url: String,
        #[serde(default = "default_goto_timeout")]
        timeout_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    EnsureCheckpoint {
        target: String,
        #[serde(default = "default_checkpoint_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        allow_one_level_up_fallback: bool,
    },
    ContainerOp {
        container: String,
        operation: OperationId,
        #[serde(default)]
        config: serde_json::Value,
    },
    PressKey {
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    TypeText {
        text: String,
        #[serde(default = "default_type_delay")]
        delay_ms: u64,
        #[serde(default)]
        submit: bool,
    },
    Sleep {
        ms: u64,
    },
    /// Extract link rows from a list container and append deduplicated
    /// link records to the keyword directory, honoring the plan shard.
    #[serde(rename_all = "camelCase")]
    CollectLinks {
        container: String,
        /// Extract field holding the note URL.
        url_field: String,
        #[serde(default)]
        target_count: u64,
    },
    SaveCookies {
        #[serde(default)]
        force: bool,
    },
}

fn default_goto_timeout() -> u64 {
    15_000
}

fn default_type_delay() -> u64 {
    30
}

/// Execution status shared by plans and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_deserializes() {
        let plan: Plan = serde_json::from_value(serde_json::json!({
            "id": "xhs-harvest",
            "profileId": "xiaohongshu_fresh",
            "platform": "xiaohongshu",
            "env": "prod",
            "keyword": "红茶",
            "blocks": [
                {
                    "id": "open_home",
                    "actions": [
                        {"type": "goto", "url": "https://www.xiaohongshu.com/explore"},
                        {"type": "ensureCheckpoint", "target": "home_ready"}
                    ]
                },
                {
                    "id": "collect",
                    "dependsOn": ["open_home"],
                    "retry": 2,
                    "onFailure": "stop_all",
                    "checkpoint": {
                        "targetCheckpoint": "search_ready",
                        "recovery": {
                            "attempts": 2,
                            "actions": [{"type": "pressKey", "key": "Escape"}]
                        }
                    },
                    "actions": [
                        {"type": "collectLinks",
                         "container": "xiaohongshu_search.search_result_item",
                         "urlField": "href", "targetCount": 40}
                    ]
                }
            ]
        }))
        .unwrap();

        assert_eq!(plan.blocks.len(), 2);
        assert_eq!(plan.blocks[0].trigger, Trigger::Startup);
        assert_eq!(plan.blocks[1].depends_on, vec!["open_home"]);
        assert_eq!(plan.blocks[1].retry, 2);
        assert_eq!(plan.blocks[1].on_failure, OnFailure::StopAll);
        let cp = plan.blocks[1].checkpoint.as_ref().unwrap();
        assert_eq!(cp.target_checkpoint, "search_ready");
        assert_eq!(
            cp.recovery.actions,
            vec![RecoveryAction::PressKey {
                key: "Escape".into()
            }]
        );
    }

    #[test]
    fn test_container_event_trigger() {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({
            "type": "containerEvent",
            "container": "xiaohongshu_detail.comments",
            "event": "appear",
            "oncePerAppear": true
        }))
        .unwrap();
        match trigger {
            Trigger::ContainerEvent {
                container,
                event,
                once_per_appear,
            } => {
                assert_eq!(container, "xiaohongshu_detail.comments");
                assert_eq!(event, ContainerEventKind::Appear);
                assert!(once_per_appear);
            }
            Trigger::Startup => panic!("expected container event"),
        }
    }

    #[test]
    fn test_pacing_defaults() {
        let pacing: Pacing = serde_json::from_str("{}").unwrap();
        assert_eq!(pacing.operation_min_interval_ms, 800);
        assert_eq!(pacing.navigation_min_interval_ms, 2_000);
    }

    #[test]
    fn test_defaults() {
        let block: BlockSpec = serde_json::from_value(serde_json::json!({
            "id": "b",
            "actions": []
        }))
        .unwrap();
        assert_eq!(block.on_failure, OnFailure::ChainStop);
        assert_eq!(block.impact, Impact::Op);
        assert_eq!(block.timeout_ms, 120_000);
    }
}

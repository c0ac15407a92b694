//! Plan-level tests: a realistic harvest plan parses, validates, and
//! carries the full block contract through serde.

use webauto_lib::workflow::{
    ContainerEventKind, ExecutionStatus, OnFailure, Plan, PlanExecutor, Trigger,
};

fn harvest_plan() -> serde_json::Value {
    serde_json::json!({
        "id": "xhs-tea-harvest",
        "profileId": "xiaohongshu_fresh",
        "platform": "xiaohongshu",
        "env": "prod",
        "keyword": "红茶",
        "shard": {"index": 2, "count": 4, "by": "noteId-hash"},
        "blocks": [
            {
                "id": "open_search",
                "onFailure": "stop_all",
                "actions": [
                    {"type": "goto", "url": "https://www.xiaohongshu.com/explore"},
                    {"type": "ensureCheckpoint", "target": "home_ready", "timeoutMs": 10000},
                    {"type": "containerOp",
                     "container": "xiaohongshu_home.search_input",
                     "operation": "click"},
                    {"type": "typeText", "text": "红茶", "submit": true},
                    {"type": "ensureCheckpoint", "target": "search_ready"}
                ]
            },
            {
                "id": "collect_links",
                "dependsOn": ["open_search"],
                "retry": 2,
                "timeoutMs": 300000,
                "pacing": {"operationMinIntervalMs": 1200, "navigationMinIntervalMs": 4000},
                "validation": {
                    "pre": {"hostIncludes": "xiaohongshu.com",
                            "container": {"selector": "xiaohongshu_search.search_result_item",
                                          "mustExist": true, "minCount": 1}}
                },
                "checkpoint": {
                    "targetCheckpoint": "search_ready",
                    "recovery": {"attempts": 2,
                                 "actions": [{"type": "pressKey", "key": "Escape"},
                                             {"type": "wait", "ms": 1000}]}
                },
                "actions": [
                    {"type": "collectLinks",
                     "container": "xiaohongshu_search.search_result_item",
                     "urlField": "href",
                     "targetCount": 40},
                    {"type": "containerOp",
                     "container": "xiaohongshu_search.search_result_list",
                     "operation": "scroll",
                     "config": {"direction": "down", "amount": 800.0}},
                    {"type": "saveCookies"}
                ]
            },
            {
                "id": "halt_on_guard",
                "trigger": {"type": "containerEvent",
                            "container": "xiaohongshu_login.qrcode_guard",
                            "event": "appear",
                            "oncePerAppear": true},
                "onFailure": "stop_all",
                "actions": [
                    {"type": "ensureCheckpoint", "target": "search_ready", "timeoutMs": 1000}
                ]
            }
        ]
    })
}

#[test]
fn test_harvest_plan_parses_and_validates() {
    let plan: Plan = serde_json::from_value(harvest_plan()).unwrap();
    PlanExecutor::validate(&plan).unwrap();

    assert_eq!(plan.blocks.len(), 3);
    assert_eq!(plan.shard.unwrap().index, 2);

    let collect = &plan.blocks[1];
    assert_eq!(collect.depends_on, vec!["open_search"]);
    assert_eq!(collect.retry, 2);
    assert_eq!(collect.pacing.operation_min_interval_ms, 1200);
    // Unspecified pacing fields keep their defaults.
    assert_eq!(collect.pacing.event_cooldown_ms, 1000);
    let validation = collect.validation.as_ref().unwrap();
    let container = validation.pre.as_ref().unwrap().container.as_ref().unwrap();
    assert!(container.must_exist);

    let guard = &plan.blocks[2];
    assert_eq!(guard.on_failure, OnFailure::StopAll);
    match &guard.trigger {
        Trigger::ContainerEvent { event, once_per_appear, .. } => {
            assert_eq!(*event, ContainerEventKind::Appear);
            assert!(*once_per_appear);
        }
        Trigger::Startup => panic!("guard block must be event-triggered"),
    }
}

#[test]
fn test_plan_roundtrips_through_serde() {
    let plan: Plan = serde_json::from_value(harvest_plan()).unwrap();
    let text = serde_json::to_string(&plan).unwrap();
    let again: Plan = serde_json::from_str(&text).unwrap();
    PlanExecutor::validate(&again).unwrap();
    assert_eq!(again.blocks[1].actions.len(), plan.blocks[1].actions.len());
}

#[test]
fn test_status_values_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&ExecutionStatus::Completed).unwrap(),
        "\"completed\""
    );
    assert_eq!(
        serde_json::to_string(&ExecutionStatus::Cancelled).unwrap(),
        "\"cancelled\""
    );
}

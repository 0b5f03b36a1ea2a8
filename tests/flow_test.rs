use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lead_protocol::{DeadLetter, TaskEnvelope, TaskOutcome, TaskReport};
use leadflow::apps::App;
use leadflow::broker::{Broker, BrokerHandle, InMemoryBroker};
use leadflow::config::EngineConfig;
use leadflow::dispatcher::{DispatchOutcome, DispatchRequest};
use leadflow::error::{EngineError, ErrorKind};
use leadflow::flow::store::InMemoryFlowStore;
use leadflow::flow::{Edge, Flow, FlowDefinition, FlowStatus, Node, NodeKind};
use leadflow::lead::LeadStatus;
use leadflow::lead::store::InMemoryLeadStore;
use serde_json::json;

/// A(webhook) -> B(aiCall) --success--> C(email); B has no `fail` route.
fn qualify_flow(owner: &str, name: &str) -> FlowDefinition {
    FlowDefinition {
        owner: owner.into(),
        name: name.into(),
        nodes: vec![
            Node::new("A", NodeKind::Webhook),
            Node::new("B", NodeKind::AiCall),
            Node::new("C", NodeKind::Email),
        ],
        edges: vec![Edge::new("A", "B"), Edge::new("B", "C").on("success")],
    }
}

async fn running_app() -> (App, Arc<InMemoryBroker>) {
    let (app, memory) = App::in_memory(EngineConfig::default());
    app.bootstrap().await.unwrap();
    (app, memory)
}

async fn active_flow(app: &App, def: FlowDefinition) -> Flow {
    let flow = app.create_flow(def).await.unwrap();
    app.set_flow_status(&flow.id, FlowStatus::Active).await.unwrap()
}

fn envelopes(memory: &InMemoryBroker, queue: &str) -> Vec<TaskEnvelope> {
    memory
        .messages(queue)
        .iter()
        .map(|m| TaskEnvelope::from_bytes(m).unwrap())
        .collect()
}

#[tokio::test]
async fn create_topology_makes_one_bound_queue_per_node() {
    let (app, memory) = running_app().await;
    let flow = app.create_flow(qualify_flow("acme", "q")).await.unwrap();

    let queues: Vec<String> = memory
        .queue_names()
        .into_iter()
        .filter(|q| q.starts_with(&format!("acme.{}.", flow.id)))
        .collect();
    assert_eq!(queues.len(), flow.nodes.len());

    for node in &flow.nodes {
        let key = format!("acme.{}.{}", flow.id, node.id);
        assert_eq!(
            memory.bindings_of(&key),
            vec![(node.kind.exchange_name().to_string(), key.clone())]
        );
    }
}

#[tokio::test]
async fn dispatch_without_a_matching_route_finishes_silently() {
    let (app, memory) = running_app().await;
    let flow = active_flow(&app, qualify_flow("acme", "q")).await;
    let report = app.ingest("acme", &flow.id, "A", vec![json!({"n": 1})]).await.unwrap();
    let before = memory.published().len();

    let out = app
        .publish_lead(&DispatchRequest::new("acme", &flow.id, "C"), &[&report.lead_ids[0]])
        .await
        .unwrap();

    assert!(matches!(out[0], DispatchOutcome::Completed { .. }));
    assert_eq!(memory.published().len(), before);
    assert_eq!(app.lead(&report.lead_ids[0]).await.unwrap().status, LeadStatus::Done);
}

#[tokio::test]
async fn success_branch_publishes_only_to_its_target() {
    let (app, memory) = running_app().await;
    let def = FlowDefinition {
        owner: "acme".into(),
        name: "split".into(),
        nodes: vec![
            Node::new("in", NodeKind::Sheet),
            Node::new("ai", NodeKind::AiCall),
            Node::new("yes", NodeKind::Email),
            Node::new("no", NodeKind::Sms),
        ],
        edges: vec![
            Edge::new("in", "ai"),
            Edge::new("ai", "yes").on("success"),
            Edge::new("ai", "no").on("fail"),
        ],
    };
    let flow = active_flow(&app, def).await;
    let report = app.ingest("acme", &flow.id, "in", vec![json!({})]).await.unwrap();

    app.publish_lead(
        &DispatchRequest::new("acme", &flow.id, "ai").with_branch(Some("success".into())),
        &[&report.lead_ids[0]],
    )
    .await
    .unwrap();

    assert_eq!(memory.queue_len(&flow.queue_name("yes")), 1);
    assert_eq!(memory.queue_len(&flow.queue_name("no")), 0);
}

#[tokio::test]
async fn deleting_a_flow_keeps_shared_exchanges_working() {
    let (app, memory) = running_app().await;
    let doomed = active_flow(&app, qualify_flow("acme", "doomed")).await;
    let survivor = active_flow(&app, qualify_flow("acme", "survivor")).await;

    app.set_flow_status(&doomed.id, FlowStatus::Deleted).await.unwrap();

    for node in &doomed.nodes {
        assert!(!memory.has_queue(&doomed.queue_name(&node.id)));
        assert!(memory.has_exchange(node.kind.exchange_name()));
    }

    let report = app.ingest("acme", &survivor.id, "A", vec![json!({})]).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(memory.queue_len(&survivor.queue_name("B")), 1);

    let err = app.ingest("acme", &doomed.id, "A", vec![json!({})]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn retry_clears_the_error_and_republishes_once() {
    let (app, memory) = running_app().await;
    let flow = active_flow(&app, qualify_flow("acme", "q")).await;
    let report = app.ingest("acme", &flow.id, "A", vec![json!({})]).await.unwrap();
    let lead_id = report.lead_ids[0].clone();
    let b_queue = flow.queue_name("B");
    assert!(memory.pop(&b_queue).is_some());

    app.report(TaskReport {
        lead_id: lead_id.clone(),
        flow_id: flow.id.clone(),
        owner: "acme".into(),
        node_id: "B".into(),
        outcome: TaskOutcome::Failed { message: "llm quota".into() },
    })
    .await
    .unwrap();

    let parked = app.lead(&lead_id).await.unwrap();
    assert!(parked.error.status);
    assert_eq!(parked.error.retry_count, 1);
    let letter = DeadLetter::from_bytes(&memory.messages("lead.dead-letter")[0]).unwrap();
    assert_eq!(letter.task.lead_id, lead_id);
    assert_eq!(letter.task.target_node_id, "B");

    app.retry_lead(&lead_id).await.unwrap();

    let retried = app.lead(&lead_id).await.unwrap();
    assert!(!retried.error.status);
    let republished = envelopes(&memory, &b_queue);
    assert_eq!(republished.len(), 1);
    assert_eq!(republished[0].lead_id, lead_id);
    assert_eq!(memory.queue_len(&flow.queue_name("C")), 0);
}

#[tokio::test]
async fn end_to_end_through_a_branching_node() {
    let (app, memory) = running_app().await;
    let flow = active_flow(&app, qualify_flow("acme", "q")).await;

    // ingest one record at A
    let report = app.ingest("acme", &flow.id, "A", vec![json!({"email": "a@b.c"})]).await.unwrap();
    let lead_id = report.lead_ids[0].clone();
    let lead = app.lead(&lead_id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Queued);
    assert_eq!(envelopes(&memory, &flow.queue_name("B"))[0].lead_id, lead_id);

    // B fails the lead on a branch nobody handles
    let fail = app
        .publish_lead(
            &DispatchRequest::new("acme", &flow.id, "B").with_branch(Some("fail".into())),
            &[&lead_id],
        )
        .await
        .unwrap();
    assert!(matches!(fail[0], DispatchOutcome::Completed { .. }));
    assert_eq!(app.lead(&lead_id).await.unwrap().status, LeadStatus::Done);

    // a second lead takes the success branch and stays live
    let second = app.ingest("acme", &flow.id, "A", vec![json!({})]).await.unwrap().lead_ids[0].clone();
    app.publish_lead(
        &DispatchRequest::new("acme", &flow.id, "B").with_branch(Some("success".into())),
        &[&second],
    )
    .await
    .unwrap();
    assert_eq!(envelopes(&memory, &flow.queue_name("C"))[0].lead_id, second);
    assert!(!app.lead(&second).await.unwrap().status.is_terminal());

    // C has nowhere to go
    app.publish_lead(&DispatchRequest::new("acme", &flow.id, "C"), &[&second])
        .await
        .unwrap();
    assert_eq!(app.lead(&second).await.unwrap().status, LeadStatus::Done);
}

#[tokio::test]
async fn worker_reports_drive_a_lead_to_the_end() {
    let (app, memory) = running_app().await;
    let flow = active_flow(&app, qualify_flow("acme", "q")).await;
    let lead_id = app.ingest("acme", &flow.id, "A", vec![json!({})]).await.unwrap().lead_ids[0].clone();

    let report = |node: &str, outcome: TaskOutcome| TaskReport {
        lead_id: lead_id.clone(),
        flow_id: flow.id.clone(),
        owner: "acme".into(),
        node_id: node.into(),
        outcome,
    };

    app.report(report("B", TaskOutcome::Started)).await.unwrap();
    assert_eq!(app.lead(&lead_id).await.unwrap().status, LeadStatus::Processing);

    let verified = TaskOutcome::Completed {
        branch: None,
        verification: Some(lead_protocol::VerificationReport { passed: true, message: None }),
    };
    app.report(report("B", verified)).await.unwrap();
    assert_eq!(memory.queue_len(&flow.queue_name("C")), 1);

    let done = TaskOutcome::Completed { branch: None, verification: None };
    app.report(report("C", done)).await.unwrap();
    let lead = app.lead(&lead_id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Done);
    assert_eq!(lead.current_node_id.as_deref(), Some("C"));
}

#[tokio::test]
async fn concurrent_creates_share_one_connection() {
    let connects = Arc::new(AtomicUsize::new(0));
    let memory = Arc::new(InMemoryBroker::new());
    let (counter, shared) = (connects.clone(), memory.clone());
    let broker = BrokerHandle::lazy(move || {
        let counter = counter.clone();
        let shared = shared.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(shared as Arc<dyn Broker>)
        }
    });
    let app = App::new(
        EngineConfig::default(),
        broker,
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryLeadStore::new()),
    );

    let creates: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move { app.create_flow(qualify_flow("acme", &format!("f{i}"))).await })
        })
        .collect();
    for task in creates {
        task.await.unwrap().unwrap();
    }

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(memory.queue_names().len(), 8 * 3);
    app.shutdown().await;
}

#[tokio::test]
async fn failures_map_to_boundary_kinds() {
    let (app, memory) = running_app().await;
    let flow = app.create_flow(qualify_flow("acme", "q")).await.unwrap();

    let inactive = app.ingest("acme", &flow.id, "A", vec![json!({})]).await.unwrap_err();
    assert!(matches!(inactive, EngineError::FlowInactive { .. }));

    let dup = app.create_flow(qualify_flow("acme", "q")).await.unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::Conflict);

    assert_eq!(app.retry_lead("nope").await.unwrap_err().kind(), ErrorKind::NotFound);

    app.set_flow_status(&flow.id, FlowStatus::Active).await.unwrap();
    memory.set_available(false);
    let down = app.ingest("acme", &flow.id, "A", vec![json!({})]).await.unwrap_err();
    assert_eq!(down.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn failed_retry_and_late_reports_leave_lead_state_alone() {
    let (app, memory) = running_app().await;
    let flow = active_flow(&app, qualify_flow("acme", "q")).await;
    let lead_id = app.ingest("acme", &flow.id, "A", vec![json!({})]).await.unwrap().lead_ids[0].clone();
    let report = |node: &str, outcome: TaskOutcome| TaskReport {
        lead_id: lead_id.clone(),
        flow_id: flow.id.clone(),
        owner: "acme".into(),
        node_id: node.into(),
        outcome,
    };

    app.report(report("B", TaskOutcome::Failed { message: "llm quota".into() }))
        .await
        .unwrap();
    memory.set_available(false);
    let err = app.retry_lead(&lead_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    let parked = app.lead(&lead_id).await.unwrap();
    assert!(parked.error.status);
    assert_eq!(parked.error.message.as_deref(), Some("llm quota"));

    memory.set_available(true);
    app.retry_lead(&lead_id).await.unwrap();
    let fail = TaskOutcome::Completed { branch: Some("fail".into()), verification: None };
    app.report(report("B", fail)).await.unwrap();
    assert_eq!(app.lead(&lead_id).await.unwrap().status, LeadStatus::Done);

    let late = TaskOutcome::Completed { branch: Some("success".into()), verification: None };
    assert!(app.report(report("B", late)).await.unwrap().is_empty());
    assert_eq!(memory.queue_len(&flow.queue_name("C")), 0);
    assert_eq!(app.lead(&lead_id).await.unwrap().status, LeadStatus::Done);
}

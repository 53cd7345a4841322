//! Cross-scope behavior over real TCP channels: remote nodes, hub-to-hub
//! links, registration propagation, and disconnect cleanup.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::Instant;

use network_hub::{
    message::meta, HubConfig, Metadata, Node, RemoteNode, ResponseStatus, Scope, Supervisor,
};

fn insecure_config() -> HubConfig {
    HubConfig {
        insecure: true,
        verify_peer: false,
        reconnect_interval_sec: 1,
        ..HubConfig::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(3) {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_node_serves_and_calls_endpoints() {
    let mut sup = Supervisor::new(insecure_config());
    let addr = sup.serve(Scope::Network).await.unwrap();
    let hub = sup.get(Scope::Network).unwrap();
    let local = Node::attach(&hub);

    let remote = RemoteNode::connect(addr.to_string(), insecure_config())
        .await
        .unwrap();

    // The remote serves an endpoint; a local caller reaches it through
    // the hub, which dispatches back over the channel.
    remote
        .register_api("/remote/echo", Metadata::new(), |req| async move {
            Ok(req.payload)
        })
        .await
        .unwrap();
    let response = local
        .call_api_raw("/remote/echo", b"ping".to_vec(), Metadata::new())
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.payload, b"ping");

    // And the other direction: the remote calls a hub-side endpoint.
    local
        .register_api("/local/double", Metadata::new(), |req| async move {
            let n: u32 = postcard::from_bytes(&req.payload)
                .map_err(|e| network_hub::HubError::Handler(e.to_string()))?;
            postcard::to_stdvec(&(n * 2))
                .map_err(|e| network_hub::HubError::Handler(e.to_string()))
        })
        .await
        .unwrap();
    let doubled: u32 = remote.call_api("/local/double", &21u32).await.unwrap();
    assert_eq!(doubled, 42);

    // Duplicate registration conflicts across the wire too.
    let err = remote
        .register_api("/remote/echo", Metadata::new(), |req| async move {
            Ok(req.payload)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, network_hub::HubError::Conflict(_)));

    remote.close().await;
    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_subscriptions_and_interceptors_work_over_the_wire() {
    let mut sup = Supervisor::new(insecure_config());
    let addr = sup.serve(Scope::Network).await.unwrap();
    let hub = sup.get(Scope::Network).unwrap();
    let local = Node::attach(&hub);

    let remote = RemoteNode::connect(addr.to_string(), insecure_config())
        .await
        .unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    remote
        .subscribe("/feed/*", 0, move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    local.publish("/feed/a", &(), Metadata::new()).await.unwrap();
    let counter = received.clone();
    assert!(eventually(move || counter.load(Ordering::SeqCst) == 1).await);

    // A remotely registered interceptor gates publishes at the hub; the
    // hub consults it with an intercept invocation over the channel.
    remote
        .register_interceptor("/cmd/*", 10, |_msg| Some(b"denied".to_vec()))
        .await
        .unwrap();
    let result = local.publish("/cmd/run", &(), Metadata::new()).await.unwrap();
    assert_eq!(result.as_deref(), Some(b"denied".as_slice()));

    // Even the registering client's own publishes are gated.
    let result = remote.publish("/cmd/run", &(), Metadata::new()).await.unwrap();
    assert_eq!(result.as_deref(), Some(b"denied".as_slice()));

    remote.close().await;
    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn client_disconnect_removes_its_registrations_within_bounded_time() {
    let mut sup = Supervisor::new(insecure_config());
    let addr = sup.serve(Scope::Network).await.unwrap();
    let hub = sup.get(Scope::Network).unwrap();
    let local = Node::attach(&hub);

    let remote = RemoteNode::connect(addr.to_string(), insecure_config())
        .await
        .unwrap();
    remote
        .register_api("/ephemeral/x", Metadata::new(), |_req| async { Ok(vec![]) })
        .await
        .unwrap();

    let response = local
        .call_api_raw("/ephemeral/x", vec![], Metadata::new())
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Success);

    remote.close().await;

    let start = Instant::now();
    loop {
        let response = local
            .call_api_raw("/ephemeral/x", vec![], Metadata::new())
            .await
            .unwrap();
        if response.status == ResponseStatus::NotFound {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "registration survived the disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hubs_chain_across_processes_over_the_wire() {
    // "Upper process": a network-scope hub serving TCP.
    let mut upper = Supervisor::new(insecure_config());
    let addr = upper.serve(Scope::Network).await.unwrap();
    let network = upper.get(Scope::Network).unwrap();

    // "Lower process": a machine-scope hub linked under it.
    let mut lower = Supervisor::new(insecure_config());
    lower
        .connect_upstream(Scope::Machine, addr.to_string())
        .await
        .unwrap();
    let machine = lower.get(Scope::Machine).unwrap();

    // Escalation up the wire.
    let upper_node = Node::attach(&network);
    upper_node
        .register_api("/up/answer", Metadata::new(), |_req| async {
            Ok(b"42".to_vec())
        })
        .await
        .unwrap();
    let lower_node = Node::attach(&machine);
    let response = lower_node
        .call_api_raw("/up/answer", vec![], Metadata::new())
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.payload, b"42");
    assert_eq!(
        response.metadata.get(meta::ESCALATED_FROM).map(String::as_str),
        Some(machine.hub_id().to_string().as_str())
    );

    // Downward routing: the machine hub announces an endpoint; the
    // network hub forwards matching requests down the same channel.
    lower_node
        .register_api("/down/task", Metadata::new(), |_req| async {
            Ok(b"done".to_vec())
        })
        .await
        .unwrap();
    let start = Instant::now();
    loop {
        let response = upper_node
            .call_api_raw("/down/task", vec![], Metadata::new())
            .await
            .unwrap();
        if response.status == ResponseStatus::Success {
            assert_eq!(response.payload, b"done");
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "registration never propagated upward"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Publishes forward up: a subscriber at the network scope hears a
    // machine-scope publish.
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    upper_node
        .subscribe("/global/*", 0, move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    lower_node
        .publish("/global/event", &(), Metadata::new())
        .await
        .unwrap();
    let counter = received.clone();
    assert!(eventually(move || counter.load(Ordering::SeqCst) == 1).await);

    lower.shutdown().await;
    upper.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn supervisor_links_scopes_created_in_any_order() {
    // Parent first.
    let mut sup = Supervisor::new(insecure_config());
    let process = sup.hub(Scope::Process).await.unwrap();
    let thread = sup.hub(Scope::Thread).await.unwrap();

    let parent_node = Node::attach(&process);
    parent_node
        .register_api("/shared/config", Metadata::new(), |_req| async {
            Ok(b"cfg".to_vec())
        })
        .await
        .unwrap();
    let child_node = Node::attach(&thread);
    let response = child_node
        .call_api_raw("/shared/config", vec![], Metadata::new())
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    sup.shutdown().await;

    // Child first: the later parent adopts the orphaned chain head.
    let mut sup = Supervisor::new(insecure_config());
    let thread = sup.hub(Scope::Thread).await.unwrap();
    let process = sup.hub(Scope::Process).await.unwrap();

    let parent_node = Node::attach(&process);
    parent_node
        .register_api("/shared/config", Metadata::new(), |_req| async {
            Ok(b"cfg".to_vec())
        })
        .await
        .unwrap();
    let child_node = Node::attach(&thread);
    let response = child_node
        .call_api_raw("/shared/config", vec![], Metadata::new())
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_calls_time_out_against_slow_handlers() {
    let mut sup = Supervisor::new(insecure_config());
    let addr = sup.serve(Scope::Network).await.unwrap();
    let hub = sup.get(Scope::Network).unwrap();
    let local = Node::attach(&hub);

    local
        .register_api("/very/slow", Metadata::new(), |_req| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![])
        })
        .await
        .unwrap();

    let client_config = HubConfig {
        request_timeout_sec: 1,
        ..insecure_config()
    };
    let remote = RemoteNode::connect(addr.to_string(), client_config)
        .await
        .unwrap();
    let response = remote
        .call_api_raw("/very/slow", vec![], Metadata::new())
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert!(response.metadata.contains_key(meta::TIMED_OUT));

    remote.close().await;
    sup.shutdown().await;
}

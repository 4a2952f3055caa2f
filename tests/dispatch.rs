use beamcheck::dispatch::TriggerPayload;
use beamcheck::domain::beam::{BeamId, BeamSpec, InMemoryCatalog};
use beamcheck::http::{HttpResponse, MockHttpClient};
use beamcheck::{
    Actor, BeamcheckError, Config, DispatchJob, DispatchMode, Dispatcher, InMemoryStorage,
    ItemUpdate, RequestId, RequestStatus, ResultCallback, ResultPayload, Storage,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const SERVICE_URL: &str = "http://calc.local/api/deflection";

fn catalog() -> Arc<InMemoryCatalog> {
    Arc::new(InMemoryCatalog::with_beams([BeamSpec {
        id: BeamId(1),
        name: "IPE 300".to_string(),
        material: Some("steel".to_string()),
        elasticity_gpa: Some(200.0),
        inertia_cm4: Some(120_000.0),
        allowed_deflection_ratio: Some(250.0),
    }]))
}

fn external_config() -> Config {
    Config {
        service_url: Some(SERVICE_URL.to_string()),
        callback_url_template: Some("http://app.local/api/requests/{id}/async_result".to_string()),
        callback_token: Some("cb-secret".to_string()),
        trigger_token: Some("trigger-secret".to_string()),
        ..Default::default()
    }
}

fn accepted() -> HttpResponse {
    HttpResponse {
        status: 202,
        body: r#"{"queued":true}"#.to_string(),
    }
}

/// Store a completed request directly, bypassing the service.
async fn completed(storage: &InMemoryStorage) -> DispatchJob {
    let alice = Actor::user("alice");
    let draft = storage.ensure_draft(&alice.id).await.unwrap();
    let (request, generation) = storage
        .update_request(draft.id, |r| {
            r.add_item(&alice, BeamId(1), 3)?;
            r.update_item(
                &alice,
                BeamId(1),
                &ItemUpdate {
                    quantity: None,
                    length_m: Some(4.0),
                    udl_kn_m: Some(10.0),
                },
            )?;
            r.form(&alice, Utc::now())?;
            r.complete(&Actor::moderator("mod"), Utc::now())
        })
        .await
        .unwrap();
    DispatchJob {
        request_id: request.id,
        generation,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test_log::test(tokio::test)]
async fn test_external_trigger_then_callback_converges() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_response(SERVICE_URL, Ok(accepted()));
    let config = external_config();
    let dispatcher = Dispatcher::spawn(&config, storage.clone(), catalog(), http.clone());
    assert_eq!(dispatcher.mode(), DispatchMode::External);

    let job = completed(&storage).await;
    dispatcher.dispatch(job).unwrap();
    wait_until(|| dispatcher.stats().delivered == 1).await;

    // Trigger carries the items, the beam attributes and the callback descriptor
    let calls = http.get_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].token.as_deref(), Some("trigger-secret"));
    assert_eq!(calls[0].timeout_ms, 5000);
    let payload: TriggerPayload = serde_json::from_str(&calls[0].body).unwrap();
    assert_eq!(payload.request_id, job.request_id);
    assert_eq!(payload.generation, job.generation);
    assert_eq!(payload.items.len(), 1);
    assert_eq!(payload.items[0].quantity, 3);
    assert_eq!(payload.items[0].beam.inertia_cm4, Some(120_000.0));
    let descriptor = payload.callback.unwrap();
    assert_eq!(
        descriptor.url,
        format!("http://app.local/api/requests/{}/async_result", job.request_id)
    );
    assert_eq!(descriptor.token.as_deref(), Some("cb-secret"));

    // Nothing is written until the service calls back
    let stored = storage.get_request(job.request_id).await.unwrap();
    assert!(stored.awaiting_result());

    let callback = ResultCallback::new(storage.clone(), catalog(), config.callback_token.clone());
    callback
        .accept(
            job.request_id,
            descriptor.token.as_deref(),
            ResultPayload {
                request_id: Some(payload.request_id),
                result_deflection_mm: Some(0.42),
                within_norm: Some(true),
                generation: Some(payload.generation),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stored = storage.get_request(job.request_id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert_eq!(stored.result.unwrap().deflection_mm, 0.42);

    dispatcher.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_delivery_failure_leaves_request_completed() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    http.add_response(
        SERVICE_URL,
        Err(BeamcheckError::Other(anyhow::anyhow!("connection refused"))),
    );
    let dispatcher = Dispatcher::spawn(&external_config(), storage.clone(), catalog(), http.clone());

    let job = completed(&storage).await;
    dispatcher.dispatch(job).unwrap();
    wait_until(|| dispatcher.stats().failed == 1).await;

    // Not retried by the dispatcher
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(http.call_count(), 1);

    let stored = storage.get_request(job.request_id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert!(stored.result.is_none());

    dispatcher.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_external_skips_request_no_longer_completed() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    let dispatcher = Dispatcher::spawn(&external_config(), storage.clone(), catalog(), http.clone());

    let job = completed(&storage).await;
    storage
        .update_request(job.request_id, |r| r.delete(&Actor::user("alice"), Utc::now()))
        .await
        .unwrap();
    dispatcher.dispatch(job).unwrap();
    wait_until(|| dispatcher.stats().skipped == 1).await;
    assert_eq!(http.call_count(), 0);

    dispatcher.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_shutdown_drains_in_flight_jobs() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    let first = http.add_response_with_trigger(SERVICE_URL, Ok(accepted()));
    let second = http.add_response_with_trigger(SERVICE_URL, Ok(accepted()));
    let dispatcher = Arc::new(Dispatcher::spawn(
        &external_config(),
        storage.clone(),
        catalog(),
        http.clone(),
    ));

    let a = completed(&storage).await;
    dispatcher.dispatch(a).unwrap();
    let alice_again = completed(&storage).await;
    dispatcher.dispatch(alice_again).unwrap();
    wait_until(|| http.in_flight_count() == 2).await;

    let shutting_down = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.shutdown().await })
    };
    wait_until(|| dispatcher.is_shutting_down()).await;

    // Intake is closed while in-flight work finishes
    assert!(matches!(
        dispatcher.dispatch(DispatchJob {
            request_id: RequestId::new(),
            generation: 1,
        }),
        Err(BeamcheckError::Shutdown)
    ));
    assert!(!shutting_down.is_finished());

    first.send(()).unwrap();
    second.send(()).unwrap();
    shutting_down.await.unwrap();

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.in_flight, 0);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_aborts_after_grace_period() {
    let storage = Arc::new(InMemoryStorage::new());
    let http = Arc::new(MockHttpClient::new());
    let _stuck = http.add_response_with_trigger(SERVICE_URL, Ok(accepted()));
    let config = Config {
        shutdown_grace_ms: 50,
        ..external_config()
    };
    let dispatcher = Dispatcher::spawn(&config, storage.clone(), catalog(), http.clone());

    let job = completed(&storage).await;
    dispatcher.dispatch(job).unwrap();
    wait_until(|| http.in_flight_count() == 1).await;

    tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown())
        .await
        .expect("shutdown must not wait past the grace period");

    // The aborted call was torn down
    assert_eq!(http.in_flight_count(), 0);
    assert_eq!(dispatcher.stats().delivered, 0);
}

#[test_log::test(tokio::test)]
async fn test_full_queue_rejects_without_blocking() {
    let storage = Arc::new(InMemoryStorage::new());
    let config = Config {
        queue_capacity: 1,
        max_in_flight: 1,
        sim_delay_ms: 3_600_000,
        ..Default::default()
    };
    let dispatcher = Dispatcher::spawn(
        &config,
        storage.clone(),
        catalog(),
        Arc::new(MockHttpClient::new()),
    );

    // The worker gets to run between sends: one job runs, one waits in the queue
    let mut refused = 0;
    for _ in 0..64 {
        let job = DispatchJob {
            request_id: RequestId::new(),
            generation: 1,
        };
        match dispatcher.dispatch(job) {
            Ok(()) => {}
            Err(BeamcheckError::Other(_)) => refused += 1,
            Err(e) => panic!("unexpected dispatch error: {e}"),
        }
        tokio::task::yield_now().await;
    }
    assert!(refused >= 62, "refused only {refused} of 64");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = dispatcher.stats();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.queued + stats.in_flight, 64 - refused);
    assert_eq!(stats.finished(), 0);
}

use beamcheck::domain::beam::{BeamId, BeamSpec, InMemoryCatalog};
use beamcheck::poller::{PollState, Poller, ServiceSource};
use beamcheck::{
    Actor, BeamcheckError, CalculationResult, Config, Dispatcher, InMemoryStorage, ItemUpdate,
    MockHttpClient, RequestService, RequestStatus, ResultCallback, ResultPayload, Storage,
};
use std::sync::Arc;
use std::time::Duration;

type Service = RequestService<InMemoryStorage, InMemoryCatalog>;

fn catalog() -> Arc<InMemoryCatalog> {
    Arc::new(InMemoryCatalog::with_beams([
        BeamSpec {
            id: BeamId(1),
            name: "IPE 300".to_string(),
            material: Some("steel".to_string()),
            elasticity_gpa: Some(200.0),
            inertia_cm4: Some(120_000.0),
            allowed_deflection_ratio: Some(250.0),
        },
        BeamSpec {
            id: BeamId(2),
            name: "HEB 200".to_string(),
            material: Some("steel".to_string()),
            elasticity_gpa: Some(210.0),
            inertia_cm4: Some(5_696.0),
            allowed_deflection_ratio: Some(300.0),
        },
    ]))
}

/// Service wired with the local simulation backend.
fn simulated(sim_delay_ms: u64) -> (Service, Arc<ResultCallback<InMemoryStorage, InMemoryCatalog>>) {
    let storage = Arc::new(InMemoryStorage::new());
    let catalog = catalog();
    let config = Config {
        sim_delay_ms,
        ..Default::default()
    };
    let dispatcher = Dispatcher::spawn(
        &config,
        storage.clone(),
        catalog.clone(),
        Arc::new(MockHttpClient::new()),
    );
    let service = RequestService::new(storage.clone(), catalog.clone(), Arc::new(dispatcher));
    let callback = Arc::new(ResultCallback::new(storage, catalog, None));
    (service, callback)
}

fn span(length_m: f64, udl_kn_m: f64) -> ItemUpdate {
    ItemUpdate {
        quantity: None,
        length_m: Some(length_m),
        udl_kn_m: Some(udl_kn_m),
    }
}

/// Draft with two sized beams, formed by alice.
async fn formed_request(service: &Service, alice: &Actor) -> beamcheck::RequestId {
    let draft = service.ensure_draft(alice).await.unwrap();
    service.add_item(alice, draft.id, BeamId(1), 2).await.unwrap();
    service.add_item(alice, draft.id, BeamId(2), 1).await.unwrap();
    service
        .update_item(alice, draft.id, BeamId(1), &span(4.0, 10.0))
        .await
        .unwrap();
    service
        .update_item(alice, draft.id, BeamId(2), &span(3.0, 5.0))
        .await
        .unwrap();
    service.form(alice, draft.id).await.unwrap();
    draft.id
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_simulation_converges_and_poller_stops() {
    let (service, _) = simulated(7000);
    let alice = Actor::user("alice");
    let moderator = Actor::moderator("mod");
    let id = formed_request(&service, &alice).await;

    let completed = service.complete(&moderator, id).await.unwrap();
    assert_eq!(completed.status, RequestStatus::Completed);
    assert!(completed.result.is_none(), "complete must return before the computation");

    let view = service.view(&alice, id).await.unwrap();
    assert!(view.awaiting_result());
    assert!(view.items.iter().all(|i| i.deflection_mm.is_none()));

    let source = Arc::new(ServiceSource::new(service.clone(), alice.clone()));
    let poller = Poller::new(source, Duration::from_millis(3000));
    let mut rx = poller.subscribe();
    poller.watch(view);

    let state = rx
        .wait_for(|s| matches!(s, PollState::Converged(_)))
        .await
        .unwrap()
        .clone();
    let PollState::Converged(view) = state else {
        unreachable!()
    };

    // Aggregate: Σ deflection × quantity over both beams
    let preview = service.preview(&alice, id).await.unwrap();
    let expected = preview.aggregate.unwrap().total_deflection_mm;
    let result = view.result.clone().unwrap();
    assert!((result.deflection_mm - expected).abs() < 1e-12);
    assert_eq!(result.within_norm, preview.aggregate.unwrap().within_norm);
    assert!(view.items.iter().all(|i| i.deflection_mm.is_some()));

    let stats = service.dispatcher().stats();
    assert_eq!(stats.written, 1);
    assert_eq!(stats.failed, 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_callback_before_delay_wins_over_simulation() {
    let (service, callback) = simulated(7000);
    let alice = Actor::user("alice");
    let id = formed_request(&service, &alice).await;
    service.complete(&Actor::moderator("mod"), id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    callback
        .accept(
            id,
            None,
            ResultPayload {
                result_deflection_mm: Some(42.0),
                within_norm: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10_000)).await;

    let stored = service.get(&alice, id).await.unwrap();
    let result = stored.result.unwrap();
    assert_eq!(result.deflection_mm, 42.0);
    assert!(!result.within_norm);
    let stats = service.dispatcher().stats();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.written, 0);
}

#[test_log::test(tokio::test)]
async fn test_callback_overwrites_previous_result() {
    let (service, callback) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let id = formed_request(&service, &alice).await;
    service.complete(&Actor::moderator("mod"), id).await.unwrap();

    for (deflection_mm, within_norm) in [(1.0, true), (2.5, false)] {
        callback
            .accept(
                id,
                None,
                ResultPayload {
                    request_id: Some(id),
                    result_deflection_mm: Some(deflection_mm),
                    within_norm: Some(within_norm),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let result = service.get(&alice, id).await.unwrap().result.unwrap();
    assert_eq!(result.deflection_mm, 2.5);
    assert!(!result.within_norm);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_delete_after_complete_makes_simulation_a_no_op() {
    let (service, callback) = simulated(7000);
    let alice = Actor::user("alice");
    let id = formed_request(&service, &alice).await;
    service.complete(&Actor::moderator("mod"), id).await.unwrap();
    service.delete(&alice, id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(8000)).await;

    let stored = service.storage().get_request(id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Deleted);
    assert!(stored.result.is_none());
    assert_eq!(stored.items.len(), 2, "line items are kept for audit");
    assert_eq!(service.dispatcher().stats().skipped, 1);

    // Deleted requests read as not found everywhere
    assert!(matches!(
        service.get(&alice, id).await.unwrap_err(),
        BeamcheckError::RequestNotFound(_)
    ));
    assert!(matches!(
        callback
            .accept(id, None, ResultPayload::default())
            .await
            .unwrap_err(),
        BeamcheckError::RequestNotFound(_)
    ));
}

#[test_log::test(tokio::test)]
async fn test_reject_is_terminal() {
    let (service, callback) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let moderator = Actor::moderator("mod");
    let id = formed_request(&service, &alice).await;

    // Only moderators decide
    assert!(matches!(
        service.reject(&alice, id).await.unwrap_err(),
        BeamcheckError::Unauthorized(_)
    ));
    let rejected = service.reject(&moderator, id).await.unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.moderator_id, Some(moderator.id.clone()));

    assert!(service.complete(&moderator, id).await.is_err());
    assert!(matches!(
        callback
            .accept(id, None, ResultPayload::default())
            .await
            .unwrap_err(),
        BeamcheckError::InvalidState(..)
    ));
    assert_eq!(service.dispatcher().stats().finished(), 0);
}

#[test_log::test(tokio::test)]
async fn test_form_validation() {
    let (service, _) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let draft = service.ensure_draft(&alice).await.unwrap();

    assert!(matches!(
        service.form(&alice, draft.id).await.unwrap_err(),
        BeamcheckError::Validation(_)
    ));

    service.add_item(&alice, draft.id, BeamId(1), 1).await.unwrap();
    assert!(matches!(
        service.form(&alice, draft.id).await.unwrap_err(),
        BeamcheckError::Validation(_)
    ));

    service
        .update_item(&alice, draft.id, BeamId(1), &span(4.0, 0.0))
        .await
        .unwrap();
    let formed = service.form(&alice, draft.id).await.unwrap();
    assert_eq!(formed.status, RequestStatus::Formed);
    assert!(formed.formed_at.is_some());

    // Items are frozen, a new draft is started for the next cart
    assert!(service.add_item(&alice, draft.id, BeamId(2), 1).await.is_err());
    let summary = service.cart_summary(&alice).await.unwrap();
    assert_ne!(summary.request_id, draft.id);
    assert_eq!(summary.total_quantity, 0);
}

#[test_log::test(tokio::test)]
async fn test_positions_survive_removal() {
    let (service, _) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let draft = service.ensure_draft(&alice).await.unwrap();
    for beam in [1, 2] {
        service.add_item(&alice, draft.id, BeamId(beam), 1).await.unwrap();
    }
    service.remove_item(&alice, draft.id, BeamId(1)).await.unwrap();
    let request = service.add_item(&alice, draft.id, BeamId(1), 1).await.unwrap();

    let positions: Vec<(BeamId, u32)> = request.items.iter().map(|i| (i.beam_id, i.position)).collect();
    assert_eq!(positions, vec![(BeamId(2), 1), (BeamId(1), 2)]);
}

#[test_log::test(tokio::test)]
async fn test_result_fields_are_all_or_nothing() {
    let (service, callback) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let id = formed_request(&service, &alice).await;
    service.complete(&Actor::moderator("mod"), id).await.unwrap();

    // Only the norm flag is given; the deflection is filled in
    let written: CalculationResult = callback
        .accept(
            id,
            None,
            ResultPayload {
                within_norm: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stored = service.get(&alice, id).await.unwrap();
    assert_eq!(stored.result, Some(written));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_completes_dispatch_once() {
    let (service, _) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let id = formed_request(&service, &alice).await;

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..8 {
        let service = service.clone();
        let moderator = Actor::moderator(format!("mod-{n}").as_str());
        tasks.spawn(async move { service.complete(&moderator, id).await });
    }

    let mut won = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(request) => {
                won += 1;
                assert_eq!(request.status, RequestStatus::Completed);
            }
            Err(e) => assert!(matches!(e, BeamcheckError::InvalidState(..)), "{e}"),
        }
    }
    assert_eq!(won, 1);

    let stored = service.storage().get_request(id).await.unwrap();
    assert_eq!(stored.generation, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = service.dispatcher().stats();
    assert_eq!(stats.queued + stats.in_flight, 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_complete_and_reject_race_has_one_winner() {
    let (service, _) = simulated(3_600_000);
    let alice = Actor::user("alice");
    let id = formed_request(&service, &alice).await;

    let completing = {
        let service = service.clone();
        tokio::spawn(async move { service.complete(&Actor::moderator("mod-a"), id).await })
    };
    let rejecting = {
        let service = service.clone();
        tokio::spawn(async move { service.reject(&Actor::moderator("mod-b"), id).await })
    };
    let completed = completing.await.unwrap();
    let rejected = rejecting.await.unwrap();
    assert!(completed.is_ok() != rejected.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = service.storage().get_request(id).await.unwrap();
    let stats = service.dispatcher().stats();
    if completed.is_ok() {
        assert_eq!(stored.status, RequestStatus::Completed);
        assert_eq!(stats.queued + stats.in_flight, 1);
    } else {
        assert_eq!(stored.status, RequestStatus::Rejected);
        assert_eq!(stats.queued + stats.in_flight, 0);
    }
}

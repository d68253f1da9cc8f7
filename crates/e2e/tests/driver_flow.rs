//! Session and screen driver tests against the simulated app

mod support;

use historia_e2e::content::{HPI_COMPLETE, LLM_ENDPOINT};
use historia_e2e::mock::llm_responder;
use historia_e2e::screen::{Field, ScreenId};
use historia_e2e::storage::{self, AppState, StorageState};
use historia_e2e::{builtin, E2eError, Profile, ScreenDriver, Session, Timings};

use support::{AppBehavior, FakeLauncher, BASE_URL};

fn guarded() -> Vec<String> {
    vec![LLM_ENDPOINT.to_string()]
}

async fn open_session(launcher: &FakeLauncher, profiles: &[Profile]) -> Session {
    Session::create(launcher, profiles, &guarded()).await.unwrap()
}

async fn driver_for(session: &Session, index: usize) -> ScreenDriver {
    let page = session.context(index).unwrap().new_page().await.unwrap();
    ScreenDriver::new(page, BASE_URL, Timings::default())
}

fn fields(values: &[(Field, &str)]) -> Vec<(Field, String)> {
    values.iter().map(|(f, v)| (*f, v.to_string())).collect()
}

#[tokio::test(start_paused = true)]
async fn disclaimer_is_shown_on_every_load() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop()]).await;
    let driver = driver_for(&session, 0).await;

    assert_eq!(driver.open(false).await.unwrap(), Some(ScreenId::DisclaimerModal));
    assert!(driver.dismiss_disclaimer().await.unwrap());
    assert_eq!(driver.current_screen().await.unwrap(), Some(ScreenId::Welcome));

    // Already dismissed: nothing to do
    assert!(!driver.dismiss_disclaimer().await.unwrap());

    assert_eq!(driver.reload(false).await.unwrap(), Some(ScreenId::DisclaimerModal));
    assert_eq!(driver.reload(true).await.unwrap(), Some(ScreenId::Welcome));

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn full_walk_leaves_only_the_target_visible() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop()]).await;
    let context = session.context(0).unwrap();
    context.install_mock(LLM_ENDPOINT, llm_responder(HPI_COMPLETE)).await.unwrap();

    let driver = driver_for(&session, 0).await;
    driver.open(true).await.unwrap();

    let visited = driver
        .walk_to(
            ScreenId::Review,
            &fields(&[
                (Field::Name, "Jane Roe"),
                (Field::Age, "31"),
                (Field::Symptom, "Cough"),
                (Field::Duration, "1 week"),
                (Field::Tobacco, "Former"),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(visited.last(), Some(&ScreenId::Review));
    assert_eq!(visited.len(), 7);

    let page = driver.page();
    for screen in ScreenId::ALL {
        let expected = screen == ScreenId::Review;
        assert_eq!(
            page.is_visible(&screen.root_selector()).await.unwrap(),
            expected,
            "{}",
            screen
        );
    }

    let summary = builtin::sample_summary().render();
    context.replace_mock(LLM_ENDPOINT, llm_responder(summary)).await.unwrap();
    assert_eq!(driver.goto(ScreenId::Summary, &[]).await.unwrap(), ScreenId::Summary);
    assert!(!page.is_visible(&ScreenId::Review.root_selector()).await.unwrap());

    let persisted = storage::capture(page.as_ref()).await.unwrap().unwrap();
    assert_eq!(persisted.current_screen, ScreenId::Summary);
    assert_eq!(persisted.field(Field::Tobacco).unwrap(), "Former");
    assert_eq!(context.routes().active_count(LLM_ENDPOINT), Some(1));
    assert_eq!(context.routes().total_count(LLM_ENDPOINT), 2);
    assert!(context.routes().mismatches().is_empty());

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn skipping_a_screen_is_an_invalid_transition() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop()]).await;
    let driver = driver_for(&session, 0).await;
    driver.open(true).await.unwrap();

    match driver.goto(ScreenId::Summary, &[]).await {
        Err(E2eError::InvalidTransition { from, to }) => {
            assert_eq!(from, ScreenId::Welcome);
            assert_eq!(to, ScreenId::Summary);
        }
        other => panic!("expected invalid transition, got {:?}", other),
    }

    match driver.goto(ScreenId::DisclaimerModal, &[]).await {
        Err(E2eError::InvalidTransition { to, .. }) => assert_eq!(to, ScreenId::DisclaimerModal),
        other => panic!("expected invalid transition, got {:?}", other),
    }

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stuck_disclaimer_times_out_naming_the_last_screen() {
    let launcher = FakeLauncher::with_behavior(AppBehavior {
        stuck_disclaimer: true,
        ..AppBehavior::default()
    });
    let session = open_session(&launcher, &[Profile::desktop()]).await;
    let driver = driver_for(&session, 0).await;
    driver.open(false).await.unwrap();

    match driver.dismiss_disclaimer().await {
        Err(E2eError::Timeout { what, last_screen }) => {
            assert!(what.contains("#disclaimer-modal"));
            assert_eq!(last_screen, Some(ScreenId::DisclaimerModal));
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn interview_without_mock_never_advances() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop()]).await;
    let driver = driver_for(&session, 0).await;
    driver.open(true).await.unwrap();

    driver
        .walk_to(
            ScreenId::HpiChat,
            &fields(&[(Field::Symptom, "Fever"), (Field::Duration, "3 days")]),
        )
        .await
        .unwrap();

    let routes = session.context(0).unwrap().routes();
    let mismatches = routes.mismatches();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].guard, LLM_ENDPOINT);
    assert_eq!(launcher.log.requests(), vec!["hpi".to_string()]);

    match driver.goto(ScreenId::PastMedicalHistory, &[]).await {
        Err(E2eError::Timeout { last_screen, .. }) => assert_eq!(last_screen, Some(ScreenId::HpiChat)),
        other => panic!("expected timeout, got {:?}", other),
    }

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn seeded_state_is_restored_before_first_render() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop()]).await;
    let driver = driver_for(&session, 0).await;

    let seed = StorageState::new(&AppState::sample_patient(), ScreenId::Review).unwrap();
    storage::seed(driver.page().as_ref(), &seed).await.unwrap();

    assert_eq!(driver.open(true).await.unwrap(), Some(ScreenId::Review));
    assert_eq!(driver.input_value(Field::Name).await.unwrap(), "John Doe");

    let read = storage::capture(driver.page().as_ref()).await.unwrap().unwrap();
    assert!(storage::assert_round_trip(&seed, &read).is_identical());

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn contexts_do_not_share_storage() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop(), Profile::mobile()]).await;

    let first = driver_for(&session, 0).await;
    let second = driver_for(&session, 1).await;
    first.open(true).await.unwrap();
    second.open(true).await.unwrap();

    first
        .walk_to(ScreenId::PreliminaryData, &fields(&[(Field::Name, "Only Here")]))
        .await
        .unwrap();

    assert!(storage::capture(first.page().as_ref()).await.unwrap().is_some());
    assert!(storage::capture(second.page().as_ref()).await.unwrap().is_none());
    assert_eq!(second.input_value(Field::Name).await.unwrap(), "");

    session.dispose().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent() {
    let launcher = FakeLauncher::new();
    let session = open_session(&launcher, &[Profile::desktop(), Profile::iphone()]).await;

    session.dispose().await.unwrap();
    session.dispose().await.unwrap();

    assert!(session.is_disposed());
    assert_eq!(launcher.log.shutdowns(), 1);
    assert_eq!(launcher.log.contexts_closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn launch_failure_is_an_environment_error() {
    let launcher = FakeLauncher::with_behavior(AppBehavior {
        launch_fails: true,
        ..AppBehavior::default()
    });

    let err = Session::create(&launcher, &[Profile::desktop()], &guarded())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, E2eError::Environment(_)));
    assert!(err.is_fatal());
    assert_eq!(launcher.log.launches(), 0);
}

#[tokio::test(start_paused = true)]
async fn scoped_session_is_disposed_after_failure() {
    let launcher = FakeLauncher::new();

    let result: Result<(), E2eError> = Session::scoped(&launcher, &[Profile::desktop()], &guarded(), |session| {
        Box::pin(async move {
            let driver = driver_for(session, 0).await;
            driver.open(true).await?;
            driver.goto(ScreenId::Review, &[]).await?;
            Ok(())
        })
    })
    .await;

    assert!(matches!(result, Err(E2eError::InvalidTransition { .. })));
    assert_eq!(launcher.log.shutdowns(), 1);
}

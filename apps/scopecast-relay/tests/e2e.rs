use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use scopecast_relay::{Relay, RelayConfig};
use scopecast_session::testing::{FakeEngineFactory, FakeMediaSource};
use scopecast_session::{
    signaling, PublisherController, PublisherState, SessionConfig, SessionEvent, SignalingConfig,
    ViewerController, ViewerHandle, ViewerState,
};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

async fn start_hub() -> (String, oneshot::Sender<()>) {
    let config = RelayConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..RelayConfig::default()
    };
    let relay = Relay::bind(&config, None).await.unwrap();
    let url = format!("ws://{}/ws", relay.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(relay.serve(async move {
        let _ = stopped.await;
    }));
    (url, stop)
}

async fn reach<T: PartialEq + Debug>(mut state: watch::Receiver<T>, wanted: T) {
    let result = timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
        .await
        .map(|r| r.map(|_| ()));
    assert!(
        matches!(result, Ok(Ok(_))),
        "never reached {wanted:?}, stuck at {:?}",
        *state.borrow()
    );
}

async fn start_viewer(url: &str) -> (ViewerHandle, Arc<FakeEngineFactory>) {
    let engines = Arc::new(FakeEngineFactory::scripted());
    let link = signaling::connect(&SignalingConfig::new(url)).await.unwrap();
    let handle = ViewerController::start(SessionConfig::default(), engines.clone(), link);
    (handle, engines)
}

#[test_timeout::tokio_timeout_test(20)]
async fn viewer_reload_reuses_publisher_camera() {
    let (url, _stop) = start_hub().await;

    let media = Arc::new(FakeMediaSource::new());
    let publisher_engines = Arc::new(FakeEngineFactory::scripted());
    let publisher_link = signaling::connect(&SignalingConfig::new(url.as_str()))
        .await
        .unwrap();
    let publisher = PublisherController::start(
        SessionConfig::default(),
        media.clone(),
        publisher_engines.clone(),
        publisher_link,
    )
    .await
    .unwrap();
    reach(publisher.state(), PublisherState::Broadcasting).await;
    // Let the targetless first offer drain through the hub before a viewer exists.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut viewer, _) = start_viewer(&url).await;
    reach(viewer.state(), ViewerState::Receiving).await;
    reach(publisher.state(), PublisherState::Streaming).await;
    match timeout(Duration::from_secs(2), viewer.events.recv()).await {
        Ok(Some(SessionEvent::IdentityAssigned(id))) => assert_eq!(id.as_str(), "p2"),
        other => panic!("expected identity event, got {other:?}"),
    }

    // Reload: the old viewer hangs up, a new one announces itself.
    viewer.shutdown().await;
    reach(publisher.state(), PublisherState::Broadcasting).await;

    let (second, second_engines) = start_viewer(&url).await;
    reach(second.state(), ViewerState::Receiving).await;
    reach(publisher.state(), PublisherState::Streaming).await;
    assert!(second_engines.created() >= 1);

    assert_eq!(media.acquisitions(), 1);
    let camera = media.last_stream().unwrap();
    assert!(!camera.is_stopped());
    assert!(publisher_engines.created() >= 3);

    // Publisher teardown releases the camera and tells the viewer.
    publisher.shutdown().await;
    assert!(camera.is_stopped());
    reach(second.state(), ViewerState::AwaitingOffer).await;
    second.shutdown().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn viewer_first_then_publisher() {
    let (url, _stop) = start_hub().await;

    let (viewer, viewer_engines) = start_viewer(&url).await;
    reach(viewer.state(), ViewerState::Announced).await;

    // The publisher's first offer is broadcast and reaches the waiting viewer.
    let media = Arc::new(FakeMediaSource::new());
    let link = signaling::connect(&SignalingConfig::new(url.as_str()))
        .await
        .unwrap();
    let publisher = PublisherController::start(
        SessionConfig::default(),
        media.clone(),
        Arc::new(FakeEngineFactory::scripted()),
        link,
    )
    .await
    .unwrap();

    reach(viewer.state(), ViewerState::Receiving).await;
    reach(publisher.state(), PublisherState::Streaming).await;
    assert_eq!(viewer_engines.created(), 1);
    assert_eq!(media.acquisitions(), 1);

    publisher.shutdown().await;
    viewer.shutdown().await;
}

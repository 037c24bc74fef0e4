use fastimage_service::coordinator::{BindOutcome, Status};

use crate::{ImageServer, setup_coordinator};

#[tokio::test]
async fn test_slots_over_http() {
    let server = ImageServer::new();
    let (mut setup, _cache_dir) = setup_coordinator(3, |_| {});

    let urls = [
        server.url("sized/2000/a.png"),
        server.url("chunked/30000/b.png"),
        server.url("delay/100ms/500/c.png"),
    ];
    for (slot, url) in urls.iter().enumerate() {
        assert_eq!(setup.bind(slot, url.as_str()), BindOutcome::Scheduled);
    }
    setup.run_until_idle().await;

    assert_eq!(setup.recorder.resources(0), [2000]);
    assert_eq!(setup.recorder.resources(1), [30000]);
    assert_eq!(setup.recorder.resources(2), [500]);
    for (slot, url) in urls.iter().enumerate() {
        assert_eq!(
            setup.recorder.statuses(slot),
            [
                (url.to_string(), Status::Queued),
                (url.to_string(), Status::Fetching),
                (url.to_string(), Status::Delivered),
            ]
        );
    }
    assert_eq!(server.accesses(), 3);

    // all of them are served from memory now
    for (slot, url) in urls.iter().enumerate() {
        assert_eq!(setup.bind(slot, url.as_str()), BindOutcome::FromCache);
    }
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_concurrent_slots_share_a_fetch() {
    let server = ImageServer::new();
    let (mut setup, _cache_dir) = setup_coordinator(4, |_| {});

    let url = server.url("delay/200ms/1000/shared.png");
    for slot in 0..4 {
        setup.bind(slot, url.as_str());
    }
    setup.run_until_idle().await;

    for slot in 0..4 {
        assert_eq!(setup.recorder.resources(slot), [1000]);
    }
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_rebind_while_downloading() {
    let server = ImageServer::new();
    let (mut setup, _cache_dir) = setup_coordinator(1, |_| {});

    let slow = server.url("delay/300ms/1000/slow.png");
    let fast = server.url("sized/10/fast.png");
    setup.bind(0, slow.as_str());
    setup.bind(0, fast.as_str());
    setup.run_until_idle().await;

    // wait for the slow request to complete or be dropped
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    assert_eq!(setup.recorder.resources(0), [10]);
    assert!(
        !setup
            .recorder
            .statuses(0)
            .contains(&(slow.to_string(), Status::Delivered))
    );
    assert!(!setup.cache().contains_key_in_memory(slow.as_str()));
}

#[tokio::test]
async fn test_http_errors() {
    let server = ImageServer::new();
    let (mut setup, _cache_dir) = setup_coordinator(2, |_| {});

    let not_found = server.url("respond_statuscode/404/a.png");
    let not_an_image = server.url("sized/4/b.png");
    setup.bind(0, not_found.as_str());
    setup.bind(1, not_an_image.as_str());
    setup.run_until_idle().await;

    assert_eq!(setup.slots[0].status(), Status::Error);
    assert_eq!(setup.slots[1].status(), Status::Error);
    assert!(setup.cache().is_empty());
}

#[tokio::test]
async fn test_download_timeout() {
    let server = ImageServer::new();
    let (mut setup, _cache_dir) = setup_coordinator(1, |config| {
        config.timeouts.max_download = Some(std::time::Duration::from_millis(100));
    });

    setup.bind(0, server.url("delay/2s/100/a.png").as_str());
    setup.run_until_idle().await;

    assert_eq!(setup.slots[0].status(), Status::Error);
}

#[tokio::test]
async fn test_invalidate_and_refetch() {
    let server = ImageServer::new();
    let (mut setup, _cache_dir) = setup_coordinator(2, |_| {});

    let first = server.url("sized/100/album/1.png");
    let second = server.url("sized/100/other/1.png");
    setup.bind(0, first.as_str());
    setup.bind(1, second.as_str());
    setup.run_until_idle().await;
    setup.cache().flush().await;
    assert_eq!(server.accesses(), 2);

    let prefix = server.url("sized/100/album/");
    assert_eq!(setup.cache().invalidate_prefix(prefix.as_str()), 1);
    assert!(!setup.cache().contains_key(first.as_str()));
    assert!(setup.cache().contains_key(second.as_str()));

    assert_eq!(setup.bind(0, first.as_str()), BindOutcome::Scheduled);
    assert_eq!(setup.bind(1, second.as_str()), BindOutcome::FromCache);
    setup.run_until_idle().await;
    assert_eq!(server.all_hits(), [("/sized/100/album/1.png".to_owned(), 1)]);
}

#[tokio::test]
async fn test_files_are_served_from_disk() {
    let (mut setup, files) = setup_coordinator(1, |config| config.cache_dir = None);
    let path = files.path().join("local.png");
    std::fs::write(&path, crate::image_bytes(64)).unwrap();

    setup.bind(0, path.to_str().unwrap());
    setup.run_until_idle().await;

    assert_eq!(setup.recorder.resources(0), [64]);
    assert_eq!(setup.cache().cache_dir(), None);
}

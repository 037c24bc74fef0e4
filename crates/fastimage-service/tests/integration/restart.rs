use std::fs;

use fastimage_service::coordinator::{BindOutcome, Status};

use crate::{ImageServer, image_bytes, setup_coordinator, setup_with_config};

#[tokio::test]
async fn test_restart_serves_from_disk() {
    let server = ImageServer::new();
    let (mut setup, cache_dir) = setup_coordinator(1, |_| {});
    let url = server.url("sized/4096/photo.png");

    setup.bind(0, url.as_str());
    setup.run_until_idle().await;
    setup.cache().flush().await;

    let path = setup.cache().cache_file_path(url.as_str()).unwrap();
    assert!(path.starts_with(cache_dir.path()));
    assert_eq!(fs::read(&path).unwrap(), image_bytes(4096));
    drop(setup);

    let config = fastimage_service::config::Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let mut setup = setup_with_config(1, &config);
    assert_eq!(setup.bind(0, url.as_str()), BindOutcome::FromCache);
    assert_eq!(setup.recorder.resources(0), [4096]);
    assert_eq!(setup.recorder.statuses(0), [(url.to_string(), Status::Delivered)]);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_cleared_disk_is_refetched() {
    let server = ImageServer::new();
    let (mut setup, cache_dir) = setup_coordinator(1, |_| {});
    let url = server.url("sized/100/photo.png");

    setup.bind(0, url.as_str());
    setup.run_until_idle().await;
    setup.cache().flush().await;
    setup.cache().clear(true);
    drop(setup);

    let config = fastimage_service::config::Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let mut setup = setup_with_config(1, &config);
    assert_eq!(setup.bind(0, url.as_str()), BindOutcome::Scheduled);
    setup.run_until_idle().await;
    assert_eq!(setup.recorder.resources(0), [100]);
    assert_eq!(server.accesses(), 2);
}

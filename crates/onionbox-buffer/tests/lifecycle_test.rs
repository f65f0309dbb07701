//! End-to-end package lifecycle: files go in through the archive pipeline,
//! get published to the store, and come back out through downloads until a
//! limit or expiry destroys them.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use onionbox_buffer::{
    BufferStore, ChunkPipeline, FileSource, PinMode, PinnedRegion, PipelineOptions,
    PublishOptions, StoreOptions,
};
use onionbox_core::BoxError;
use onionbox_crypto::KdfParams;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

fn test_store() -> BufferStore {
    BufferStore::new(StoreOptions {
        sweep_interval: Duration::from_millis(20),
        sweep_lock_wait: Duration::from_millis(10),
        name_attempts: 16,
        pin_mode: PinMode::BestEffort,
        chunk_size: 1024,
        kdf: KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        },
    })
}

fn pipeline_options() -> PipelineOptions {
    PipelineOptions {
        chunk_size: 1024,
        queue_depth: 8,
        pin_mode: PinMode::BestEffort,
    }
}

async fn archive_of<B: AsRef<[u8]>>(files: &[(&str, B)]) -> PinnedRegion {
    let cancel = CancellationToken::new();
    let pipeline = ChunkPipeline::start(pipeline_options(), &cancel);
    for (name, bytes) in files {
        pipeline
            .submit(FileSource::new(*name, Cursor::new(bytes.as_ref().to_vec())))
            .await
            .expect("submit");
    }
    pipeline.finish().await.expect("archive")
}

fn unzip(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).expect("valid zip");
    (0..zip.len())
        .map(|i| {
            let mut file = zip.by_index(i).unwrap();
            let mut out = Vec::new();
            file.read_to_end(&mut out).unwrap();
            (file.name().to_string(), out)
        })
        .collect()
}

#[tokio::test]
async fn two_files_round_trip_unencrypted() {
    let store = test_store();
    let a = b"0123456789".to_vec();
    let b = b"abcdefghijklmnopqrst".to_vec();
    let archive = archive_of(&[("a.txt", a.clone()), ("b.txt", b.clone())]).await;
    let archive_bytes = archive.as_slice().to_vec();

    let name = store
        .publish(archive, PublishOptions::default())
        .await
        .unwrap();
    assert!(onionbox_buffer::names::is_valid(&name));

    assert_eq!(store.len().await, 1);

    let pkg = store.download(&name, None).await.unwrap();
    assert_eq!(pkg.bytes.as_slice(), archive_bytes.as_slice());
    let entries = unzip(pkg.bytes.as_slice());
    assert_eq!(entries, vec![("a.txt".to_string(), a), ("b.txt".to_string(), b)]);

    // unlimited and no expiry: still there
    assert!(store.exists(&name).await);
    assert!(store.download(&name, None).await.is_ok());
}

#[tokio::test]
async fn passphrase_with_single_download() {
    let store = test_store();
    let archive = archive_of(&[("hello.txt", b"hello")]).await;
    let name = store
        .publish(
            archive,
            PublishOptions {
                passphrase: Some(SecretString::from("secret123")),
                download_limit: 1,
                expires_in: None,
            },
        )
        .await
        .unwrap();

    let wrong = store
        .download(&name, Some(&SecretString::from("secret124")))
        .await;
    assert!(matches!(wrong, Err(BoxError::AuthenticationFailed)));
    // a failed attempt does not use up the single download
    assert!(store.exists(&name).await);

    let pkg = store
        .download(&name, Some(&SecretString::from("secret123")))
        .await
        .unwrap();
    assert_eq!(unzip(pkg.bytes.as_slice())[0].1, b"hello");

    assert!(!store.exists(&name).await);
    assert!(matches!(
        store
            .download(&name, Some(&SecretString::from("secret123")))
            .await,
        Err(BoxError::NotFound)
    ));
}

#[tokio::test]
async fn limit_allows_exactly_l_downloads() {
    let store = test_store();
    let archive = archive_of(&[("f.txt", b"payload")]).await;
    let name = store
        .publish(
            archive,
            PublishOptions {
                download_limit: 3,
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();

    for expected in 1..=3 {
        let pkg = store.download(&name, None).await.unwrap();
        assert_eq!(pkg.downloads, expected);
        assert_eq!(pkg.exhausted, expected == 3);
    }
    assert!(!store.exists(&name).await);
    assert!(matches!(
        store.download(&name, None).await,
        Err(BoxError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_downloads_with_limit_one() {
    let store = Arc::new(test_store());
    let archive = archive_of(&[("race.txt", b"only once")]).await;
    let name = store
        .publish(
            archive,
            PublishOptions {
                download_limit: 1,
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let store = store.clone();
        let name = name.clone();
        tasks.push(tokio::spawn(async move { store.download(&name, None).await }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(pkg) => {
                successes += 1;
                assert_eq!(unzip(pkg.bytes.as_slice())[0].1, b"only once");
            }
            Err(BoxError::LimitReached | BoxError::NotFound) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert!(!store.exists(&name).await);
}

#[tokio::test]
async fn sweeper_destroys_expired_package() {
    let store = Arc::new(test_store());
    let archive = archive_of(&[("short.txt", b"brief")]).await;
    let name = store
        .publish(
            archive,
            PublishOptions {
                expires_in: Some(Duration::from_millis(50)),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();
    let keeper = store
        .publish(archive_of(&[("keep.txt", b"stay")]).await, PublishOptions::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let sweeper = {
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { store.run_sweeper(cancel, |_| {}).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.exists(&name).await {
        assert!(tokio::time::Instant::now() < deadline, "package never swept");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    sweeper.await.unwrap();

    assert!(store.exists(&keeper).await);
    assert!(matches!(
        store.download(&name, None).await,
        Err(BoxError::NotFound)
    ));
}

#[tokio::test]
async fn failed_upload_stores_nothing() {
    let store = test_store();
    let cancel = CancellationToken::new();
    let pipeline = ChunkPipeline::start(pipeline_options(), &cancel);
    let failing = tokio_test::io::Builder::new()
        .read(b"half a file")
        .read_error(std::io::Error::other("connection reset"))
        .build();
    pipeline
        .submit(FileSource::new("ok.txt", Cursor::new(b"fine".to_vec())))
        .await
        .unwrap();
    pipeline
        .submit(FileSource::new("broken.txt", failing))
        .await
        .unwrap();

    let result = pipeline.finish().await;
    assert!(matches!(result, Err(BoxError::Io(_))));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn shutdown_destroys_everything() {
    let store = test_store();
    for i in 0..4u8 {
        store
            .publish(
                archive_of(&[("f", [i; 16])]).await,
                PublishOptions::default(),
            )
            .await
            .unwrap();
    }
    assert_eq!(store.len().await, 4);
    assert_eq!(store.destroy_all().await.unwrap(), 4);
    assert!(store.is_empty().await);
}

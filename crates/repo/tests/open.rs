//! Opening repositories from config files and connected storages

mod common;

use std::time::Duration;

use blob::{BlobError, BlobId, Operation, PutOptions, RetentionMode, SharedStorage};
use bytes::Bytes;
use common::{FsRepo, PASSWORD};
use repo::format::{BlobStorageConfiguration, InitOptions};
use repo::{
    open, open_with_config, CachingOptions, ClientOptions, RepoError, RequiredFeature,
};

fn features(names: &[&str]) -> Vec<RequiredFeature> {
    names.iter().map(|n| RequiredFeature::new(*n)).collect()
}

#[tokio::test]
async fn test_open_from_config_file() {
    let fs = FsRepo::create(common::init_options(), ClientOptions::default()).await;
    let (options, _) = common::test_options();

    let repo = open(&fs.config_file, PASSWORD, options).await.unwrap();
    assert!(repo.description().starts_with("Repository in "));
    assert_eq!(repo.config_file(), Some(fs.config_file.as_path()));
    assert!(!repo.is_read_only());
    assert_eq!(repo.unique_id().len(), 64);
    assert!(repo.upgrade_lock_monitor().is_some());

    let id = BlobId::new("p0001");
    repo.blobs()
        .put_blob(&id, Bytes::from_static(b"pack"), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(repo.blobs().get_blob(&id).await.unwrap(), Bytes::from_static(b"pack"));
    assert_eq!(repo.metrics().stats("PutBlob").calls, 1);

    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_required_features_gate() {
    // every required feature supported
    let base = common::recording_repo(InitOptions {
        required_features: features(&["index-v1", "index-v2"]),
        ..common::init_options()
    })
    .await;
    let (options, _) = common::test_options();
    let repo = open_with_config(
        base,
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        options,
        None,
    )
    .await
    .unwrap();
    repo.close().await.unwrap();

    // a hard requirement this build lacks
    let base = common::recording_repo(InitOptions {
        required_features: features(&["index-v1", "index-v3"]),
        ..common::init_options()
    })
    .await;
    let (options, _) = common::test_options();
    let err = open_with_config(
        base.clone(),
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        options.clone(),
        None,
    )
    .await
    .unwrap_err();
    assert!(err.is_incompatible());
    assert!(err
        .to_string()
        .contains("does not support feature 'index-v3'"));

    // tolerated when asked to ignore missing features
    let permissive = repo::Options {
        test_only_ignore_missing_required_features: true,
        ..options
    };
    let repo = open_with_config(
        base,
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        permissive,
        None,
    )
    .await
    .unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_warn_only_feature_opens() {
    let base = common::recording_repo(InitOptions {
        required_features: vec![
            RequiredFeature::new("index-v1"),
            RequiredFeature::warn_only("fancy-compression"),
        ],
        ..common::init_options()
    })
    .await;
    let (options, _) = common::test_options();
    let repo = open_with_config(
        base,
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        options,
        None,
    )
    .await
    .unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password() {
    let base = common::recording_repo(common::init_options()).await;
    let (options, _) = common::test_options();
    let err = open_with_config(
        base,
        ClientOptions::default(),
        CachingOptions::default(),
        "hunter2",
        options,
        None,
    )
    .await
    .unwrap_err();
    assert!(err.is_invalid_password(), "{err}");
}

#[tokio::test]
async fn test_permissive_cache_loading_requires_read_only() {
    let fs = FsRepo::create(
        common::init_options(),
        ClientOptions {
            permissive_cache_loading: true,
            ..Default::default()
        },
    )
    .await;
    let (options, _) = common::test_options();
    let err = open(&fs.config_file, PASSWORD, options).await.unwrap_err();
    assert!(matches!(err, RepoError::PermissiveCacheLoadingRequiresReadOnly));

    let mut lc = fs.config();
    lc.client_options.read_only = true;
    lc.write_to_file(&fs.config_file).unwrap();
    let (options, _) = common::test_options();
    let repo = open(&fs.config_file, PASSWORD, options).await.unwrap();
    assert!(repo.upgrade_lock_monitor().is_none());
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_storage_and_config() {
    let fs = FsRepo::create(common::init_options(), ClientOptions::default()).await;
    let mut lc = fs.config();
    lc.storage = None;
    lc.write_to_file(&fs.config_file).unwrap();

    let (options, _) = common::test_options();
    let err = open(&fs.config_file, PASSWORD, options).await.unwrap_err();
    assert!(matches!(err, RepoError::StorageNotConfigured));

    let (options, _) = common::test_options();
    let err = open(&fs.dir.path().join("nope.config"), PASSWORD, options)
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Config(_)));
}

#[tokio::test]
async fn test_read_only_refuses_mutations() {
    let base = common::recording_repo(common::init_options()).await;
    let (options, _) = common::test_options();
    let repo = open_with_config(
        base.clone(),
        ClientOptions {
            read_only: true,
            ..Default::default()
        },
        CachingOptions::default(),
        PASSWORD,
        options,
        None,
    )
    .await
    .unwrap();

    let puts_before = base.count(Operation::Put);
    let err = repo
        .blobs()
        .put_blob(&BlobId::new("p1"), Bytes::from_static(b"x"), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::ReadOnly { .. }));
    let err = repo.blobs().delete_blob(&BlobId::new("p1")).await.unwrap_err();
    assert!(matches!(err, BlobError::ReadOnly { .. }));
    assert_eq!(base.count(Operation::Put), puts_before);

    repo.blobs().list_blobs("p").await.unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_retention_applied_to_protected_prefixes() {
    let base = common::recording_repo(InitOptions {
        blob_cfg: BlobStorageConfiguration {
            retention_mode: Some(RetentionMode::Governance),
            retention_period: Some(Duration::from_secs(86_400)),
        },
        ..common::init_options()
    })
    .await;
    let (options, _) = common::test_options();
    let repo = open_with_config(
        base.clone(),
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        options,
        None,
    )
    .await
    .unwrap();

    for id in ["p1", "q1", "n1", "x1", "k1", "_log1"] {
        repo.blobs()
            .put_blob(&BlobId::new(id), Bytes::from_static(b"data"), PutOptions::default())
            .await
            .unwrap();
    }

    let seen = |id: &str| {
        base.puts()
            .into_iter()
            .rev()
            .find(|(b, _)| b.as_str() == id)
            .map(|(_, opts)| opts)
            .unwrap()
    };
    for id in ["p1", "q1", "n1", "x1"] {
        let opts = seen(id);
        assert_eq!(opts.retention_mode, Some(RetentionMode::Governance), "{id}");
        assert_eq!(opts.retention_period, Some(Duration::from_secs(86_400)), "{id}");
    }
    for id in ["k1", "_log1"] {
        assert_eq!(seen(id), PutOptions::default(), "{id}");
    }
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_no_retention_without_blob_cfg() {
    let base = common::recording_repo(common::init_options()).await;
    let (options, _) = common::test_options();
    let repo = open_with_config(
        base.clone(),
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        options,
        None,
    )
    .await
    .unwrap();
    repo.blobs()
        .put_blob(&BlobId::new("p1"), Bytes::from_static(b"data"), PutOptions::default())
        .await
        .unwrap();
    let (_, opts) = base.puts().pop().unwrap();
    assert!(!opts.has_retention());
    repo.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_secrets_are_stable_across_opens() {
    let base: SharedStorage = common::recording_repo(common::init_options()).await;
    let open_once = |base: SharedStorage| async move {
        let (options, _) = common::test_options();
        open_with_config(
            base,
            ClientOptions::default(),
            CachingOptions::default(),
            PASSWORD,
            options,
            None,
        )
        .await
        .unwrap()
    };

    let first = open_once(base.clone()).await;
    let second = open_once(base.clone()).await;

    let signed = first
        .shared()
        .metadata_protection()
        .protect("index-cache/n1", b"metadata")
        .unwrap();
    assert_eq!(
        second
            .shared()
            .metadata_protection()
            .verify("index-cache/n1", &signed)
            .unwrap(),
        b"metadata"
    );

    let sealed = first
        .shared()
        .content_protection()
        .protect("content-cache/p1", b"content")
        .unwrap();
    assert_eq!(
        second
            .shared()
            .content_protection()
            .verify("content-cache/p1", &sealed)
            .unwrap(),
        b"content"
    );

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_trace_storage_adds_no_behaviour() {
    let base = common::recording_repo(common::init_options()).await;
    let (options, _) = common::test_options();
    let repo = open_with_config(
        base.clone(),
        ClientOptions::default(),
        CachingOptions::default(),
        PASSWORD,
        repo::Options {
            trace_storage: true,
            ..options
        },
        None,
    )
    .await
    .unwrap();
    let gets_before = base.count(Operation::Get);
    let err = repo.blobs().get_blob(&BlobId::new("missing")).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(base.count(Operation::Get), gets_before + 1);
    repo.close().await.unwrap();
}

use std::collections::HashSet;

use log::{info, warn};

use crate::errors::DistError;
use srdriver::{BlobStore, DriverError, LinkKind, LinkStore, Walker};
use srmeta::{MetaError, MetadataClient};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    pub orphan_links: usize,
}

// offline pruner: compute the digest set reachable from any image layer,
// config or manifest across every stream's full tag history, then delete
// what the blob walk finds beyond it. the only component that enumerates
// the storage layout directly
pub async fn prune(
    blobs: &dyn BlobStore,
    links: &dyn LinkStore,
    walker: &dyn Walker,
    meta: &dyn MetadataClient,
    dry_run: bool,
) -> Result<PruneReport, DistError> {
    let mut reachable: HashSet<String> = HashSet::new();

    for stream in meta.list_image_streams().await? {
        for list in &stream.status.tags {
            for event in &list.items {
                reachable.insert(event.image.clone());
                let image = match meta.get_image(&event.image).await {
                    Ok(image) => image,
                    Err(MetaError::NotFound { .. }) => {
                        warn!(
                            "stream {}/{} references missing image {}",
                            stream.metadata.namespace, stream.metadata.name, event.image
                        );
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                for layer in image.layer_digests() {
                    reachable.insert(layer.to_string());
                }
                if let Some(config) = image.config_digest() {
                    reachable.insert(config.to_string());
                }
            }
        }
    }

    let mut report = PruneReport::default();

    for (digest, size) in walker.all_blobs().await? {
        if reachable.contains(&digest.to_string()) {
            continue;
        }
        report.deleted += 1;
        report.freed_bytes += size;
        if dry_run {
            info!("would delete {} ({} bytes)", digest, size);
            continue;
        }
        match blobs.delete(&digest).await {
            Ok(_) => info!("deleted {} ({} bytes)", digest, size),
            Err(DriverError::NotFound) => {}
            Err(e) => warn!("deleting {} failed: {:?}", digest, e),
        }
    }

    for repo in walker.all_repositories().await? {
        for kind in [LinkKind::Layer, LinkKind::Manifest] {
            for digest in links.links(&repo, kind).await? {
                if reachable.contains(&digest.to_string()) {
                    continue;
                }
                report.orphan_links += 1;
                if dry_run {
                    continue;
                }
                if let Err(e) = links.unlink(&repo, kind, &digest).await {
                    warn!("unlinking {} from {} failed: {:?}", digest, repo, e);
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use srdriver::MemoryDriver;
    use srmeta::{
        FakeMetadataClient, Image, ImageLayer, ImageStream, ImageStreamStatus,
        NamedTagEventList, ObjectMeta, TagEvent,
    };

    #[tokio::test]
    async fn test_prune_deletes_unreachable() {
        let driver = MemoryDriver::new();
        let keep = driver.put(Bytes::from_static(b"keep me")).await.unwrap();
        let drop1 = driver.put(Bytes::from_static(b"orphan one")).await.unwrap();
        let drop2 = driver.put(Bytes::from_static(b"orphan two!")).await.unwrap();

        let meta = FakeMetadataClient::new();
        meta.put_image(Image {
            metadata: ObjectMeta {
                name: "sha256:img".into(),
                ..Default::default()
            },
            docker_image_layers: vec![ImageLayer {
                name: keep.digest().to_string(),
                size: 7,
                media_type: srdriver::OCTET_STREAM.into(),
            }],
            ..Default::default()
        });
        meta.put_stream(ImageStream {
            metadata: ObjectMeta {
                namespace: "ns".into(),
                name: "app".into(),
                ..Default::default()
            },
            status: ImageStreamStatus {
                tags: vec![NamedTagEventList {
                    tag: "latest".into(),
                    items: vec![TagEvent {
                        image: "sha256:img".into(),
                        ..Default::default()
                    }],
                }],
                ..Default::default()
            },
            ..Default::default()
        });

        let report = prune(&driver, &driver, &driver, &meta, false).await.unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(report.freed_bytes, 10 + 11);
        assert!(driver.get(keep.digest()).await.is_ok());
        assert!(driver.get(drop1.digest()).await.is_err());
        assert!(driver.get(drop2.digest()).await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let driver = MemoryDriver::new();
        let orphan = driver.put(Bytes::from_static(b"orphan")).await.unwrap();
        let meta = FakeMetadataClient::new();
        let report = prune(&driver, &driver, &driver, &meta, true).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(driver.get(orphan.digest()).await.is_ok());
    }
}

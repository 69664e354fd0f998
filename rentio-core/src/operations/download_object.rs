use crate::error::{RentError, Result};
use crate::host::SectorStore;
use crate::store::MetadataStore;
use crate::transfer::{download_slab, slabs_for_download, ContractLocker};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct DownloadObjectOperation {
    store: Arc<MetadataStore>,
    locker: Arc<dyn ContractLocker>,
}

pub struct DownloadObjectOperationRequest {
    pub bucket: String,
    pub path: String,
    /// Byte range within the object; `None` means the whole object.
    pub range: Option<(u64, u64)>,
    pub hosts: Vec<Arc<dyn SectorStore>>,
    pub download_sector_timeout: Duration,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct DownloadObjectOperationResult {
    pub data: Bytes,
    pub etag: Option<String>,
}

impl DownloadObjectOperation {
    pub fn new(store: Arc<MetadataStore>, locker: Arc<dyn ContractLocker>) -> Self {
        Self { store, locker }
    }

    pub async fn run(
        &self,
        request: DownloadObjectOperationRequest,
    ) -> Result<DownloadObjectOperationResult> {
        let DownloadObjectOperationRequest {
            bucket,
            path,
            range,
            hosts,
            download_sector_timeout,
            shutdown,
        } = request;

        let (object, meta) = self.store.object(&bucket, &path)?;
        let (offset, length) = match range {
            Some((offset, length)) => {
                if offset + length > meta.size {
                    return Err(RentError::InvalidRequest(format!(
                        "range [{offset}, {}) exceeds object size {}",
                        offset + length,
                        meta.size
                    )));
                }
                (offset, length)
            }
            None => (0, meta.size),
        };
        if length == 0 {
            return Ok(DownloadObjectOperationResult {
                data: Bytes::new(),
                etag: meta.etag,
            });
        }

        let mut out = Vec::with_capacity(length as usize);
        for slice in slabs_for_download(&object.slabs, offset, length) {
            if slice.slab.shards.is_empty() {
                // still buffered: serve straight from the partial slab
                let data = self.store.partial_slab_data(&slice.slab.key)?;
                let start = slice.offset as usize;
                let end = start + slice.length as usize;
                if end > data.len() {
                    return Err(RentError::Integrity(format!(
                        "partial slab {} shorter than its slice",
                        slice.slab.key
                    )));
                }
                out.extend_from_slice(&data[start..end]);
                continue;
            }

            let (bytes, _slow) = download_slab(
                &slice,
                &hosts,
                Arc::clone(&self.locker),
                download_sector_timeout,
                &shutdown,
            )
            .await?;
            out.extend_from_slice(&bytes);
        }

        Ok(DownloadObjectOperationResult {
            data: Bytes::from(out),
            etag: meta.etag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::upload_object::{
        UploadObjectOperation, UploadObjectOperationRequest,
    };
    use crate::store::testutil::temp_store;
    use crate::transfer::testutil::{locker, MockHost};
    use crate::types::{Currency, SECTOR_SIZE};
    use rand::RngCore;

    async fn upload(
        store: &Arc<MetadataStore>,
        mocks: &[Arc<MockHost>],
        path: &str,
        data: &[u8],
        pack_partial: bool,
    ) -> Vec<Arc<dyn SectorStore>> {
        for mock in mocks {
            store
                .record_host_announcement(mock.host_key(), "dl.example.com:9982", 1)
                .unwrap();
            store
                .add_contract(mock.contract(), mock.host_key(), Currency::new(10), 1, 100, 244)
                .unwrap();
        }
        let hosts: Vec<Arc<dyn SectorStore>> = mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn SectorStore>)
            .collect();
        UploadObjectOperation::new(Arc::clone(store), locker())
            .run(UploadObjectOperationRequest {
                bucket: "buk".into(),
                path: path.into(),
                data: Bytes::copy_from_slice(data),
                min_shards: 2,
                total_shards: 4,
                hosts: hosts.clone(),
                upload_sector_timeout: Duration::from_secs(5),
                pack_partial,
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();
        hosts
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();
        let mocks: Vec<_> = (0..6).map(|_| MockHost::new()).collect();

        let mut data = vec![0u8; 9 * (1 << 20)];
        rand::thread_rng().fill_bytes(&mut data);
        let hosts = upload(&store, &mocks, "/rt", &data, false).await;

        let op = DownloadObjectOperation::new(Arc::clone(&store), locker());
        let result = op
            .run(DownloadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/rt".into(),
                range: None,
                hosts,
                download_sector_timeout: Duration::from_secs(5),
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(&result.data[..], &data[..]);
    }

    #[tokio::test]
    async fn test_ranged_download_spans_slab_boundary() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();
        let mocks: Vec<_> = (0..6).map(|_| MockHost::new()).collect();

        let mut data = vec![0u8; 2 * 2 * SECTOR_SIZE + 4096];
        rand::thread_rng().fill_bytes(&mut data);
        let hosts = upload(&store, &mocks, "/range", &data, false).await;

        // a window straddling the first slab boundary
        let offset = 2 * SECTOR_SIZE as u64 - 1000;
        let length = 5000u64;
        let op = DownloadObjectOperation::new(Arc::clone(&store), locker());
        let result = op
            .run(DownloadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/range".into(),
                range: Some((offset, length)),
                hosts,
                download_sector_timeout: Duration::from_secs(5),
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(
            &result.data[..],
            &data[offset as usize..(offset + length) as usize]
        );
    }

    #[tokio::test]
    async fn test_download_serves_buffered_tail() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();
        let mocks: Vec<_> = (0..4).map(|_| MockHost::new()).collect();

        let data = b"buffered tail bytes".to_vec();
        let hosts = upload(&store, &mocks, "/buf", &data, true).await;

        let op = DownloadObjectOperation::new(Arc::clone(&store), locker());
        let result = op
            .run(DownloadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/buf".into(),
                range: None,
                hosts,
                download_sector_timeout: Duration::from_secs(5),
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(&result.data[..], &data[..]);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();
        let op = DownloadObjectOperation::new(Arc::clone(&store), locker());
        let err = op
            .run(DownloadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/nope".into(),
                range: None,
                hosts: Vec::new(),
                download_sector_timeout: Duration::from_secs(1),
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RentError::NotFound(_)));
    }
}

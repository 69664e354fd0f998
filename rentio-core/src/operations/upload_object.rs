use super::used_contracts;
use crate::error::Result;
use crate::host::SectorStore;
use crate::object::{Object, Slab, SlabSlice};
use crate::store::MetadataStore;
use crate::transfer::{parallel_upload_slab, ContractLocker};
use crate::types::PublicKey;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct UploadObjectOperation {
    store: Arc<MetadataStore>,
    locker: Arc<dyn ContractLocker>,
}

pub struct UploadObjectOperationRequest {
    pub bucket: String,
    pub path: String,
    pub data: Bytes,
    pub min_shards: u8,
    pub total_shards: u8,
    pub hosts: Vec<Arc<dyn SectorStore>>,
    pub upload_sector_timeout: Duration,
    /// Buffer a trailing chunk smaller than a slab instead of padding it.
    pub pack_partial: bool,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct UploadObjectOperationResult {
    pub etag: String,
    pub size: u64,
    pub slabs: usize,
    /// Indices into the request's host list that missed the soft deadline
    /// at least once.
    pub slow_hosts: Vec<usize>,
}

impl UploadObjectOperation {
    pub fn new(store: Arc<MetadataStore>, locker: Arc<dyn ContractLocker>) -> Self {
        Self { store, locker }
    }

    pub async fn run(
        &self,
        request: UploadObjectOperationRequest,
    ) -> Result<UploadObjectOperationResult> {
        let UploadObjectOperationRequest {
            bucket,
            path,
            data,
            min_shards,
            total_shards,
            hosts,
            upload_sector_timeout,
            pack_partial,
            shutdown,
        } = request;

        let capacity = min_shards as usize * crate::types::SECTOR_SIZE;
        let etag = hex::encode(Sha256::digest(&data));
        let mut object = Object::new();
        let mut slab_count = 0usize;

        // slow hosts from one slab sort to the back for the next
        let mut hosts = hosts;
        let mut slow_counts: HashMap<PublicKey, usize> = HashMap::new();
        let mut all_slow: Vec<usize> = Vec::new();
        let original_order: HashMap<PublicKey, usize> = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| (h.host_key(), i))
            .collect();

        let mut remaining = &data[..];
        while !remaining.is_empty() {
            let take = remaining.len().min(capacity);
            let chunk = &remaining[..take];
            remaining = &remaining[take..];

            if pack_partial && take < capacity && remaining.is_empty() {
                let slices = self.store.add_partial_slab(chunk, min_shards, total_shards)?;
                object.slabs.extend(slices);
                break;
            }

            let slab = Slab::new(min_shards, total_shards);
            let mut shards = slab.encode(chunk, total_shards)?;
            slab.encrypt(&mut shards);

            let (sectors, slow) = parallel_upload_slab(
                shards,
                &hosts,
                Arc::clone(&self.locker),
                upload_sector_timeout,
                &shutdown,
            )
            .await?;

            for &i in &slow {
                let key = hosts[i].host_key();
                *slow_counts.entry(key).or_default() += 1;
                if let Some(&orig) = original_order.get(&key) {
                    if !all_slow.contains(&orig) {
                        all_slow.push(orig);
                    }
                }
            }
            hosts.sort_by_key(|h| slow_counts.get(&h.host_key()).copied().unwrap_or(0));

            let mut slab = slab;
            slab.shards = sectors;
            object.slabs.push(SlabSlice {
                slab,
                offset: 0,
                length: take as u32,
            });
            slab_count += 1;
        }

        let used = used_contracts(&hosts);
        self.store
            .update_object(&bucket, &path, &object, Some(&etag), &used)?;

        Ok(UploadObjectOperationResult {
            etag,
            size: object.size(),
            slabs: slab_count,
            slow_hosts: all_slow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::transfer::testutil::{locker, MockHost};
    use crate::transfer::MemContractLocker;
    use crate::types::{Currency, FileContractId, SECTOR_SIZE};
    use rand::RngCore;

    fn seeded_hosts(
        store: &MetadataStore,
        mocks: &[Arc<MockHost>],
    ) -> Vec<Arc<dyn SectorStore>> {
        for mock in mocks {
            store
                .record_host_announcement(mock.host_key(), "up.example.com:9982", 1)
                .unwrap();
            store
                .add_contract(mock.contract(), mock.host_key(), Currency::new(10), 1, 100, 244)
                .unwrap();
        }
        mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn SectorStore>)
            .collect()
    }

    #[tokio::test]
    async fn test_upload_writes_expected_rows() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();
        let mocks: Vec<_> = (0..10).map(|_| MockHost::new()).collect();
        let hosts = seeded_hosts(&store, &mocks);

        // 9 MiB at 2-of-4: two slabs (8 MiB + 1 MiB), eight shards
        let mut data = vec![0u8; 9 * (1 << 20)];
        rand::thread_rng().fill_bytes(&mut data);
        let op = UploadObjectOperation::new(Arc::clone(&store), locker());
        let result = op
            .run(UploadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/a".into(),
                data: Bytes::from(data.clone()),
                min_shards: 2,
                total_shards: 4,
                hosts,
                upload_sector_timeout: Duration::from_secs(5),
                pack_partial: false,
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();

        assert_eq!(result.size, data.len() as u64);
        assert_eq!(result.slabs, 2);

        let (object, meta) = store.object("buk", "/a").unwrap();
        assert_eq!(meta.size, data.len() as u64);
        assert_eq!(object.slabs.len(), 2);
        assert_eq!(object.slabs[0].length as usize, 2 * SECTOR_SIZE);
        assert_eq!(object.slabs[1].length as usize, 1 << 20);
        for ss in &object.slabs {
            assert_eq!(ss.slab.shards.len(), 4);
        }

        let stats = store.objects_stats().unwrap();
        assert_eq!(stats.num_objects, 1);
        assert_eq!(stats.total_objects_size, data.len() as u64);
        assert_eq!(stats.total_uploaded_size, 8 * SECTOR_SIZE as u64);
        assert_eq!(stats.total_sectors_size, 8 * SECTOR_SIZE as u64);
    }

    #[tokio::test]
    async fn test_upload_reports_slow_hosts_and_reorders() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();

        let slow = MockHost::with_delay(Duration::from_millis(300));
        let mut mocks = vec![slow];
        for _ in 0..5 {
            mocks.push(MockHost::new());
        }
        let hosts = seeded_hosts(&store, &mocks);

        // two small slabs force two upload rounds
        let data = vec![7u8; 2 * SECTOR_SIZE + 100];
        let op = UploadObjectOperation::new(
            Arc::clone(&store),
            Arc::new(MemContractLocker::new(Duration::from_secs(60))),
        );
        let result = op
            .run(UploadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/slow".into(),
                data: Bytes::from(data),
                min_shards: 2,
                total_shards: 4,
                hosts,
                upload_sector_timeout: Duration::from_millis(50),
                pack_partial: false,
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();

        // host 0 was slow in round one and is reported by original index
        assert_eq!(result.slow_hosts, vec![0]);
        // the second slab avoided the slow host entirely
        let (object, _) = store.object("buk", "/slow").unwrap();
        for shard in &object.slabs[1].slab.shards {
            assert_ne!(shard.host, mocks[0].host_key());
        }
    }

    #[tokio::test]
    async fn test_upload_packs_partial_tail() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.create_bucket("buk", serde_json::json!({})).unwrap();
        let mocks: Vec<_> = (0..4).map(|_| MockHost::new()).collect();
        let hosts = seeded_hosts(&store, &mocks);

        let data = vec![3u8; 1000];
        let op = UploadObjectOperation::new(Arc::clone(&store), locker());
        let result = op
            .run(UploadObjectOperationRequest {
                bucket: "buk".into(),
                path: "/tail".into(),
                data: Bytes::from(data),
                min_shards: 2,
                total_shards: 4,
                hosts,
                upload_sector_timeout: Duration::from_secs(1),
                pack_partial: true,
                shutdown: CancellationToken::new(),
            })
            .await
            .unwrap();

        // nothing was erasure-coded yet; the tail sits in a buffer
        assert_eq!(result.slabs, 0);
        let (object, meta) = store.object("buk", "/tail").unwrap();
        assert_eq!(meta.size, 1000);
        assert_eq!(object.slabs.len(), 1);
        assert!(object.slabs[0].slab.shards.is_empty());
        assert_eq!(store.partial_slab_data(&object.slabs[0].slab.key).unwrap().len(), 1000);
    }
}

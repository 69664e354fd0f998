//! The parallel transfer engine.
//!
//! Slab uploads and downloads fan one task out per shard. Each attempt runs
//! under the contract lock with a soft per-sector deadline: a missed
//! deadline emits a slow response while the attempt itself stays alive, and
//! the collector starts an overdrive sibling on the next free host. The
//! first completion wins; hosts that timed out are reported so the next
//! slab sorts them to the back.

pub mod lock;

use crate::error::{HostErrorSet, RentError, Result};
use crate::host::SectorStore;
use crate::object::{Sector, Slab, SlabSlice};
use crate::types::{Hash256, PublicKey, SECTOR_SIZE};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use lock::{
    ContractLocker, MemContractLocker, CONTRACT_LOCKING_DOWNLOAD_PRIORITY,
    CONTRACT_LOCKING_UPLOAD_PRIORITY,
};

/// Upper bound on waiting for a contract lock inside a transfer attempt.
pub const CONTRACT_LOCK_MAX_WAIT: Duration = Duration::from_secs(30);

struct UploadResp {
    shard_index: usize,
    host_index: usize,
    timed_out: bool,
    result: Result<Hash256>,
}

/// Upload every shard of a slab, one task per shard, with overdrive on
/// slow hosts. Returns the per-shard sectors and the indices of hosts that
/// missed the soft deadline.
pub async fn parallel_upload_slab(
    shards: Vec<Vec<u8>>,
    hosts: &[Arc<dyn SectorStore>],
    locker: Arc<dyn ContractLocker>,
    upload_sector_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(Vec<Sector>, Vec<usize>)> {
    if hosts.len() < shards.len() {
        return Err(RentError::InvalidRequest(format!(
            "not enough hosts to upload slab, {} < {}",
            hosts.len(),
            shards.len()
        )));
    }

    let shards = Arc::new(shards);
    let (tx, mut rx) = mpsc::unbounded_channel::<UploadResp>();

    let dispatch = |shard_index: usize, host_index: usize| {
        let tx = tx.clone();
        let host = Arc::clone(&hosts[host_index]);
        let locker = Arc::clone(&locker);
        let shards = Arc::clone(&shards);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let work = async {
                let lock_id = locker
                    .acquire_contract(
                        host.contract(),
                        CONTRACT_LOCKING_UPLOAD_PRIORITY,
                        CONTRACT_LOCK_MAX_WAIT,
                    )
                    .await?;
                let result = host.upload_sector(&shards[shard_index]).await;
                let _ = locker.release_contract(host.contract(), lock_id).await;
                result
            };
            tokio::pin!(work);

            if !upload_sector_timeout.is_zero() {
                tokio::select! {
                    result = &mut work => {
                        let _ = tx.send(UploadResp { shard_index, host_index, timed_out: false, result });
                        return;
                    }
                    _ = tokio::time::sleep(upload_sector_timeout) => {
                        let _ = tx.send(UploadResp {
                            shard_index,
                            host_index,
                            timed_out: true,
                            result: Err(RentError::Timeout("upload sector".into())),
                        });
                    }
                    _ = token.cancelled() => {
                        let _ = tx.send(UploadResp { shard_index, host_index, timed_out: false, result: Err(RentError::Cancelled) });
                        return;
                    }
                }
            }
            tokio::select! {
                result = &mut work => {
                    let _ = tx.send(UploadResp { shard_index, host_index, timed_out: false, result });
                }
                _ = token.cancelled() => {
                    let _ = tx.send(UploadResp { shard_index, host_index, timed_out: false, result: Err(RentError::Cancelled) });
                }
            }
        });
    };

    let mut host_index = 0;
    let mut inflight = 0usize;
    for shard_index in 0..shards.len() {
        dispatch(shard_index, host_index);
        host_index += 1;
        inflight += 1;
    }

    let mut errs = HostErrorSet::default();
    let mut sectors: Vec<Option<Sector>> = vec![None; shards.len()];
    let mut slow_hosts = Vec::new();
    let mut rem = shards.len();
    while rem > 0 && inflight > 0 {
        let resp = rx.recv().await.expect("senders outlive the collector");
        if !resp.timed_out {
            inflight -= 1;
        }
        match resp.result {
            Err(err) => {
                if resp.timed_out {
                    slow_hosts.push(resp.host_index);
                }
                errs.push(hosts[resp.host_index].host_key(), err);
                // spare capacity: advance to the next host
                if host_index < hosts.len() && !shutdown.is_cancelled() {
                    dispatch(resp.shard_index, host_index);
                    host_index += 1;
                    inflight += 1;
                }
            }
            Ok(root) => {
                if sectors[resp.shard_index].is_none() {
                    sectors[resp.shard_index] = Some(Sector {
                        host: hosts[resp.host_index].host_key(),
                        root,
                    });
                    rem -= 1;
                }
            }
        }
    }

    if rem > 0 {
        if shutdown.is_cancelled() {
            return Err(RentError::Cancelled);
        }
        return Err(errs.into());
    }
    let sectors = sectors.into_iter().map(|s| s.expect("rem is 0")).collect();
    Ok((sectors, slow_hosts))
}

struct DownloadResp {
    host_index: usize,
    timed_out: bool,
    result: Result<(usize, Vec<u8>)>,
}

/// Download enough shards of a slice to recover it: `min_shards` tasks
/// initially, reassigning to spare shard-holding hosts on error or soft
/// timeout. Returns shards indexed by slab position (still encrypted) and
/// the slow host indices.
pub async fn parallel_download_slab(
    slice: &SlabSlice,
    hosts: &[Arc<dyn SectorStore>],
    locker: Arc<dyn ContractLocker>,
    download_sector_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(Vec<Option<Vec<u8>>>, Vec<usize>)> {
    let min_shards = slice.slab.min_shards as usize;
    if hosts.len() < min_shards {
        return Err(RentError::InvalidRequest(format!(
            "not enough hosts to recover slab, {} < {}",
            hosts.len(),
            min_shards
        )));
    }
    let (offset, length) = slice.sector_region();
    let shard_by_host: HashMap<PublicKey, (usize, Hash256)> = slice
        .slab
        .shards
        .iter()
        .enumerate()
        .map(|(i, s)| (s.host, (i, s.root)))
        .collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<DownloadResp>();
    let dispatch = |host_index: usize| {
        let tx = tx.clone();
        let host = Arc::clone(&hosts[host_index]);
        let locker = Arc::clone(&locker);
        let token = shutdown.clone();
        let assignment = shard_by_host.get(&host.host_key()).copied();
        tokio::spawn(async move {
            let work = async {
                let Some((slab_index, root)) = assignment else {
                    return Err(RentError::Host(format!(
                        "host {} holds no shard of this slab",
                        host.host_key()
                    )));
                };
                let lock_id = locker
                    .acquire_contract(
                        host.contract(),
                        CONTRACT_LOCKING_DOWNLOAD_PRIORITY,
                        CONTRACT_LOCK_MAX_WAIT,
                    )
                    .await?;
                let result = host.download_sector(root, offset, length).await;
                let _ = locker.release_contract(host.contract(), lock_id).await;
                result.map(|data| (slab_index, data))
            };
            tokio::pin!(work);

            if !download_sector_timeout.is_zero() {
                tokio::select! {
                    result = &mut work => {
                        let _ = tx.send(DownloadResp { host_index, timed_out: false, result });
                        return;
                    }
                    _ = tokio::time::sleep(download_sector_timeout) => {
                        let _ = tx.send(DownloadResp {
                            host_index,
                            timed_out: true,
                            result: Err(RentError::Timeout("download sector".into())),
                        });
                    }
                    _ = token.cancelled() => {
                        let _ = tx.send(DownloadResp { host_index, timed_out: false, result: Err(RentError::Cancelled) });
                        return;
                    }
                }
            }
            tokio::select! {
                result = &mut work => {
                    let _ = tx.send(DownloadResp { host_index, timed_out: false, result });
                }
                _ = token.cancelled() => {
                    let _ = tx.send(DownloadResp { host_index, timed_out: false, result: Err(RentError::Cancelled) });
                }
            }
        });
    };

    let mut host_index = 0;
    let mut inflight = 0usize;
    for _ in 0..min_shards {
        dispatch(host_index);
        host_index += 1;
        inflight += 1;
    }

    let mut errs = HostErrorSet::default();
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; slice.slab.shards.len()];
    let mut slow_hosts = Vec::new();
    let mut rem = min_shards;
    while rem > 0 && inflight > 0 {
        let resp = rx.recv().await.expect("senders outlive the collector");
        if !resp.timed_out {
            inflight -= 1;
        }
        match resp.result {
            Err(err) => {
                if resp.timed_out {
                    slow_hosts.push(resp.host_index);
                }
                errs.push(hosts[resp.host_index].host_key(), err);
                if host_index < hosts.len() && !shutdown.is_cancelled() {
                    dispatch(host_index);
                    host_index += 1;
                    inflight += 1;
                }
            }
            Ok((slab_index, data)) => {
                if shards[slab_index].is_none() {
                    shards[slab_index] = Some(data);
                    rem -= 1;
                }
            }
        }
    }

    if rem > 0 {
        if shutdown.is_cancelled() {
            return Err(RentError::Cancelled);
        }
        return Err(errs.into());
    }
    Ok((shards, slow_hosts))
}

/// Download, decrypt, and recover the exact bytes of a slice.
pub async fn download_slab(
    slice: &SlabSlice,
    hosts: &[Arc<dyn SectorStore>],
    locker: Arc<dyn ContractLocker>,
    download_sector_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(Vec<u8>, Vec<usize>)> {
    let (mut shards, slow_hosts) =
        parallel_download_slab(slice, hosts, locker, download_sector_timeout, shutdown).await?;
    let (sector_offset, _) = slice.sector_region();
    slice.slab.decrypt_partial(&mut shards, sector_offset as usize);
    slice.slab.reconstruct(&mut shards)?;
    let mut out = Vec::with_capacity(slice.length as usize);
    slice.recover(&mut out, &shards)?;
    Ok((out, slow_hosts))
}

/// Re-disperse a slab's bad shards onto fresh hosts. `hosts` is the healthy
/// pool; shards on hosts outside the pool, or doubled up on one host, are
/// relocated. The slab's shards are overwritten in place on success.
pub async fn migrate_slab(
    slab: &mut Slab,
    hosts: &[Arc<dyn SectorStore>],
    locker: Arc<dyn ContractLocker>,
    download_sector_timeout: Duration,
    upload_sector_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    let good: HashSet<PublicKey> = hosts.iter().map(|h| h.host_key()).collect();
    let mut used: HashSet<PublicKey> = HashSet::new();
    let mut shard_indices = Vec::new();
    for (i, shard) in slab.shards.iter().enumerate() {
        if !good.contains(&shard.host) || !used.insert(shard.host) {
            shard_indices.push(i);
        }
    }
    if shard_indices.is_empty() {
        return Ok(());
    }

    let min_shards = slab.min_shards as usize;
    if slab.shards.len() - shard_indices.len() < min_shards {
        return Err(RentError::Integrity(format!(
            "not enough good shards to recover slab, {} < {}",
            slab.shards.len() - shard_indices.len(),
            min_shards
        )));
    }
    // the upload pool excludes hosts already carrying a good shard
    if shard_indices.len() > hosts.len() - used.len() {
        return Err(RentError::Host(
            "not enough hosts to migrate slab".into(),
        ));
    }

    // download and reconstruct the full slab
    let slice = SlabSlice {
        slab: slab.clone(),
        offset: 0,
        length: (min_shards * SECTOR_SIZE) as u32,
    };
    let (mut shards, slow_hosts) = parallel_download_slab(
        &slice,
        hosts,
        Arc::clone(&locker),
        download_sector_timeout,
        shutdown,
    )
    .await?;
    slab.decrypt_partial(&mut shards, 0);
    slab.reconstruct(&mut shards)?;
    let mut plain: Vec<Vec<u8>> = shards
        .into_iter()
        .map(|s| s.expect("reconstructed"))
        .collect();
    slab.encrypt(&mut plain);

    // only the shards being relocated get re-uploaded
    let upload_shards: Vec<Vec<u8>> = shard_indices.iter().map(|&i| plain[i].clone()).collect();

    // unused hosts only, shuffled, slow ones last
    let mut slow_count: HashMap<PublicKey, usize> = HashMap::new();
    for &i in &slow_hosts {
        *slow_count.entry(hosts[i].host_key()).or_default() += 1;
    }
    let mut pool: Vec<Arc<dyn SectorStore>> = hosts
        .iter()
        .filter(|h| !used.contains(&h.host_key()))
        .cloned()
        .collect();
    {
        use rand::seq::SliceRandom;
        pool.shuffle(&mut rand::thread_rng());
    }
    pool.sort_by_key(|h| slow_count.get(&h.host_key()).copied().unwrap_or(0));

    let (uploaded, _) = parallel_upload_slab(
        upload_shards,
        &pool,
        locker,
        upload_sector_timeout,
        shutdown,
    )
    .await?;

    for (i, &si) in shard_indices.iter().enumerate() {
        slab.shards[si] = uploaded[i];
    }
    Ok(())
}

/// Issue one best-effort `DeleteSectors` per host, covering every root the
/// host stores across the given slabs. Errors are aggregated, never fatal.
pub async fn delete_slabs(slabs: &[Slab], hosts: &[Arc<dyn SectorStore>]) -> HostErrorSet {
    let mut roots_by_host: HashMap<PublicKey, Vec<Hash256>> = HashMap::new();
    for slab in slabs {
        for shard in &slab.shards {
            roots_by_host.entry(shard.host).or_default().push(shard.root);
        }
    }

    let mut tasks = Vec::new();
    for host in hosts {
        let host = Arc::clone(host);
        // an absent entry means this host stores nothing, making the RPC a
        // no-op
        let roots = roots_by_host.get(&host.host_key()).cloned().unwrap_or_default();
        tasks.push(tokio::spawn(async move {
            let key = host.host_key();
            (key, host.delete_sectors(&roots).await)
        }));
    }

    let mut errs = HostErrorSet::default();
    for task in tasks {
        match task.await {
            Ok((_, Ok(()))) => {}
            Ok((key, Err(err))) => errs.push(key, err),
            Err(join_err) => {
                tracing::warn!("delete task panicked: {join_err}");
            }
        }
    }
    errs
}

/// The minimal contiguous subsequence of `slices` covering the byte range
/// `[offset, offset + length)`, with the first and last slices trimmed to
/// the exact bounds.
pub fn slabs_for_download(slices: &[SlabSlice], offset: u64, length: u64) -> Vec<SlabSlice> {
    let mut slices = slices.to_vec();

    let mut first_offset = offset;
    let mut start = 0;
    for (i, ss) in slices.iter().enumerate() {
        if first_offset <= ss.length as u64 {
            start = i;
            break;
        }
        first_offset -= ss.length as u64;
    }
    slices.drain(..start);
    if let Some(first) = slices.first_mut() {
        first.offset += first_offset as u32;
        first.length -= first_offset as u32;
    }

    let mut last_length = length;
    let mut end = slices.len();
    for (i, ss) in slices.iter().enumerate() {
        if last_length <= ss.length as u64 {
            end = i + 1;
            break;
        }
        last_length -= ss.length as u64;
    }
    slices.truncate(end);
    if let Some(last) = slices.last_mut() {
        last.length = last_length as u32;
    }
    slices
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::types::hash_bytes;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// An in-memory host. Roots are plain hashes of the sector bytes so
    /// tests stay cheap.
    pub(crate) struct MockHost {
        key: PublicKey,
        fcid: crate::types::FileContractId,
        pub sectors: Mutex<HashMap<Hash256, Vec<u8>>>,
        pub upload_delay: Duration,
        pub fail_uploads: bool,
        pub uploads: AtomicUsize,
        pub deletes: Mutex<Vec<Hash256>>,
    }

    impl MockHost {
        pub fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        pub fn with_delay(upload_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                key: PublicKey::random(),
                fcid: crate::types::FileContractId::random(),
                sectors: Mutex::new(HashMap::new()),
                upload_delay,
                fail_uploads: false,
                uploads: AtomicUsize::new(0),
                deletes: Mutex::new(Vec::new()),
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                key: PublicKey::random(),
                fcid: crate::types::FileContractId::random(),
                sectors: Mutex::new(HashMap::new()),
                upload_delay: Duration::ZERO,
                fail_uploads: true,
                uploads: AtomicUsize::new(0),
                deletes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SectorStore for MockHost {
        fn contract(&self) -> crate::types::FileContractId {
            self.fcid
        }

        fn host_key(&self) -> PublicKey {
            self.key
        }

        async fn upload_sector(&self, sector: &[u8]) -> Result<Hash256> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if !self.upload_delay.is_zero() {
                tokio::time::sleep(self.upload_delay).await;
            }
            if self.fail_uploads {
                return Err(RentError::Host("mock host refused upload".into()));
            }
            let root = hash_bytes(sector);
            self.sectors.lock().unwrap().insert(root, sector.to_vec());
            Ok(root)
        }

        async fn download_sector(
            &self,
            root: Hash256,
            offset: u32,
            length: u32,
        ) -> Result<Vec<u8>> {
            if !self.upload_delay.is_zero() {
                tokio::time::sleep(self.upload_delay).await;
            }
            let sectors = self.sectors.lock().unwrap();
            let Some(data) = sectors.get(&root) else {
                return Err(RentError::NotFound(format!("sector {root}")));
            };
            let start = offset as usize;
            let end = start + length as usize;
            if end > data.len() {
                return Err(RentError::Host("sector range out of bounds".into()));
            }
            Ok(data[start..end].to_vec())
        }

        async fn delete_sectors(&self, roots: &[Hash256]) -> Result<()> {
            self.deletes.lock().unwrap().extend_from_slice(roots);
            let mut sectors = self.sectors.lock().unwrap();
            for root in roots {
                sectors.remove(root);
            }
            Ok(())
        }
    }

    pub(crate) fn locker() -> Arc<dyn ContractLocker> {
        Arc::new(MemContractLocker::new(Duration::from_secs(60)))
    }
}

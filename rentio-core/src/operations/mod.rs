//! Object-level operations composed from the codec, the transfer engine,
//! and the metadata store.

pub mod download_object;
pub mod upload_object;

pub use download_object::{
    DownloadObjectOperation, DownloadObjectOperationRequest, DownloadObjectOperationResult,
};
pub use upload_object::{
    UploadObjectOperation, UploadObjectOperationRequest, UploadObjectOperationResult,
};

use crate::host::SectorStore;
use crate::types::{FileContractId, PublicKey};
use std::collections::HashMap;
use std::sync::Arc;

/// The host → contract mapping the store needs to link sectors.
pub(crate) fn used_contracts(hosts: &[Arc<dyn SectorStore>]) -> HashMap<PublicKey, FileContractId> {
    hosts.iter().map(|h| (h.host_key(), h.contract())).collect()
}

use crate::chain::HttpChainClient;
use crate::config::Config;
use crate::hosts::GatewayHostTransport;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use rentio_core::autopilot::contractor::host_usability;
use rentio_core::{
    AccountManager, Autopilot, AutopilotConfig, AutopilotState, ChainClient, CompletedPart,
    ContractLocker, ContractMetadata, Contractor, DownloadObjectOperation,
    DownloadObjectOperationRequest, EncryptionKey, GougingChecker, GougingSettings, HostScan,
    HostTransport, MemContractLocker, MetadataStore, Migrator, ObjectEntry, ObjectMetadata,
    PriceTableCache, PriceTableUpdate, Pruner, PublicKey, RemoteHostFactory, RentError, Scanner,
    SectorStore, SectorStoreFactory, Slab, SlabSlice, SpendingRecorder, UnusableReason,
    UploadObjectOperation, UploadObjectOperationRequest, AUTOPILOT_CONTRACT_SET,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ServerState {
    pub config: Config,
    pub store: Arc<MetadataStore>,
    pub chain: Arc<dyn ChainClient>,
    pub locker: Arc<dyn ContractLocker>,
    pub factory: Arc<dyn SectorStoreFactory>,
    pub autopilot: Arc<Autopilot>,
    pub upload_op: UploadObjectOperation,
    pub download_op: DownloadObjectOperation,
    pub shutdown: CancellationToken,
    /// Upload ids currently in flight; packed-slab fetches skip buffers a
    /// worker already claimed.
    ongoing_uploads: Mutex<HashSet<String>>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

struct ApiError(RentError);

impl From<RentError> for ApiError {
    fn from(err: RentError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RentError::NotFound(_) => StatusCode::NOT_FOUND,
            RentError::AlreadyExists(_) | RentError::Conflict(_) => StatusCode::CONFLICT,
            RentError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            RentError::InvalidRequest(_) | RentError::Config(_) => StatusCode::BAD_REQUEST,
            RentError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RentError::Unusable(_)
            | RentError::InsufficientFunds(_)
            | RentError::BalanceInsufficient
            | RentError::BalanceLimitExceeded => StatusCode::PAYMENT_REQUIRED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

pub async fn run_server(config: Config) -> rentio_core::Result<()> {
    let shutdown = CancellationToken::new();
    let store = Arc::new(MetadataStore::open(&config.store_path)?);
    let chain: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(&config.node_api_url));
    let transport: Arc<dyn HostTransport> =
        Arc::new(GatewayHostTransport::new(&config.host_gateway_url));
    let accounts = Arc::new(AccountManager::new(Arc::clone(&store), config.worker_seed()?));
    let price_tables = Arc::new(PriceTableCache::new(
        Arc::clone(&transport),
        Arc::clone(&accounts),
    ));
    let spending = Arc::new(SpendingRecorder::new(Arc::clone(&store)));
    let flusher = Arc::clone(&spending).run_flusher(Duration::from_secs(30), shutdown.clone());
    let locker: Arc<dyn ContractLocker> =
        Arc::new(MemContractLocker::new(Duration::from_secs(60)));
    let factory: Arc<dyn SectorStoreFactory> = Arc::new(RemoteHostFactory {
        transport: Arc::clone(&transport),
        accounts: Arc::clone(&accounts),
        price_tables,
        spending,
    });

    let scanner = Arc::new(Scanner::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        config.autopilot.hosts.clone(),
    ));
    let contractor = Arc::new(Contractor::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&locker),
        AUTOPILOT_CONTRACT_SET,
    ));
    let migrator = Arc::new(Migrator::new(
        Arc::clone(&store),
        Arc::clone(&locker),
        Arc::clone(&factory),
        AUTOPILOT_CONTRACT_SET,
        config.migrator_health_cutoff,
        config.migrator_parallel_slabs,
        Duration::from_millis(config.download_sector_timeout_ms),
        Duration::from_millis(config.upload_sector_timeout_ms),
    ));
    let pruner = Arc::new(Pruner::new(Arc::clone(&store), Arc::clone(&factory)));
    let autopilot = Arc::new(Autopilot::new(
        Arc::clone(&chain),
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&accounts),
        scanner,
        contractor,
        migrator,
        pruner,
        config.autopilot.clone(),
        config.gouging.clone(),
        config.redundancy,
        Duration::from_secs(config.heartbeat_secs),
        shutdown.clone(),
    ));
    let autopilot_task = tokio::spawn(Arc::clone(&autopilot).run());

    let state = Arc::new(ServerState {
        upload_op: UploadObjectOperation::new(Arc::clone(&store), Arc::clone(&locker)),
        download_op: DownloadObjectOperation::new(Arc::clone(&store), Arc::clone(&locker)),
        config: config.clone(),
        store,
        chain,
        locker,
        factory,
        autopilot: Arc::clone(&autopilot),
        shutdown: shutdown.clone(),
        ongoing_uploads: Mutex::new(HashSet::new()),
    });

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("server listening on {}", config.listen_addr);

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = serve_shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        })
        .await?;

    tracing::info!("shutting down");
    autopilot.shutdown(Duration::from_secs(60)).await;
    shutdown.cancel();
    let _ = autopilot_task.await;
    let _ = flusher.await;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/buckets", post(create_bucket).get(list_buckets))
        .route("/bucket/:name", get(get_bucket).delete(delete_bucket))
        .route("/bucket/:name/policy", put(put_bucket_policy))
        .route(
            "/objects/*path",
            get(get_object).put(put_object).delete(delete_object),
        )
        .route("/search/objects", get(search_objects))
        .route("/slabs/partial", post(add_partial_slab))
        .route("/slab/:key", get(get_slab).put(put_slab))
        .route("/slabs/migration", post(slabs_for_migration))
        .route("/slabs/refreshhealth", post(refresh_health))
        .route("/slabbuffer/fetch", post(fetch_packed_slabs))
        .route("/slabbuffer/done", post(packed_slab_done))
        .route("/upload/:id", post(track_upload).delete(finish_upload))
        .route("/upload/:id/sector", post(track_upload_sector))
        .route("/multipart/create", post(create_multipart))
        .route("/multipart/part", put(add_multipart_part))
        .route("/multipart/complete", post(complete_multipart))
        .route("/multipart/abort", post(abort_multipart))
        .route("/multipart/parts/:id", get(list_multipart_parts))
        .route("/hosts", post(search_hosts))
        .route("/hosts/scans", post(record_host_scans))
        .route("/hosts/pricetables", post(record_price_tables))
        .route("/hosts/allowlist", put(update_allowlist).get(get_allowlist))
        .route("/hosts/blocklist", put(update_blocklist).get(get_blocklist))
        .route("/hosts/remove", post(remove_hosts))
        .route("/autopilot/state", get(autopilot_state))
        .route("/autopilot/trigger", post(autopilot_trigger))
        .route("/autopilot/config/evaluate", post(evaluate_config))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Shared-secret bearer auth; GETs on /objects pass when anonymous
/// downloads are enabled.
async fn auth(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let anonymous_ok = state.config.anonymous_downloads
        && request.method() == axum::http::Method::GET
        && request.uri().path().starts_with("/objects/");
    if !anonymous_ok {
        let authorized = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| token == state.config.auth_secret)
            .unwrap_or(false);
        if !authorized {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    next.run(request).await
}

/// The sector stores for every contract in the autopilot set.
async fn host_pool(
    state: &ServerState,
) -> rentio_core::Result<(Vec<Arc<dyn SectorStore>>, GougingChecker)> {
    let height = state
        .chain
        .consensus_state()
        .await
        .map(|cs| cs.block_height)
        .unwrap_or(0);
    let checker = GougingChecker::new(state.config.gouging.clone(), height);
    let contracts: Vec<ContractMetadata> = state
        .store
        .contracts_in_set(AUTOPILOT_CONTRACT_SET)
        .unwrap_or_default();
    let hosts = contracts
        .iter()
        .map(|c| {
            state
                .factory
                .sector_store(c.host_key, &c.host_address, c.id, &checker)
        })
        .collect();
    Ok((hosts, checker))
}

// === buckets ===

#[derive(Deserialize)]
struct CreateBucketRequest {
    name: String,
    #[serde(default)]
    policy: Option<serde_json::Value>,
}

async fn create_bucket(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateBucketRequest>,
) -> ApiResult<()> {
    state
        .store
        .create_bucket(&req.name, req.policy.unwrap_or_else(|| serde_json::json!({})))?;
    Ok(ok(()))
}

async fn list_buckets(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<String>> {
    Ok(ok(state.store.buckets()?))
}

#[derive(Serialize)]
struct BucketResponse {
    name: String,
    policy: serde_json::Value,
}

async fn get_bucket(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<BucketResponse> {
    let (name, policy) = state.store.bucket(&name)?;
    Ok(ok(BucketResponse { name, policy }))
}

async fn delete_bucket(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<()> {
    state.store.delete_bucket(&name)?;
    Ok(ok(()))
}

async fn put_bucket_policy(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(policy): Json<serde_json::Value>,
) -> ApiResult<()> {
    state.store.update_bucket_policy(&name, policy)?;
    Ok(ok(()))
}

// === objects ===

fn default_bucket() -> String {
    "default".to_string()
}

#[derive(Deserialize)]
struct ObjectQuery {
    #[serde(default = "default_bucket")]
    bucket: String,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    prefix: String,
}

async fn get_object(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> std::result::Result<Response, ApiError> {
    let path = format!("/{path}");
    if path.ends_with('/') {
        let entries: Vec<ObjectEntry> = state
            .store
            .object_entries(&query.bucket, &path, &query.prefix, 0, 1000)?;
        return Ok(ok(entries).into_response());
    }

    let (hosts, _) = host_pool(&state).await?;
    let range = match (query.offset, query.length) {
        (Some(offset), Some(length)) => Some((offset, length)),
        _ => None,
    };
    let result = state
        .download_op
        .run(DownloadObjectOperationRequest {
            bucket: query.bucket,
            path,
            range,
            hosts,
            download_sector_timeout: Duration::from_millis(
                state.config.download_sector_timeout_ms,
            ),
            shutdown: state.shutdown.clone(),
        })
        .await?;

    let mut response = result.data.into_response();
    if let Some(etag) = result.etag {
        if let Ok(value) = etag.parse() {
            response.headers_mut().insert(axum::http::header::ETAG, value);
        }
    }
    Ok(response)
}

async fn put_object(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(query): Query<ObjectQuery>,
    body: Bytes,
) -> ApiResult<ObjectMetadata> {
    let path = format!("/{path}");
    let (hosts, _) = host_pool(&state).await?;
    let redundancy = state.config.redundancy;
    let result = state
        .upload_op
        .run(UploadObjectOperationRequest {
            bucket: query.bucket.clone(),
            path: path.clone(),
            data: body,
            min_shards: redundancy.min_shards,
            total_shards: redundancy.total_shards,
            hosts,
            upload_sector_timeout: Duration::from_millis(state.config.upload_sector_timeout_ms),
            pack_partial: true,
            shutdown: state.shutdown.clone(),
        })
        .await?;
    Ok(ok(ObjectMetadata {
        name: path,
        size: result.size,
        etag: Some(result.etag),
    }))
}

async fn delete_object(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<()> {
    state.store.remove_object(&query.bucket, &format!("/{path}"))?;
    Ok(ok(()))
}

#[derive(Deserialize)]
struct SearchObjectsQuery {
    #[serde(default = "default_bucket")]
    bucket: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn search_objects(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SearchObjectsQuery>,
) -> ApiResult<Vec<ObjectMetadata>> {
    Ok(ok(state.store.search_objects(
        &query.bucket,
        &query.key,
        query.offset,
        query.limit,
    )?))
}

// === slabs ===

#[derive(Deserialize)]
struct PartialSlabQuery {
    min_shards: u8,
    total_shards: u8,
}

async fn add_partial_slab(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PartialSlabQuery>,
    body: Bytes,
) -> ApiResult<Vec<SlabSlice>> {
    Ok(ok(state.store.add_partial_slab(
        &body,
        query.min_shards,
        query.total_shards,
    )?))
}

async fn get_slab(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> ApiResult<Slab> {
    let key: EncryptionKey = key.parse()?;
    Ok(ok(state.store.slab(&key)?))
}

#[derive(Deserialize)]
struct UpdateSlabRequest {
    slab: Slab,
    used_contracts: HashMap<PublicKey, rentio_core::FileContractId>,
}

async fn put_slab(
    State(state): State<Arc<ServerState>>,
    Path(_key): Path<String>,
    Json(req): Json<UpdateSlabRequest>,
) -> ApiResult<()> {
    state.store.update_slab(&req.slab, &req.used_contracts)?;
    Ok(ok(()))
}

#[derive(Deserialize)]
struct MigrationSlabsRequest {
    #[serde(default = "default_health_cutoff")]
    health_cutoff: f64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_health_cutoff() -> f64 {
    0.75
}

#[derive(Serialize)]
struct SlabHealthResponse {
    slab: Slab,
    health: f64,
}

async fn slabs_for_migration(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<MigrationSlabsRequest>,
) -> ApiResult<Vec<SlabHealthResponse>> {
    let slabs = state
        .store
        .slabs_for_migration(AUTOPILOT_CONTRACT_SET, req.health_cutoff, req.limit)?;
    Ok(ok(slabs
        .into_iter()
        .map(|sh| SlabHealthResponse {
            slab: sh.slab,
            health: sh.health,
        })
        .collect()))
}

async fn refresh_health(State(state): State<Arc<ServerState>>) -> ApiResult<usize> {
    Ok(ok(state.store.refresh_health(AUTOPILOT_CONTRACT_SET)?))
}

// === slab buffers (packed uploads) ===

#[derive(Deserialize)]
struct FetchPackedRequest {
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Serialize)]
struct PackedSlabResponse {
    key: String,
    min_shards: u8,
    total_shards: u8,
    data: String,
}

async fn fetch_packed_slabs(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<FetchPackedRequest>,
) -> ApiResult<Vec<PackedSlabResponse>> {
    let claimed = state.ongoing_uploads.lock().expect("uploads poisoned");
    let packed = state.store.packed_slabs_for_upload(req.limit)?;
    Ok(ok(packed
        .into_iter()
        .filter(|p| !claimed.contains(&p.key.to_string()))
        .map(|p| PackedSlabResponse {
            key: p.key.to_string(),
            min_shards: p.min_shards,
            total_shards: p.total_shards,
            data: hex::encode(&p.data),
        })
        .collect()))
}

#[derive(Deserialize)]
struct PackedDoneRequest {
    key: String,
    shards: Vec<rentio_core::Sector>,
    used_contracts: HashMap<PublicKey, rentio_core::FileContractId>,
}

async fn packed_slab_done(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<PackedDoneRequest>,
) -> ApiResult<()> {
    let key: EncryptionKey = req.key.parse()?;
    state
        .store
        .mark_packed_slab_uploaded(&key, &req.shards, &req.used_contracts)?;
    state
        .ongoing_uploads
        .lock()
        .expect("uploads poisoned")
        .remove(&req.key);
    Ok(ok(()))
}

// === upload tracking ===

async fn track_upload(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state
        .ongoing_uploads
        .lock()
        .expect("uploads poisoned")
        .insert(id);
    Ok(ok(()))
}

#[derive(Deserialize)]
struct TrackSectorRequest {
    root: rentio_core::Hash256,
}

async fn track_upload_sector(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(req): Json<TrackSectorRequest>,
) -> ApiResult<()> {
    let uploads = state.ongoing_uploads.lock().expect("uploads poisoned");
    if !uploads.contains(&id) {
        return Err(RentError::NotFound(format!("upload '{id}'")).into());
    }
    tracing::debug!("upload {} landed sector {}", id, req.root);
    Ok(ok(()))
}

async fn finish_upload(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state
        .ongoing_uploads
        .lock()
        .expect("uploads poisoned")
        .remove(&id);
    Ok(ok(()))
}

// === multipart ===

#[derive(Deserialize)]
struct CreateMultipartRequest {
    #[serde(default = "default_bucket")]
    bucket: String,
    path: String,
}

#[derive(Serialize)]
struct CreateMultipartResponse {
    upload_id: String,
}

async fn create_multipart(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateMultipartRequest>,
) -> ApiResult<CreateMultipartResponse> {
    let key = EncryptionKey::generate();
    let upload_id = state
        .store
        .create_multipart_upload(&req.bucket, &req.path, &key)?;
    Ok(ok(CreateMultipartResponse { upload_id }))
}

#[derive(Deserialize)]
struct AddPartRequest {
    #[serde(default = "default_bucket")]
    bucket: String,
    path: String,
    upload_id: String,
    part_number: i64,
    etag: String,
    slices: Vec<SlabSlice>,
    used_contracts: HashMap<PublicKey, rentio_core::FileContractId>,
}

async fn add_multipart_part(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<AddPartRequest>,
) -> ApiResult<()> {
    state.store.add_multipart_part(
        &req.bucket,
        &req.path,
        &req.upload_id,
        req.part_number,
        &req.etag,
        &req.slices,
        &req.used_contracts,
    )?;
    Ok(ok(()))
}

#[derive(Deserialize)]
struct CompleteMultipartRequest {
    #[serde(default = "default_bucket")]
    bucket: String,
    path: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

#[derive(Serialize)]
struct CompleteMultipartResponse {
    etag: String,
}

async fn complete_multipart(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CompleteMultipartRequest>,
) -> ApiResult<CompleteMultipartResponse> {
    let etag = state
        .store
        .complete_multipart_upload(&req.bucket, &req.path, &req.upload_id, &req.parts)?;
    Ok(ok(CompleteMultipartResponse { etag }))
}

#[derive(Deserialize)]
struct AbortMultipartRequest {
    #[serde(default = "default_bucket")]
    bucket: String,
    path: String,
    upload_id: String,
}

async fn abort_multipart(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<AbortMultipartRequest>,
) -> ApiResult<()> {
    state
        .store
        .abort_multipart_upload(&req.bucket, &req.path, &req.upload_id)?;
    Ok(ok(()))
}

async fn list_multipart_parts(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<rentio_core::MultipartPart>> {
    Ok(ok(state.store.multipart_parts(&id)?))
}

// === hosts ===

#[derive(Deserialize)]
struct SearchHostsRequest {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    address_contains: String,
    #[serde(default)]
    key_in: Vec<PublicKey>,
}

async fn search_hosts(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<SearchHostsRequest>,
) -> ApiResult<Vec<rentio_core::HostInfo>> {
    Ok(ok(state.store.search_hosts(
        &req.address_contains,
        &req.key_in,
        req.offset,
        req.limit,
    )?))
}

#[derive(Deserialize)]
struct HostScansRequest {
    scans: Vec<HostScan>,
}

async fn record_host_scans(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<HostScansRequest>,
) -> ApiResult<()> {
    state.store.record_host_scans(&req.scans)?;
    Ok(ok(()))
}

#[derive(Deserialize)]
struct PriceTablesRequest {
    price_table_updates: Vec<PriceTableUpdate>,
}

async fn record_price_tables(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<PriceTablesRequest>,
) -> ApiResult<()> {
    state
        .store
        .record_price_table_updates(&req.price_table_updates)?;
    Ok(ok(()))
}

#[derive(Deserialize)]
struct UpdateAllowlistRequest {
    #[serde(default)]
    add: Vec<PublicKey>,
    #[serde(default)]
    remove: Vec<PublicKey>,
    #[serde(default)]
    clear: bool,
}

async fn update_allowlist(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<UpdateAllowlistRequest>,
) -> ApiResult<()> {
    state
        .store
        .update_allowlist(&req.add, &req.remove, req.clear)?;
    Ok(ok(()))
}

async fn get_allowlist(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<PublicKey>> {
    Ok(ok(state.store.allowlist()?))
}

#[derive(Deserialize)]
struct UpdateBlocklistRequest {
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    remove: Vec<String>,
    #[serde(default)]
    clear: bool,
}

async fn update_blocklist(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<UpdateBlocklistRequest>,
) -> ApiResult<()> {
    state
        .store
        .update_blocklist(&req.add, &req.remove, req.clear)?;
    Ok(ok(()))
}

async fn get_blocklist(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<String>> {
    Ok(ok(state.store.blocklist()?))
}

#[derive(Deserialize)]
struct RemoveHostsRequest {
    min_recent_scan_failures: u64,
    max_downtime_hours: u64,
}

async fn remove_hosts(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<RemoveHostsRequest>,
) -> ApiResult<usize> {
    Ok(ok(state.store.remove_offline_hosts(
        req.min_recent_scan_failures,
        Duration::from_secs(req.max_downtime_hours * 3600),
    )?))
}

// === autopilot ===

#[derive(Serialize)]
struct AutopilotStateResponse {
    state: AutopilotState,
    enabled: bool,
    migrating: bool,
    scanning: bool,
    pruning: bool,
    /// RFC 3339 timestamp of when the loop started, if it has.
    start_time: Option<String>,
}

async fn autopilot_state(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<AutopilotStateResponse> {
    let ap = &state.autopilot;
    Ok(ok(AutopilotStateResponse {
        state: ap.state(),
        enabled: ap.config().enabled,
        migrating: ap.migrator.status().0,
        scanning: ap.scanner.status().0,
        pruning: ap.pruner.status().0,
        start_time: ap.start_time().map(|t| t.to_rfc3339()),
    }))
}

#[derive(Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    force_scan: bool,
}

#[derive(Serialize)]
struct TriggerResponse {
    triggered: bool,
}

async fn autopilot_trigger(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<TriggerResponse> {
    Ok(ok(TriggerResponse {
        triggered: state.autopilot.trigger(req.force_scan),
    }))
}

#[derive(Deserialize)]
struct EvaluateConfigRequest {
    config: AutopilotConfig,
    #[serde(default)]
    gouging: Option<GougingSettings>,
}

#[derive(Serialize)]
struct EvaluateConfigResponse {
    hosts: usize,
    usable: usize,
    unusable: HashMap<UnusableReason, usize>,
}

/// Dry-run a candidate config against the current host universe.
async fn evaluate_config(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<EvaluateConfigRequest>,
) -> ApiResult<EvaluateConfigResponse> {
    req.config.validate()?;
    let gouging = req.gouging.unwrap_or_else(|| state.config.gouging.clone());
    let height = state
        .chain
        .consensus_state()
        .await
        .map(|cs| cs.block_height)
        .unwrap_or(0);
    let checker = GougingChecker::new(gouging.clone(), height);

    let hosts = state.store.hosts(0, usize::MAX)?;
    let mut usable = 0usize;
    let mut unusable: HashMap<UnusableReason, usize> = HashMap::new();
    for host in &hosts {
        let reasons = host_usability(host, &req.config, &gouging, &checker);
        if reasons.is_empty() {
            usable += 1;
        } else {
            for reason in reasons {
                *unusable.entry(reason).or_default() += 1;
            }
        }
    }
    Ok(ok(EvaluateConfigResponse {
        hosts: hosts.len(),
        usable,
        unusable,
    }))
}

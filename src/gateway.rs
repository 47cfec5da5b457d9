//! Gateway facade: the operations exposed to downstream callers
//!
//! A [`Gateway`] ties the registry, cache, invoker and batch executor
//! together. It is cheap to clone; clones share all state.

use crate::batch::{
    BatchExecutor, BatchJob, BatchOptions, BatchProgress, ChunkOperation, ChunkSink, CollectSink,
};
use crate::cache::{CachePolicy, CacheStats, Fingerprint, ResultCache};
use crate::config::{EnvSource, GatewayConfig, InstanceConfig};
use crate::error::{GatewayError, Result};
use crate::export::{ExportFormat, ExportRequest, ExportSummary, ExportWriter};
use crate::invoker::RemoteInvoker;
use crate::metrics::{CallMetrics, OperationSummary};
use crate::protocol::{JsonRpcTransport, RemoteCall, RpcArgs, RpcTransport};
use crate::registry::{InstanceInfo, InstanceRegistry};
use crate::session::{SessionHandle, SessionLimits};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Inner {
    config: GatewayConfig,
    registry: Arc<InstanceRegistry>,
    cache: Arc<ResultCache>,
    invoker: RemoteInvoker,
    executor: BatchExecutor,
    metrics: Arc<CallMetrics>,
}

/// Entry point for all gateway operations
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Build a gateway over `transport`, reading fallback instances from the
    /// process environment
    pub fn new(config: GatewayConfig, transport: Arc<dyn RpcTransport>) -> Result<Self> {
        Self::with_env(config, transport, EnvSource::Process)
    }

    /// Build a gateway with the JSON-RPC transport
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        Self::new(config, Arc::new(JsonRpcTransport::new()))
    }

    /// Build a gateway with an explicit environment source
    pub fn with_env(
        config: GatewayConfig,
        transport: Arc<dyn RpcTransport>,
        env: EnvSource,
    ) -> Result<Self> {
        let call_policy = config.retry.to_policy()?;
        let chunk_policy = config.batch.chunk_policy()?;
        let limits = SessionLimits {
            idle: Duration::from_secs(config.session.idle_validate_secs),
            max_age: Duration::from_secs(config.session.max_age_secs),
        };

        let registry = Arc::new(InstanceRegistry::new(
            Arc::clone(&transport),
            config.default_instance.clone(),
            env,
            call_policy.clone(),
            limits,
        ));
        let cache = Arc::new(ResultCache::new(
            config.cache.cacheable_methods.iter().cloned(),
        ));
        for instance in config.instance_configs() {
            cache.set_policy(&instance.name, CachePolicy::from_config(&instance));
            registry.register(instance)?;
        }

        let metrics = Arc::new(CallMetrics::new());
        let invoker = RemoteInvoker::new(
            Arc::clone(&registry),
            transport,
            call_policy,
            Arc::clone(&metrics),
        )
        .with_slow_call_threshold(Duration::from_millis(config.logging.slow_call_ms));
        let executor = BatchExecutor::new(chunk_policy, config.batch.workers);

        info!(
            "Gateway ready: {} configured instance(s), default '{}'",
            config.instances.len(),
            config.default_instance
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                cache,
                invoker,
                executor,
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    // ------------------------------------------------------------------
    // Sessions and instance selection
    // ------------------------------------------------------------------

    /// Session for `instance`, or the current instance
    pub async fn resolve_instance(&self, instance: Option<&str>) -> Result<SessionHandle> {
        let session = self.inner.registry.resolve(instance).await?;
        self.inner
            .cache
            .ensure_policy(session.instance(), CachePolicy::from_config(session.config()));
        Ok(session)
    }

    pub fn current_instance(&self) -> String {
        self.inner.registry.current()
    }

    /// Make `name` the current instance; returns the previous one
    pub fn switch_instance(&self, name: &str) -> Result<String> {
        self.inner.registry.switch(name)
    }

    /// Run `f` with `name` as the current instance, restoring the previous
    /// selection afterwards whatever `f` returns
    pub async fn with_instance<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Gateway) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let gateway = self.clone();
        self.inner
            .registry
            .with_instance(name, move || f(gateway))
            .await
    }

    /// Add or replace an instance definition
    ///
    /// Replacing drops the instance's session and cached results.
    pub fn register_instance(&self, config: InstanceConfig) -> Result<()> {
        let name = config.name.clone();
        let policy = CachePolicy::from_config(&config);
        self.inner.registry.register(config)?;
        self.inner.cache.set_policy(&name, policy);
        self.inner.cache.invalidate_instance(&name);
        Ok(())
    }

    pub fn unregister_instance(&self, name: &str) -> Result<()> {
        self.inner.registry.unregister(name)?;
        self.inner.cache.invalidate_instance(name);
        Ok(())
    }

    pub fn list_instances(&self) -> Vec<String> {
        self.inner.registry.list_instances()
    }

    pub async fn instance_info(&self, instance: Option<&str>) -> Result<InstanceInfo> {
        self.inner.registry.instance_info(instance).await
    }

    pub async fn disconnect(&self, instance: &str) -> bool {
        self.inner.registry.disconnect(instance).await
    }

    pub async fn disconnect_all(&self) {
        self.inner.registry.disconnect_all().await
    }

    // ------------------------------------------------------------------
    // Single calls
    // ------------------------------------------------------------------

    /// Cache-aware read
    ///
    /// Methods outside the cacheable set go straight to the endpoint.
    /// `cache_ttl` overrides the instance's default TTL for this entry.
    pub async fn read(
        &self,
        instance: Option<&str>,
        call: RemoteCall,
        cache_ttl: Option<Duration>,
    ) -> Result<Value> {
        let session = self.resolve_instance(instance).await?;
        if !self.inner.cache.is_cacheable(&call.method) {
            return self.inner.invoker.call(&session, &call).await;
        }

        let key = Fingerprint::of(session.instance(), &call);
        if let Some(value) = self.inner.cache.get(&key) {
            return Ok(value);
        }

        // a write finishing while this call is in flight must not be shadowed
        let epoch = self.inner.cache.epoch();
        let value = self.inner.invoker.call(&session, &call).await?;
        self.inner
            .cache
            .put_since(key, value.clone(), cache_ttl, epoch);
        Ok(value)
    }

    /// Uncached call that invalidates the model's cached reads
    ///
    /// The invalidation happens whether or not the call succeeded, since a
    /// failed call may still have been applied remotely.
    pub async fn write(&self, instance: Option<&str>, call: RemoteCall) -> Result<Value> {
        let session = self.resolve_instance(instance).await?;
        let result = self.inner.invoker.call(&session, &call).await;
        self.inner
            .cache
            .invalidate_matching(session.instance(), &call.model);
        result
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Run `operation` over `items` in chunks
    ///
    /// Configuration and authentication failures of the instance surface
    /// before any chunk runs; chunk failures are reported in the job.
    pub async fn run_batch(
        &self,
        instance: Option<&str>,
        items: Vec<Value>,
        operation: BatchOperation,
        request: BatchRequest,
        sink: Option<&mut dyn ChunkSink>,
    ) -> Result<BatchJob> {
        let session = self.resolve_instance(instance).await?;
        let instance = session.instance().to_string();
        let invalidates = operation.invalidates_cache(&self.inner.cache);
        let model = operation.model().to_string();

        info!(
            "Batch {} on {}: {} items",
            operation.describe(),
            instance,
            items.len()
        );

        let options = self.batch_options(request);
        let chunk_op = Arc::new(GatewayChunk {
            gateway: self.clone(),
            instance: instance.clone(),
            operation,
        });
        let job = self
            .inner
            .executor
            .run(items, chunk_op, options, sink)
            .await;

        if invalidates {
            self.inner.cache.invalidate_matching(&instance, &model);
        }
        Ok(job)
    }

    /// Read every record matching `query` in pages of `page_size`
    ///
    /// Pages run through the batch executor in strict order, so `records`
    /// keeps the endpoint's ordering. `query.offset` and `query.limit` are
    /// ignored.
    pub async fn paged_search_read(
        &self,
        instance: Option<&str>,
        model: &str,
        query: SearchQuery,
        page_size: usize,
        request: BatchRequest,
    ) -> Result<PagedRead> {
        let mut sink = CollectSink::new();
        let (total, job) = self
            .read_pages(instance, model, query, page_size, None, request, &mut sink)
            .await?;

        let mut records = Vec::with_capacity(total);
        for payload in sink.into_payloads() {
            if let Value::Array(page) = payload {
                records.extend(page);
            }
        }
        Ok(PagedRead {
            total,
            records,
            job,
        })
    }

    /// Stream every record matching `query` to `out` as CSV or JSON
    ///
    /// CSV needs `query.fields`; its header row uses the field labels from
    /// `fields_get`, falling back to the technical names.
    pub async fn export<W: Write + Send>(
        &self,
        instance: Option<&str>,
        model: &str,
        query: SearchQuery,
        request: ExportRequest,
        out: W,
    ) -> Result<ExportSummary> {
        let session = self.resolve_instance(instance).await?;
        let instance = session.instance().to_string();

        let mut writer = match request.format {
            ExportFormat::Csv => {
                if query.fields.is_empty() {
                    return Err(GatewayError::config(
                        "CSV export needs an explicit field list",
                    ));
                }
                let headers = self.field_labels(&instance, model, &query.fields).await?;
                ExportWriter::csv(out, query.fields.clone(), &headers)?
            }
            ExportFormat::Json => ExportWriter::json(out)?,
        };

        let (total, job) = self
            .read_pages(
                Some(instance.as_str()),
                model,
                query,
                request.page_size,
                request.max_records,
                request.batch,
                &mut writer,
            )
            .await?;
        let exported = writer.finish()?;

        info!(
            "Exported {} of {} {} records from '{}' as {}",
            exported, total, model, instance, request.format
        );
        Ok(ExportSummary {
            model: model.to_string(),
            format: request.format,
            total,
            exported,
            job,
        })
    }

    /// [`export`](Self::export) into a file, creating parent directories
    pub async fn export_to_path(
        &self,
        instance: Option<&str>,
        model: &str,
        query: SearchQuery,
        request: ExportRequest,
        path: &Path,
    ) -> Result<ExportSummary> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.export(instance, model, query, request, BufWriter::new(file))
            .await
    }

    /// Column headers for `fields`: labels when the model describes them
    async fn field_labels(
        &self,
        instance: &str,
        model: &str,
        fields: &[String],
    ) -> Result<Vec<String>> {
        let definitions = self
            .fields_get(Some(instance), model, Some(vec!["string".to_string()]))
            .await?;
        Ok(fields
            .iter()
            .map(|field| {
                definitions
                    .get(field)
                    .and_then(|d| d.get("string"))
                    .and_then(Value::as_str)
                    .unwrap_or(field)
                    .to_string()
            })
            .collect())
    }

    /// `search_count`, then `search_read` pages by offset in strict order
    ///
    /// Returns the number of records selected and the paging job.
    #[allow(clippy::too_many_arguments)]
    async fn read_pages(
        &self,
        instance: Option<&str>,
        model: &str,
        query: SearchQuery,
        page_size: usize,
        max_records: Option<usize>,
        request: BatchRequest,
        sink: &mut dyn ChunkSink,
    ) -> Result<(usize, BatchJob)> {
        let session = self.resolve_instance(instance).await?;
        let instance = session.instance().to_string();
        let page_size = page_size.max(1);

        let count = self
            .search_count(Some(instance.as_str()), model, query.domain.clone())
            .await? as usize;
        let total = max_records.map_or(count, |max| count.min(max));
        let offsets: Vec<Value> = (0..total).step_by(page_size).map(|o| json!(o)).collect();
        debug!(
            "Paged read of {} on {}: {} records in {} pages",
            model,
            instance,
            total,
            offsets.len()
        );

        let mut options = self.batch_options(request);
        options.chunk_size = 1;
        options.ordered = true;

        let page_op = Arc::new(PageRead {
            gateway: self.clone(),
            instance,
            model: model.to_string(),
            query,
            page_size,
            total,
        });
        let job = self
            .inner
            .executor
            .run(offsets, page_op, options, Some(sink))
            .await;
        Ok((total, job))
    }

    fn batch_options(&self, request: BatchRequest) -> BatchOptions {
        let defaults = &self.inner.config.batch;
        BatchOptions {
            chunk_size: request.chunk_size.unwrap_or(defaults.chunk_size),
            workers: request.workers.unwrap_or(defaults.workers),
            ordered: request.ordered.unwrap_or(defaults.ordered),
            cancel: request.cancel,
            progress: request.progress,
        }
    }

    // ------------------------------------------------------------------
    // Convenience wrappers
    // ------------------------------------------------------------------

    /// Field definitions of `model`
    pub async fn fields_get(
        &self,
        instance: Option<&str>,
        model: &str,
        attributes: Option<Vec<String>>,
    ) -> Result<Value> {
        let mut args = RpcArgs::new();
        if let Some(attributes) = attributes {
            args = args.kwarg("attributes", attributes);
        }
        self.read(instance, RemoteCall::new(model, "fields_get", args), None)
            .await
    }

    /// Installed non-transient models, optionally filtered by name
    pub async fn list_models(&self, instance: Option<&str>, filter: Option<&str>) -> Result<Value> {
        let mut domain = vec![json!(["transient", "=", false])];
        if let Some(filter) = filter {
            domain.push(json!(["model", "ilike", filter]));
        }
        let query = SearchQuery::new(Value::Array(domain))
            .fields(["model", "name"])
            .order("model");
        self.search_read(instance, "ir.model", query).await
    }

    pub async fn search_read(
        &self,
        instance: Option<&str>,
        model: &str,
        query: SearchQuery,
    ) -> Result<Value> {
        self.read(instance, RemoteCall::new(model, "search_read", query.to_args()), None)
            .await
    }

    pub async fn search_count(
        &self,
        instance: Option<&str>,
        model: &str,
        domain: Value,
    ) -> Result<u64> {
        let value = self
            .read(
                instance,
                RemoteCall::new(model, "search_count", RpcArgs::new().arg(domain)),
                None,
            )
            .await?;
        value.as_u64().ok_or_else(|| {
            GatewayError::Internal(format!("search_count returned a non-integer: {}", value))
        })
    }

    pub async fn read_records(
        &self,
        instance: Option<&str>,
        model: &str,
        ids: Vec<i64>,
        fields: Vec<String>,
    ) -> Result<Value> {
        let mut args = RpcArgs::new().arg(ids);
        if !fields.is_empty() {
            args = args.kwarg("fields", fields);
        }
        self.read(instance, RemoteCall::new(model, "read", args), None)
            .await
    }

    /// Create one record, or several when `values` is an array
    pub async fn create(&self, instance: Option<&str>, model: &str, values: Value) -> Result<Value> {
        self.write(
            instance,
            RemoteCall::new(model, "create", RpcArgs::new().arg(values)),
        )
        .await
    }

    pub async fn update(
        &self,
        instance: Option<&str>,
        model: &str,
        ids: Vec<i64>,
        values: Map<String, Value>,
    ) -> Result<Value> {
        self.write(
            instance,
            RemoteCall::new(model, "write", RpcArgs::new().arg(ids).arg(values)),
        )
        .await
    }

    pub async fn delete(&self, instance: Option<&str>, model: &str, ids: Vec<i64>) -> Result<Value> {
        self.write(
            instance,
            RemoteCall::new(model, "unlink", RpcArgs::new().arg(ids)),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    pub fn metrics_summary(&self) -> Vec<OperationSummary> {
        self.inner.metrics.summary()
    }

    /// Operations whose average call time exceeds `threshold`, slowest first
    pub fn slow_operations(&self, threshold: Duration) -> Vec<OperationSummary> {
        self.inner.metrics.slow_operations(threshold)
    }

    /// Drop cached results of one instance, or of all instances
    pub fn clear_cache(&self, instance: Option<&str>) -> usize {
        match instance {
            Some(instance) => self.inner.cache.invalidate_instance(instance),
            None => self.inner.cache.clear(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Start the background cache sweep, if configured
    pub fn spawn_cache_sweeper(&self) -> Option<JoinHandle<()>> {
        match self.inner.config.cache.sweep_interval_secs {
            0 => None,
            secs => Some(self.inner.cache.spawn_sweeper(Duration::from_secs(secs))),
        }
    }
}

/// Bulk operation applied chunk by chunk
///
/// Items are record ids, except for `Create` where each item is the values
/// of one new record.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Read { model: String, fields: Vec<String> },
    Write { model: String, values: Map<String, Value> },
    Unlink { model: String },
    Create { model: String },
    /// `model.method(chunk, **kwargs)`
    Method {
        model: String,
        method: String,
        kwargs: Map<String, Value>,
    },
}

impl BatchOperation {
    pub fn model(&self) -> &str {
        match self {
            BatchOperation::Read { model, .. }
            | BatchOperation::Write { model, .. }
            | BatchOperation::Unlink { model }
            | BatchOperation::Create { model }
            | BatchOperation::Method { model, .. } => model,
        }
    }

    fn method(&self) -> &str {
        match self {
            BatchOperation::Read { .. } => "read",
            BatchOperation::Write { .. } => "write",
            BatchOperation::Unlink { .. } => "unlink",
            BatchOperation::Create { .. } => "create",
            BatchOperation::Method { method, .. } => method,
        }
    }

    fn describe(&self) -> String {
        format!("{}.{}", self.model(), self.method())
    }

    /// Write-type operations invalidate the model's cache when the job ends
    fn invalidates_cache(&self, cache: &ResultCache) -> bool {
        match self {
            BatchOperation::Read { .. } => false,
            BatchOperation::Method { method, .. } => !cache.is_cacheable(method),
            _ => true,
        }
    }

    fn to_call(&self, items: &[Value]) -> RemoteCall {
        let chunk = Value::Array(items.to_vec());
        let args = match self {
            BatchOperation::Read { fields, .. } => {
                let args = RpcArgs::new().arg(chunk);
                if fields.is_empty() {
                    args
                } else {
                    args.kwarg("fields", fields.clone())
                }
            }
            BatchOperation::Write { values, .. } => {
                RpcArgs::new().arg(chunk).arg(Value::Object(values.clone()))
            }
            BatchOperation::Unlink { .. } | BatchOperation::Create { .. } => {
                RpcArgs::new().arg(chunk)
            }
            BatchOperation::Method { kwargs, .. } => RpcArgs {
                args: vec![chunk],
                kwargs: kwargs.clone(),
            },
        };
        RemoteCall::new(self.model(), self.method(), args)
    }
}

/// Per-request batch overrides; unset fields use the configured defaults
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub chunk_size: Option<usize>,
    pub workers: Option<usize>,
    pub ordered: Option<bool>,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<watch::Sender<BatchProgress>>,
}

impl BatchRequest {
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn progress(mut self, sender: watch::Sender<BatchProgress>) -> Self {
        self.progress = Some(sender);
        self
    }
}

/// Arguments of a `search_read`
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub domain: Value,
    pub fields: Vec<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub order: Option<String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self::new(json!([]))
    }
}

impl SearchQuery {
    pub fn new(domain: Value) -> Self {
        Self {
            domain,
            fields: Vec::new(),
            offset: None,
            limit: None,
            order: None,
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn to_args(&self) -> RpcArgs {
        let mut args = RpcArgs::new().arg(self.domain.clone());
        if !self.fields.is_empty() {
            args = args.kwarg("fields", self.fields.clone());
        }
        if let Some(offset) = self.offset {
            args = args.kwarg("offset", offset);
        }
        if let Some(limit) = self.limit {
            args = args.kwarg("limit", limit);
        }
        if let Some(order) = &self.order {
            args = args.kwarg("order", order.clone());
        }
        args
    }
}

/// Result of [`Gateway::paged_search_read`]
#[derive(Debug, Clone)]
pub struct PagedRead {
    /// Record count reported before paging started
    pub total: usize,
    pub records: Vec<Value>,
    pub job: BatchJob,
}

struct GatewayChunk {
    gateway: Gateway,
    instance: String,
    operation: BatchOperation,
}

#[async_trait]
impl ChunkOperation for GatewayChunk {
    async fn execute(&self, _index: usize, items: &[Value]) -> Result<Value> {
        let session = self.gateway.resolve_instance(Some(self.instance.as_str())).await?;
        let call = self.operation.to_call(items);
        self.gateway.inner.invoker.call(&session, &call).await
    }
}

struct PageRead {
    gateway: Gateway,
    instance: String,
    model: String,
    query: SearchQuery,
    page_size: usize,
    /// Records to read in all; the last page stops here
    total: usize,
}

#[async_trait]
impl ChunkOperation for PageRead {
    async fn execute(&self, _index: usize, items: &[Value]) -> Result<Value> {
        let offset = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| GatewayError::Internal("page item is not an offset".to_string()))?;
        let offset = offset as usize;
        let query = SearchQuery {
            offset: Some(offset),
            limit: Some(self.page_size.min(self.total.saturating_sub(offset))),
            ..self.query.clone()
        };
        let session = self.gateway.resolve_instance(Some(self.instance.as_str())).await?;
        let call = RemoteCall::new(self.model.as_str(), "search_read", query.to_args());
        self.gateway.inner.invoker.call(&session, &call).await
    }
}

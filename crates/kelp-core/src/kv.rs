//! Key-value request framing: key encoding, collection prefixing,
//! partition binding.
//!
//! The binary data plane addresses documents by a key of at most 250
//! bytes, including the per-channel collection prefix when the channel
//! negotiated collections. Requests are bound to their partition by the
//! KV locator immediately before dispatch.

use crate::error::{CancellationReason, KelpError};
use crate::request::{KelpRequest, RequestCommon, RequestLifecycle};
use crate::retry::RetryStrategy;
use bytes::{BufMut, Bytes, BytesMut};
use kelp_config::ServiceType;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Maximum length of an encoded key in bytes, collection prefix included.
pub const MAX_KEY_BYTES: usize = 250;

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// Wraps user data so log sinks can strip or hash it.
fn redact_user(value: &str) -> String {
    format!("<ud>{}</ud>", value)
}

/// Addresses a collection: bucket plus optional scope and collection.
/// Absent scope/collection mean the defaults.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionIdentifier {
    bucket: String,
    scope: Option<String>,
    collection: Option<String>,
}

impl CollectionIdentifier {
    pub fn new(
        bucket: impl Into<String>,
        scope: Option<String>,
        collection: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope,
            collection,
        }
    }

    /// The default collection in the default scope of the given bucket.
    pub fn default_for_bucket(bucket: impl Into<String>) -> Self {
        Self::new(bucket, None, None)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    pub fn collection(&self) -> &str {
        self.collection.as_deref().unwrap_or(DEFAULT_COLLECTION)
    }

    /// Whether this addresses the default collection in the default scope.
    pub fn is_default(&self) -> bool {
        self.scope() == DEFAULT_SCOPE && self.collection() == DEFAULT_COLLECTION
    }
}

impl fmt::Display for CollectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.bucket, self.scope(), self.collection())
    }
}

/// What the negotiated KV channel knows: whether collections are enabled
/// and the per-channel numeric prefix for each collection.
#[derive(Clone, Debug, Default)]
pub struct KeyValueChannelContext {
    collections_enabled: bool,
    collection_map: HashMap<CollectionIdentifier, Bytes>,
}

impl KeyValueChannelContext {
    pub fn new(
        collections_enabled: bool,
        collection_map: HashMap<CollectionIdentifier, Bytes>,
    ) -> Self {
        Self {
            collections_enabled,
            collection_map,
        }
    }

    pub fn collections_enabled(&self) -> bool {
        self.collections_enabled
    }

    pub fn collection_prefix(&self, identifier: &CollectionIdentifier) -> Option<&Bytes> {
        self.collection_map.get(identifier)
    }
}

/// Durability requirement carried by mutation requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistActive,
    PersistToMajority,
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DurabilityLevel::Majority => "majority",
            DurabilityLevel::MajorityAndPersistActive => "majority_and_persist_active",
            DurabilityLevel::PersistToMajority => "persist_to_majority",
        };
        f.write_str(s)
    }
}

/// The KV-specific surface the locator and channel framing need.
pub trait KvRequest: KelpRequest {
    fn key(&self) -> &[u8];
    fn collection_identifier(&self) -> &CollectionIdentifier;

    /// The bound partition. Zero until the locator stamped it.
    fn partition(&self) -> u16;

    /// Stamped by the KV locator immediately before dispatch.
    fn set_partition(&self, partition: u16);

    /// The wire correlator.
    fn opaque(&self) -> u32;

    fn durability_level(&self) -> Option<DurabilityLevel> {
        None
    }

    /// Frames the key for the given channel, collection prefix included
    /// where negotiated.
    fn encoded_key_with_collection(
        &self,
        ctx: &KeyValueChannelContext,
    ) -> Result<Bytes, KelpError> {
        encode_key_with_collection(self.key(), self.collection_identifier(), ctx)
    }
}

/// UTF-8 encodes a key; null-ish input becomes the empty key.
pub fn encode_key(key: Option<&str>) -> Bytes {
    match key {
        None | Some("") => Bytes::new(),
        Some(k) => Bytes::copy_from_slice(k.as_bytes()),
    }
}

fn check_key_length(
    total: usize,
    key: &[u8],
    identifier: &CollectionIdentifier,
) -> Result<(), KelpError> {
    if total > MAX_KEY_BYTES {
        return Err(KelpError::InvalidArgument(format!(
            "The key must not be longer than {} bytes (was {} bytes including the collection prefix; id: {}, collection: {})",
            MAX_KEY_BYTES,
            total,
            redact_user(&String::from_utf8_lossy(key)),
            identifier,
        )));
    }
    Ok(())
}

/// Frames `key` for the channel described by `ctx`.
///
/// With collections negotiated the per-channel numeric prefix is
/// prepended; without them only the default collection is addressable.
pub fn encode_key_with_collection(
    key: &[u8],
    identifier: &CollectionIdentifier,
    ctx: &KeyValueChannelContext,
) -> Result<Bytes, KelpError> {
    if ctx.collections_enabled() {
        let prefix = ctx
            .collection_prefix(identifier)
            .ok_or_else(|| KelpError::CollectionNotFound(identifier.collection().to_string()))?;

        let total = prefix.len() + key.len();
        check_key_length(total, key, identifier)?;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(prefix);
        buf.put_slice(key);
        Ok(buf.freeze())
    } else if identifier.is_default() {
        check_key_length(key.len(), key, identifier)?;
        Ok(Bytes::copy_from_slice(key))
    } else {
        Err(KelpError::FeatureNotAvailable(
            "Collections are not supported (or enabled) on the cluster".to_string(),
        ))
    }
}

/// Shared base of every KV request: the request common plus encoded key,
/// collection identifier and the locator-stamped partition.
pub struct KvRequestCommon<R> {
    common: RequestCommon<R>,
    key: Bytes,
    collection: CollectionIdentifier,
    partition: AtomicU16,
}

impl<R> KvRequestCommon<R> {
    pub fn new(
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
        key: &str,
        collection: CollectionIdentifier,
        span: Option<String>,
    ) -> (Self, oneshot::Receiver<Result<R, KelpError>>) {
        let (common, rx) = RequestCommon::with_span(timeout, retry, span);
        (
            Self {
                common,
                key: encode_key(Some(key)),
                collection,
                partition: AtomicU16::new(0),
            },
            rx,
        )
    }

    pub fn common(&self) -> &RequestCommon<R> {
        &self.common
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn collection_identifier(&self) -> &CollectionIdentifier {
        &self.collection
    }

    pub fn partition(&self) -> u16 {
        self.partition.load(Ordering::Acquire)
    }

    pub fn set_partition(&self, partition: u16) {
        self.partition.store(partition, Ordering::Release);
    }

    /// The context map reported in errors and log envelopes.
    pub fn service_context(
        &self,
        durability: Option<DurabilityLevel>,
    ) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert("type".to_string(), ServiceType::KeyValue.ident().to_string());
        ctx.insert("opaque".to_string(), self.common.lifecycle().operation_id());
        ctx.insert("bucket".to_string(), self.collection.bucket().to_string());
        ctx.insert("scope".to_string(), self.collection.scope().to_string());
        ctx.insert(
            "collection".to_string(),
            self.collection.collection().to_string(),
        );
        if !self.key.is_empty() {
            ctx.insert(
                "documentId".to_string(),
                redact_user(&String::from_utf8_lossy(&self.key)),
            );
        }
        if let Some(level) = durability {
            ctx.insert("syncDurability".to_string(), level.to_string());
        }
        ctx
    }
}

/// Fetches a document by key.
pub struct GetRequest {
    base: KvRequestCommon<GetResponse>,
}

#[derive(Debug)]
pub struct GetResponse {
    pub content: Bytes,
    pub flags: u32,
    pub cas: u64,
}

impl GetRequest {
    pub fn new(
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
        key: &str,
        collection: CollectionIdentifier,
        span: Option<String>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<GetResponse, KelpError>>) {
        let (base, rx) = KvRequestCommon::new(timeout, retry, key, collection, span);
        (Arc::new(Self { base }), rx)
    }

    pub fn succeed(&self, response: GetResponse) {
        self.base.common().succeed(response);
    }
}

impl KelpRequest for GetRequest {
    fn lifecycle(&self) -> &RequestLifecycle {
        self.base.common().lifecycle()
    }
    fn service_type(&self) -> ServiceType {
        ServiceType::KeyValue
    }
    fn name(&self) -> &'static str {
        "get"
    }
    fn bucket(&self) -> Option<&str> {
        Some(self.base.collection_identifier().bucket())
    }
    fn cancel(&self, reason: CancellationReason) {
        self.base.common().cancel(reason, self.name().to_string());
    }
    fn fail(&self, error: KelpError) {
        self.base.common().fail(error);
    }
    fn as_kv(&self) -> Option<&dyn KvRequest> {
        Some(self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn service_context(&self) -> BTreeMap<String, String> {
        self.base.service_context(None)
    }
}

impl KvRequest for GetRequest {
    fn key(&self) -> &[u8] {
        self.base.key()
    }
    fn collection_identifier(&self) -> &CollectionIdentifier {
        self.base.collection_identifier()
    }
    fn partition(&self) -> u16 {
        self.base.partition()
    }
    fn set_partition(&self, partition: u16) {
        self.base.set_partition(partition);
    }
    fn opaque(&self) -> u32 {
        self.base.common().lifecycle().opaque()
    }
}

/// Stores a document, creating or replacing it.
pub struct UpsertRequest {
    base: KvRequestCommon<UpsertResponse>,
    content: Bytes,
    flags: u32,
    durability: Option<DurabilityLevel>,
}

#[derive(Debug)]
pub struct UpsertResponse {
    pub cas: u64,
}

impl UpsertRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
        key: &str,
        collection: CollectionIdentifier,
        content: Bytes,
        flags: u32,
        durability: Option<DurabilityLevel>,
        span: Option<String>,
    ) -> (
        Arc<Self>,
        oneshot::Receiver<Result<UpsertResponse, KelpError>>,
    ) {
        let (base, rx) = KvRequestCommon::new(timeout, retry, key, collection, span);
        (
            Arc::new(Self {
                base,
                content,
                flags,
                durability,
            }),
            rx,
        )
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn succeed(&self, response: UpsertResponse) {
        self.base.common().succeed(response);
    }
}

impl KelpRequest for UpsertRequest {
    fn lifecycle(&self) -> &RequestLifecycle {
        self.base.common().lifecycle()
    }
    fn service_type(&self) -> ServiceType {
        ServiceType::KeyValue
    }
    fn name(&self) -> &'static str {
        "upsert"
    }
    fn bucket(&self) -> Option<&str> {
        Some(self.base.collection_identifier().bucket())
    }
    fn cancel(&self, reason: CancellationReason) {
        self.base.common().cancel(reason, self.name().to_string());
    }
    fn fail(&self, error: KelpError) {
        self.base.common().fail(error);
    }
    fn as_kv(&self) -> Option<&dyn KvRequest> {
        Some(self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn service_context(&self) -> BTreeMap<String, String> {
        self.base.service_context(self.durability)
    }
}

impl KvRequest for UpsertRequest {
    fn key(&self) -> &[u8] {
        self.base.key()
    }
    fn collection_identifier(&self) -> &CollectionIdentifier {
        self.base.collection_identifier()
    }
    fn partition(&self) -> u16 {
        self.base.partition()
    }
    fn set_partition(&self, partition: u16) {
        self.base.set_partition(partition);
    }
    fn opaque(&self) -> u32 {
        self.base.common().lifecycle().opaque()
    }
    fn durability_level(&self) -> Option<DurabilityLevel> {
        self.durability
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FailFastRetryStrategy;

    fn default_collection() -> CollectionIdentifier {
        CollectionIdentifier::default_for_bucket("travel")
    }

    fn channel_without_collections() -> KeyValueChannelContext {
        KeyValueChannelContext::new(false, HashMap::new())
    }

    fn channel_with(prefix: &[u8], id: &CollectionIdentifier) -> KeyValueChannelContext {
        let mut map = HashMap::new();
        map.insert(id.clone(), Bytes::copy_from_slice(prefix));
        KeyValueChannelContext::new(true, map)
    }

    #[test]
    fn test_bare_key_on_default_collection() {
        let encoded = encode_key_with_collection(
            b"user:42",
            &default_collection(),
            &channel_without_collections(),
        )
        .unwrap();
        assert_eq!(&encoded[..], b"user:42");
        assert_eq!(encoded.len(), 7);
    }

    #[test]
    fn test_prefix_plus_key_over_limit_fails() {
        let id = default_collection();
        let ctx = channel_with(&[0u8; 7], &id);
        let key = "a".repeat(244);

        let err = encode_key_with_collection(key.as_bytes(), &id, &ctx).unwrap_err();
        match err {
            KelpError::InvalidArgument(msg) => {
                assert!(msg.contains("251"), "message should carry the length: {}", msg);
            }
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_prefix_is_prepended() {
        let id = CollectionIdentifier::new("travel", Some("inventory".into()), Some("hotels".into()));
        let ctx = channel_with(&[0x15], &id);

        let encoded = encode_key_with_collection(b"hotel-1", &id, &ctx).unwrap();
        assert_eq!(&encoded[..1], &[0x15]);
        assert_eq!(&encoded[1..], b"hotel-1");
    }

    #[test]
    fn test_unknown_collection_fails_with_name() {
        let id = CollectionIdentifier::new("travel", None, Some("missing".into()));
        let ctx = KeyValueChannelContext::new(true, HashMap::new());

        match encode_key_with_collection(b"k", &id, &ctx).unwrap_err() {
            KelpError::CollectionNotFound(name) => assert_eq!(name, "missing"),
            other => panic!("Expected CollectionNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_non_default_collection_without_support_fails() {
        let id = CollectionIdentifier::new("travel", None, Some("hotels".into()));

        match encode_key_with_collection(b"k", &id, &channel_without_collections()).unwrap_err() {
            KelpError::FeatureNotAvailable(_) => {}
            other => panic!("Expected FeatureNotAvailable, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_key_encodes_empty() {
        assert!(encode_key(None).is_empty());
        assert!(encode_key(Some("")).is_empty());
    }

    #[test]
    fn test_partition_binding() {
        let (request, _rx) = GetRequest::new(
            Duration::from_secs(1),
            Arc::new(FailFastRetryStrategy),
            "user:42",
            default_collection(),
            None,
        );
        assert_eq!(request.partition(), 0);
        request.set_partition(712);
        assert_eq!(request.partition(), 712);
    }

    #[test]
    fn test_service_context_fills_defaults_and_redacts() {
        let (request, _rx) = UpsertRequest::new(
            Duration::from_secs(1),
            Arc::new(FailFastRetryStrategy),
            "user:42",
            default_collection(),
            Bytes::from_static(b"{}"),
            0,
            Some(DurabilityLevel::Majority),
            None,
        );

        let ctx = request.service_context();
        assert_eq!(ctx.get("type").unwrap(), "kv");
        assert_eq!(ctx.get("bucket").unwrap(), "travel");
        assert_eq!(ctx.get("scope").unwrap(), DEFAULT_SCOPE);
        assert_eq!(ctx.get("collection").unwrap(), DEFAULT_COLLECTION);
        assert_eq!(ctx.get("documentId").unwrap(), "<ud>user:42</ud>");
        assert_eq!(ctx.get("syncDurability").unwrap(), "majority");
        assert!(ctx.get("opaque").unwrap().starts_with("0x"));
    }
}

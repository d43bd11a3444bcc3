//! Request-body serialization and the response-builder registry (§6, C9).
//!
//! `ResponseBuilder` is a type-erased map keyed by `TypeId`, wrapped in a
//! typed front door so callers never see the erasure.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::Bytes;
use http::StatusCode;

/// Serializes/deserializes request and response bodies. The default,
/// `JsonSerializer`, is backed by `serde_json`; a caller may supply their
/// own (e.g. for `x-ndjson` bulk bodies) without the pipeline knowing the
/// difference.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Bytes, anyhow::Error>;
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, anyhow::Error>;
}

/// Default `serde_json`-backed serializer.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Bytes, anyhow::Error> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, anyhow::Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Error produced when no builder is registered for the requested type, or
/// the registered builder fails to parse the bytes.
#[derive(Debug, thiserror::Error)]
pub enum ResponseBuildError {
    #[error("no response builder registered for this type")]
    NotRegistered,
    #[error("response builder failed: {0}")]
    BuildFailed(#[source] anyhow::Error),
}

type ErasedBuilder = Box<dyn Fn(&[u8], StatusCode) -> Result<Box<dyn Any + Send>, anyhow::Error> + Send + Sync>;

/// Maps a response type `T` to a `bytes -> T` build strategy. One registry
/// is owned by a `Transport`; callers register builders once at startup and
/// then call [`ResponseBuilder::build`] per response without re-specifying
/// how to parse `T`.
#[derive(Default)]
pub struct ResponseBuilder {
    builders: HashMap<TypeId, ErasedBuilder>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a build strategy for `T`. A later call with the same `T`
    /// replaces the previous strategy.
    pub fn register<T, F>(&mut self, builder: F)
    where
        T: Send + 'static,
        F: Fn(&[u8], StatusCode) -> Result<T, anyhow::Error> + Send + Sync + 'static,
    {
        let erased: ErasedBuilder = Box::new(move |bytes, status| {
            builder(bytes, status).map(|value| Box::new(value) as Box<dyn Any + Send>)
        });
        self.builders.insert(TypeId::of::<T>(), erased);
    }

    /// Builds a `T` from response bytes, using the registered strategy.
    pub fn build<T: Send + 'static>(&self, bytes: &[u8], status: StatusCode) -> Result<T, ResponseBuildError> {
        let builder = self
            .builders
            .get(&TypeId::of::<T>())
            .ok_or(ResponseBuildError::NotRegistered)?;
        let built = builder(bytes, status).map_err(ResponseBuildError::BuildFailed)?;
        Ok(*built
            .downcast::<T>()
            .expect("registry key/type invariant: TypeId lookup guarantees a matching downcast"))
    }

    /// Registers the default `serde_json::Value` builder, used when a
    /// caller has no need for a strongly-typed response.
    pub fn with_json_default(mut self) -> Self {
        self.register::<serde_json::Value, _>(|bytes, _status| Ok(serde_json::from_slice(bytes)?));
        self
    }
}

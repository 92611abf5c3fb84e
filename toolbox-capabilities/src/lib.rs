//! Capability loading for toolbox scripts: the embedded package registry, remote
//! module fetching, content-hashed asset adapters, and the caching loader.

#![warn(missing_docs, clippy::pedantic)]

pub mod adapters;
pub mod assets;
pub mod builtin;
pub mod error;
pub mod fetch;
mod http_client;
pub mod loader;
pub mod registry;

pub use adapters::{AdapterBinding, AdapterSet, AssetAdapter};
pub use assets::AssetManifest;
pub use error::{CapabilityError, CapabilityResult};
pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher, StaticFetcher};
pub use loader::{
    CapabilityLoader, CapabilityLoaderBuilder, LoadObserver, LoadedCapability, TracingLoadObserver,
};
pub use registry::{CapabilityPackage, CapabilityRegistry, ModuleExports, NativeModule};

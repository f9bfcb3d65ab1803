//! `hikari-runtime` – Process plumbing around the companion memory.
//!
//! # Modules
//!
//! - [`config`] – [`HikariConfig`][config::HikariConfig]: TOML configuration at
//!   `~/.hikari/config.toml` with `HIKARI_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber, optionally exporting spans over OTLP when
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! - [`companion`] – [`MemoryRuntime`][companion::MemoryRuntime]: opens the
//!   fact store and sticker cache from configuration, exposes the
//!   [`MemoryManager`][hikari_memory::MemoryManager], and runs the sticker
//!   miss → generate → save loop through a caller-supplied
//!   [`StickerGenerator`][companion::StickerGenerator].

pub mod companion;
pub mod config;
pub mod telemetry;

pub use companion::{MemoryRuntime, RuntimeError, RuntimeStats, StickerFetch, StickerGenerator};
pub use config::{CacheConfig, ConfigError, HikariConfig, StorageConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};

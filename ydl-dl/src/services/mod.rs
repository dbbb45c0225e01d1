//! Download engine services

pub mod archive;
pub mod downloads;
pub mod executor;
pub mod fetcher;
pub mod notifier;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod tags;

pub use downloads::{BatchOptions, Downloads, DownloadsError};
pub use executor::{Executor, WorkHandle, WorkUnit};
pub use fetcher::{ItemFetcher, MediaDownloader, YtDlp};
pub use notifier::{LogNotifier, Notifier};
pub use orchestrator::{BatchOrchestrator, BatchRequest};
pub use resolver::{AudioPlatform, Resolver, SoundCloudSite, VideoPlatform, YouTubeApi};
pub use scheduler::{Schedule, Scheduler};
pub use tags::{TagRepairer, TagWriter};

//! Fans out every configured source, then reassembles the results in
//! configuration order.
//!
//! Each source is fetched in its own task through its class cache. Tasks
//! share a global concurrency limit; the whole pass is bounded by a deadline
//! and may be cancelled by the caller, in which case whatever finished is
//! returned and everything else is reported as failed.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::{CachePolicy, FetchCache};
use crate::config::{Config, Settings};
use crate::error::{AggregateError, FetchErrorKind};
use crate::fetcher::Fetcher;
use crate::model::{
    AggregateResult, FetchResult, LiveStatus, SectionResult, Source, SourceConfig, SourceResult,
};

const FEED_CACHE_CAPACITY: usize = 128;
const SUBREDDIT_CACHE_CAPACITY: usize = 32;
const CHANNEL_CACHE_CAPACITY: usize = 32;
const LIVE_CACHE_CAPACITY: usize = 64;
const MAX_IN_FLIGHT_PER_CLASS: usize = 4;

/// One cache per source class.
pub struct SourceCaches {
    pub feeds: FetchCache<FetchResult>,
    pub subreddits: FetchCache<FetchResult>,
    pub channels: FetchCache<FetchResult>,
    pub live: FetchCache<LiveStatus>,
}

impl SourceCaches {
    pub fn new(settings: &Settings) -> Self {
        let policy = |ttl_secs: u64, capacity: usize| CachePolicy {
            ttl: Duration::from_secs(ttl_secs),
            capacity,
            wait_timeout: Duration::from_secs(settings.cache_wait_secs),
            max_in_flight: MAX_IN_FLIGHT_PER_CLASS,
        };

        Self {
            feeds: FetchCache::new("feed", policy(settings.cache_ttl_secs, FEED_CACHE_CAPACITY)),
            subreddits: FetchCache::new(
                "subreddit",
                policy(settings.cache_ttl_secs, SUBREDDIT_CACHE_CAPACITY),
            ),
            channels: FetchCache::new(
                "channel",
                policy(settings.cache_ttl_secs, CHANNEL_CACHE_CAPACITY),
            ),
            live: FetchCache::new(
                "live",
                policy(settings.live_cache_ttl_secs, LIVE_CACHE_CAPACITY),
            ),
        }
    }
}

/// What a single source task produced.
#[derive(Debug)]
pub enum Fetched {
    Items(FetchResult),
    Live(LiveStatus),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Feed { section: usize, index: usize },
    Subreddit(usize),
    Channel(usize),
    Live(usize),
}

struct Inner {
    fetcher: Fetcher,
    caches: SourceCaches,
    permits: Semaphore,
    settings: Settings,
}

impl Inner {
    async fn fetch_source(&self, source: &SourceConfig) -> Fetched {
        let limit = source.limit;

        match &source.source {
            Source::Feed { url } => Fetched::Items(
                self.caches
                    .feeds
                    .get_or_fetch(url, limit, || self.throttled(self.fetcher.fetch_feed(url, limit)))
                    .await,
            ),
            Source::Subreddit { name } => Fetched::Items(
                self.caches
                    .subreddits
                    .get_or_fetch(name, limit, || {
                        self.throttled(self.fetcher.fetch_subreddit(name, limit))
                    })
                    .await,
            ),
            Source::Channel { channel_id } => Fetched::Items(
                self.caches
                    .channels
                    .get_or_fetch(channel_id, limit, || {
                        self.throttled(self.fetcher.fetch_channel(channel_id, limit))
                    })
                    .await,
            ),
            Source::LiveStatus { login } => Fetched::Live(
                self.caches
                    .live
                    .get_or_fetch(login, limit, || {
                        self.throttled(self.fetcher.fetch_live_status(login))
                    })
                    .await,
            ),
        }
    }

    async fn throttled<F: Future>(&self, fetch: F) -> F::Output {
        let _permit = self.permits.acquire().await.ok();
        fetch.await
    }
}

/// Cheap to clone; clones share caches and the concurrency limit.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(fetcher: Fetcher, settings: Settings) -> Self {
        let caches = SourceCaches::new(&settings);
        let permits = Semaphore::new(settings.concurrency.max(1));

        Self {
            inner: Arc::new(Inner {
                fetcher,
                caches,
                permits,
                settings,
            }),
        }
    }

    pub fn caches(&self) -> &SourceCaches {
        &self.inner.caches
    }

    /// Fetch a single feed through the shared feed cache.
    pub async fn feed(&self, url: &str, limit: usize) -> FetchResult {
        let source = SourceConfig::new(url, "feed", Some(limit), Source::Feed { url: url.into() });
        match self.inner.fetch_source(&source).await {
            Fetched::Items(result) => result,
            Fetched::Live(_) => FetchResult::failed(FetchErrorKind::Parse),
        }
    }

    pub async fn aggregate(&self, config: &Config) -> Result<AggregateResult, AggregateError> {
        self.aggregate_until(config, std::future::pending()).await
    }

    /// Aggregate every source in `config`, giving up on whatever is still
    /// pending when the deadline passes or `cancel` resolves.
    pub async fn aggregate_until<C>(
        &self,
        config: &Config,
        cancel: C,
    ) -> Result<AggregateResult, AggregateError>
    where
        C: Future<Output = ()>,
    {
        let started = Instant::now();
        let (mut plan, jobs) = Plan::build(config, &self.inner.settings);
        let job_count = jobs.len();

        let mut tasks = JoinSet::new();
        for (slot, source) in jobs {
            let inner = self.inner.clone();
            tasks.spawn(async move {
                let fetched = inner.fetch_source(&source).await;
                (slot, fetched)
            });
        }

        let deadline = tokio::time::sleep(self.inner.settings.deadline());
        tokio::pin!(deadline);
        tokio::pin!(cancel);

        let mut unfinished = FetchErrorKind::Timeout;
        loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(Ok((slot, fetched))) => plan.fill(slot, fetched)?,
                    Some(Err(e)) => {
                        error!("Fetch task failed: {}", e);
                        return Err(AggregateError::Task(e));
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("Aggregation deadline reached with {} sources pending", tasks.len());
                    break;
                }
                _ = &mut cancel => {
                    warn!("Aggregation cancelled with {} sources pending", tasks.len());
                    unfinished = FetchErrorKind::Cancelled;
                    break;
                }
            }
        }
        tasks.abort_all();

        info!(
            "Aggregated {} sources ({} dispatched) in {:?}",
            config.source_count(),
            job_count,
            started.elapsed()
        );

        Ok(plan.finish(unfinished))
    }
}

struct Pending<T> {
    source: SourceConfig,
    result: Option<T>,
}

impl<T> Pending<T> {
    fn settled(source: SourceConfig, result: T) -> Self {
        Self {
            source,
            result: Some(result),
        }
    }

    fn waiting(source: SourceConfig) -> Self {
        Self {
            source,
            result: None,
        }
    }
}

/// Result skeleton in configuration order, filled as tasks complete.
struct Plan {
    sections: Vec<(String, Vec<Pending<FetchResult>>)>,
    subreddits: Vec<Pending<FetchResult>>,
    youtube: Vec<Pending<FetchResult>>,
    twitch: Vec<Pending<LiveStatus>>,
}

/// Hands out fetch slots up to a per-class cap.
struct Budget<'a> {
    remaining: usize,
    skipped: usize,
    jobs: &'a mut Vec<(Slot, SourceConfig)>,
}

impl Budget<'_> {
    fn admit<T>(
        &mut self,
        slot: Slot,
        source: SourceConfig,
        skipped: impl FnOnce(&SourceConfig) -> T,
    ) -> Pending<T> {
        if self.remaining == 0 {
            self.skipped += 1;
            let result = skipped(&source);
            return Pending::settled(source, result);
        }
        self.remaining -= 1;
        self.jobs.push((slot, source.clone()));
        Pending::waiting(source)
    }
}

impl Plan {
    fn build(config: &Config, settings: &Settings) -> (Self, Vec<(Slot, SourceConfig)>) {
        let mut jobs = Vec::new();
        let skip_items = |_: &SourceConfig| FetchResult::failed(FetchErrorKind::Skipped);

        let mut budget = Budget {
            remaining: settings.max_feeds,
            skipped: 0,
            jobs: &mut jobs,
        };
        let sections: Vec<(String, Vec<Pending<FetchResult>>)> = config
            .sections
            .iter()
            .enumerate()
            .map(|(section, cfg)| {
                let feeds: Vec<Pending<FetchResult>> = cfg
                    .feeds
                    .iter()
                    .enumerate()
                    .map(|(index, feed)| {
                        let source = SourceConfig::new(
                            &feed.name,
                            &cfg.title,
                            feed.limit,
                            Source::Feed {
                                url: feed.url.clone(),
                            },
                        );
                        budget.admit(Slot::Feed { section, index }, source, skip_items)
                    })
                    .collect();
                (cfg.title.clone(), feeds)
            })
            .collect();
        let mut skipped = budget.skipped;

        let mut budget = Budget {
            remaining: settings.max_subreddits,
            skipped: 0,
            jobs: &mut jobs,
        };
        let subreddits: Vec<Pending<FetchResult>> = config
            .subreddits
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let name = name.trim().trim_start_matches("r/");
                let source = SourceConfig::new(
                    format!("r/{}", name),
                    "subreddits",
                    None,
                    Source::Subreddit { name: name.into() },
                );
                budget.admit(Slot::Subreddit(i), source, skip_items)
            })
            .collect();
        skipped += budget.skipped;

        let mut budget = Budget {
            remaining: settings.max_channels,
            skipped: 0,
            jobs: &mut jobs,
        };
        let youtube: Vec<Pending<FetchResult>> = config
            .youtube_channels
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                let source = SourceConfig::new(
                    &channel.name,
                    channel.category.as_deref().unwrap_or("youtube"),
                    channel.limit,
                    Source::Channel {
                        channel_id: channel.channel_id.clone(),
                    },
                );
                budget.admit(Slot::Channel(i), source, skip_items)
            })
            .collect();
        skipped += budget.skipped;

        let mut budget = Budget {
            remaining: settings.max_live_channels,
            skipped: 0,
            jobs: &mut jobs,
        };
        let twitch: Vec<Pending<LiveStatus>> = config
            .twitch_channels
            .iter()
            .enumerate()
            .map(|(i, login)| {
                let login = login.trim().to_lowercase();
                let source = SourceConfig::new(
                    login.clone(),
                    "twitch",
                    Some(1),
                    Source::LiveStatus { login },
                );
                budget.admit(Slot::Live(i), source, |source| {
                    LiveStatus::unknown(source.source.locator(), FetchErrorKind::Skipped)
                })
            })
            .collect();
        skipped += budget.skipped;

        if skipped > 0 {
            info!("Skipping {} sources beyond their class caps", skipped);
        }

        (
            Self {
                sections,
                subreddits,
                youtube,
                twitch,
            },
            jobs,
        )
    }

    fn fill(&mut self, slot: Slot, fetched: Fetched) -> Result<(), AggregateError> {
        let mismatch = || AggregateError::Mismatch(format!("{:?}", slot));

        match fetched {
            Fetched::Items(result) => {
                let pending = match slot {
                    Slot::Feed { section, index } => self
                        .sections
                        .get_mut(section)
                        .and_then(|(_, feeds)| feeds.get_mut(index)),
                    Slot::Subreddit(i) => self.subreddits.get_mut(i),
                    Slot::Channel(i) => self.youtube.get_mut(i),
                    Slot::Live(_) => None,
                };
                pending.ok_or_else(mismatch)?.result = Some(result);
            }
            Fetched::Live(status) => {
                let pending = match slot {
                    Slot::Live(i) => self.twitch.get_mut(i),
                    _ => None,
                };
                pending.ok_or_else(mismatch)?.result = Some(status);
            }
        }
        Ok(())
    }

    fn finish(self, unfinished: FetchErrorKind) -> AggregateResult {
        let items = |pending: Pending<FetchResult>| SourceResult {
            result: pending
                .result
                .unwrap_or_else(|| FetchResult::failed(unfinished)),
            source: pending.source,
        };

        AggregateResult {
            sections: self
                .sections
                .into_iter()
                .map(|(title, feeds)| SectionResult {
                    title,
                    feeds: feeds.into_iter().map(items).collect(),
                })
                .collect(),
            subreddits: self.subreddits.into_iter().map(items).collect(),
            youtube: self.youtube.into_iter().map(items).collect(),
            twitch: self
                .twitch
                .into_iter()
                .map(|pending| {
                    pending.result.unwrap_or_else(|| {
                        LiveStatus::unknown(pending.source.source.locator(), unfinished)
                    })
                })
                .collect(),
        }
    }
}

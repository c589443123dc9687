//! Per-request blocking decisions for pages being rendered
//!
//! Every network request a page makes while it loads is paused and handed to
//! a [`RequestPolicy`], which answers synchronously with allow, abort, or a
//! canned response for the main document. Policies are cheap, immutable
//! snapshots built by the shared [`BlockEvaluator`] once per render.

use crate::{extract_host, Config, HostsSource, RenderError, RenderRequest};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Hosts-file lines that matter start with this address.
const HOSTS_SENTINEL: &str = "0.0.0.0";

/// Resource classes the policy distinguishes between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Xhr,
    Fetch,
    Other,
}

/// Immutable view of one outgoing request
#[derive(Debug, Clone, Copy)]
pub struct RequestDescriptor<'a> {
    pub url: &'a str,
    pub resource: ResourceKind,
    /// The top-level document of the page being rendered
    pub is_main_document: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Abort(AbortReason),
    /// Answer the request with this HTML instead of fetching it
    RespondWith(Arc<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Image,
    AbortPattern,
    Blacklist,
    AdHost,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Image => "image",
            AbortReason::AbortPattern => "abort_pattern",
            AbortReason::Blacklist => "blacklist",
            AbortReason::AdHost => "ad_host",
        }
    }
}

/// Everything needed to judge the requests of a single render
#[derive(Debug, Clone, Default)]
pub struct RequestPolicy {
    abort_pattern: Option<Regex>,
    blacklist: Option<Arc<Regex>>,
    blocked_hosts: Option<Arc<HashSet<String>>>,
    override_content: Option<Arc<str>>,
}

impl RequestPolicy {
    /// Allow or abort; first matching rule wins.
    pub fn decide(&self, request: &RequestDescriptor<'_>) -> Decision {
        if request.resource == ResourceKind::Image {
            return Decision::Abort(AbortReason::Image);
        }

        if let Some(pattern) = &self.abort_pattern {
            if pattern.is_match(request.url) {
                return Decision::Abort(AbortReason::AbortPattern);
            }
        }

        if let Some(blacklist) = &self.blacklist {
            if blacklist.is_match(request.url) {
                return Decision::Abort(AbortReason::Blacklist);
            }
        }

        if let Some(hosts) = &self.blocked_hosts {
            if let Some(host) = extract_host(request.url) {
                if hosts.contains(&host) {
                    return Decision::Abort(AbortReason::AdHost);
                }
            }
        }

        Decision::Allow
    }

    /// Override content applies to the main document only.
    pub fn should_override(&self, request: &RequestDescriptor<'_>) -> bool {
        request.is_main_document && self.override_content.is_some()
    }

    /// Full decision for a paused request. Override content bypasses every
    /// filter for the main document.
    pub fn resolve(&self, request: &RequestDescriptor<'_>) -> Decision {
        match &self.override_content {
            Some(content) if request.is_main_document => Decision::RespondWith(content.clone()),
            _ => self.decide(request),
        }
    }

    pub fn has_override(&self) -> bool {
        self.override_content.is_some()
    }
}

/// Process-wide ad/tracking host list, loaded at most once
pub struct BlockedHostSet {
    source: HostsSource,
    hosts: OnceCell<Result<Arc<HashSet<String>>, RenderError>>,
}

impl BlockedHostSet {
    pub fn new(source: HostsSource) -> Self {
        Self {
            source,
            hosts: OnceCell::new(),
        }
    }

    /// Loads the list on first use. Concurrent first callers share one load,
    /// and a failed load is reported to every caller rather than retried.
    pub async fn get(&self) -> Result<Arc<HashSet<String>>, RenderError> {
        self.hosts
            .get_or_init(|| async {
                let loaded = load_hosts(&self.source).await;
                match &loaded {
                    Ok(hosts) => info!("Loaded {} ad-block hosts", hosts.len()),
                    Err(e) => warn!("Ad-block host list unavailable: {}", e),
                }
                loaded
            })
            .await
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.hosts.get(), Some(Ok(_)))
    }

    pub fn len(&self) -> usize {
        match self.hosts.get() {
            Some(Ok(hosts)) => hosts.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses hosts-file text, keeping the host of every `0.0.0.0 <host>` line.
    pub fn parse(contents: &str) -> HashSet<String> {
        contents
            .lines()
            .filter_map(|line| line.strip_prefix(HOSTS_SENTINEL))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter(|host| *host != HOSTS_SENTINEL)
            .map(str::to_string)
            .collect()
    }
}

async fn load_hosts(source: &HostsSource) -> Result<Arc<HashSet<String>>, RenderError> {
    let contents = match source {
        HostsSource::File(path) => {
            debug!("Reading ad-block hosts from {}", path.display());
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RenderError::AdBlockLoad(format!("{}: {}", path.display(), e)))?
        }
        HostsSource::Url(url) => {
            debug!("Downloading ad-block hosts from {}", url);
            let response = reqwest::get(url)
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| RenderError::AdBlockLoad(e.to_string()))?;
            response
                .text()
                .await
                .map_err(|e| RenderError::AdBlockLoad(e.to_string()))?
        }
        HostsSource::Inline(text) => text.clone(),
    };

    Ok(Arc::new(BlockedHostSet::parse(&contents)))
}

/// Builds a [`RequestPolicy`] for each render
///
/// Owns the lazily loaded host list and the global blacklist so workers
/// receive them by injection rather than through globals.
pub struct BlockEvaluator {
    hosts: BlockedHostSet,
    blacklist: Option<Arc<Regex>>,
}

impl BlockEvaluator {
    pub fn new(hosts: BlockedHostSet, blacklist: Option<Regex>) -> Self {
        Self {
            hosts,
            blacklist: blacklist.map(Arc::new),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, RenderError> {
        let blacklist = config
            .blacklist_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| RenderError::Configuration(format!("Invalid blacklist pattern: {e}")))?;

        Ok(Self::new(
            BlockedHostSet::new(config.adblock_hosts.clone()),
            blacklist,
        ))
    }

    /// Compiles the request's abort pattern and, only when ad blocking is
    /// requested, resolves the host list. A host list that cannot be loaded
    /// fails the render instead of silently allowing or blocking everything.
    pub async fn policy_for(&self, request: &RenderRequest) -> Result<RequestPolicy, RenderError> {
        let abort_pattern = request
            .abort_request_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| RenderError::InvalidPattern(e.to_string()))?;

        let blocked_hosts = if request.block_ads {
            Some(self.hosts.get().await?)
        } else {
            None
        };

        Ok(RequestPolicy {
            abort_pattern,
            blacklist: self.blacklist.clone(),
            blocked_hosts,
            override_content: request.content.as_deref().map(Arc::from),
        })
    }

    pub fn hosts(&self) -> &BlockedHostSet {
        &self.hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HOSTS: &str = "\
# Title: test hosts
127.0.0.1 localhost
0.0.0.0 0.0.0.0
0.0.0.0 www.google-analytics.com
0.0.0.0 google-analytics.com
0.0.0.0\tfacebook-info.co # tracker
0.0.0.0
";

    fn request(url: &str, resource: ResourceKind) -> RequestDescriptor<'_> {
        RequestDescriptor {
            url,
            resource,
            is_main_document: false,
        }
    }

    fn evaluator() -> BlockEvaluator {
        BlockEvaluator::new(
            BlockedHostSet::new(HostsSource::Inline(HOSTS.to_string())),
            None,
        )
    }

    #[test]
    fn test_parse_hosts() {
        let hosts = BlockedHostSet::parse(HOSTS);
        assert_eq!(hosts.len(), 3);
        assert!(hosts.contains("www.google-analytics.com"));
        assert!(hosts.contains("google-analytics.com"));
        assert!(hosts.contains("facebook-info.co"));
        assert!(!hosts.contains("localhost"));
        assert!(!hosts.contains("0.0.0.0"));
    }

    #[tokio::test]
    async fn test_images_always_aborted() {
        let evaluator = evaluator();
        for block_ads in [false, true] {
            let policy = evaluator
                .policy_for(&RenderRequest {
                    block_ads,
                    ..RenderRequest::new("https://somesite.com")
                })
                .await
                .unwrap();
            assert_eq!(
                policy.decide(&request("https://somesite.com/dog.png", ResourceKind::Image)),
                Decision::Abort(AbortReason::Image)
            );
        }
    }

    #[tokio::test]
    async fn test_ad_hosts_follow_block_ads_flag() {
        let evaluator = evaluator();
        let cases = [
            ("https://www.google-analytics.com", true),
            ("https://google-analytics.com/analytics.js", true),
            ("https://facebook-info.co", true),
            ("https://mysite.com", false),
            ("https://trax.fider.io", false),
        ];

        let blocking = evaluator
            .policy_for(&RenderRequest {
                block_ads: true,
                ..RenderRequest::new("https://mysite.com")
            })
            .await
            .unwrap();
        let permissive = evaluator
            .policy_for(&RenderRequest::new("https://mysite.com"))
            .await
            .unwrap();

        for (url, blocked) in cases {
            let req = request(url, ResourceKind::Document);
            let expected = if blocked {
                Decision::Abort(AbortReason::AdHost)
            } else {
                Decision::Allow
            };
            assert_eq!(blocking.decide(&req), expected, "{url} with ads blocked");
            assert_eq!(permissive.decide(&req), Decision::Allow, "{url} with ads allowed");
        }
    }

    #[tokio::test]
    async fn test_host_list_not_loaded_without_block_ads() {
        let evaluator = BlockEvaluator::new(
            BlockedHostSet::new(HostsSource::File("/nonexistent/rendergun-hosts".into())),
            None,
        );
        let policy = evaluator
            .policy_for(&RenderRequest::new("https://mysite.com"))
            .await;
        tokio_test::assert_ok!(policy);
        assert!(!evaluator.hosts().is_loaded());
    }

    #[tokio::test]
    async fn test_abort_pattern_and_blacklist() {
        let evaluator = BlockEvaluator::new(
            BlockedHostSet::new(HostsSource::Inline(String::new())),
            Some(Regex::new(r"\.woff2?$").unwrap()),
        );
        let policy = evaluator
            .policy_for(&RenderRequest {
                abort_request_pattern: Some("/widgets/".to_string()),
                ..RenderRequest::new("https://mysite.com")
            })
            .await
            .unwrap();

        assert_eq!(
            policy.decide(&request("https://cdn.com/widgets/chat.js", ResourceKind::Script)),
            Decision::Abort(AbortReason::AbortPattern)
        );
        assert_eq!(
            policy.decide(&request("https://cdn.com/font.woff2", ResourceKind::Font)),
            Decision::Abort(AbortReason::Blacklist)
        );
        assert_eq!(
            policy.decide(&request("https://cdn.com/app.js", ResourceKind::Script)),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn test_invalid_abort_pattern() {
        let result = evaluator()
            .policy_for(&RenderRequest {
                abort_request_pattern: Some("(".to_string()),
                ..RenderRequest::new("https://mysite.com")
            })
            .await;
        assert!(matches!(result, Err(RenderError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_override_wins_for_main_document_only() {
        let policy = evaluator()
            .policy_for(&RenderRequest {
                content: Some("<html><body>hi</body></html>".to_string()),
                abort_request_pattern: Some(".*".to_string()),
                block_ads: true,
                ..RenderRequest::new("https://www.google-analytics.com/")
            })
            .await
            .unwrap();

        let main = RequestDescriptor {
            url: "https://www.google-analytics.com/",
            resource: ResourceKind::Document,
            is_main_document: true,
        };
        assert!(policy.should_override(&main));
        assert_eq!(
            policy.resolve(&main),
            Decision::RespondWith(Arc::from("<html><body>hi</body></html>"))
        );

        let frame = request("https://mysite.com/frame", ResourceKind::Document);
        assert!(!policy.should_override(&frame));
        assert_eq!(policy.resolve(&frame), Decision::Abort(AbortReason::AbortPattern));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{HOSTS}").unwrap();

        let set = Arc::new(BlockedHostSet::new(HostsSource::File(file.path().to_path_buf())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                tokio::spawn(async move { set.get().await })
            })
            .collect();

        let mut loaded = Vec::new();
        for handle in handles {
            loaded.push(handle.await.unwrap().unwrap());
        }
        assert!(loaded.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(set.len(), 3);
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let evaluator = BlockEvaluator::new(
            BlockedHostSet::new(HostsSource::File("/nonexistent/rendergun-hosts".into())),
            None,
        );
        let request = RenderRequest {
            block_ads: true,
            ..RenderRequest::new("https://mysite.com")
        };

        let first = evaluator.policy_for(&request).await;
        assert!(matches!(first, Err(RenderError::AdBlockLoad(_))));

        // The failure is remembered, not retried.
        let second = evaluator.policy_for(&request).await;
        assert_eq!(first.unwrap_err(), second.unwrap_err());
        assert!(!evaluator.hosts().is_loaded());
    }
}

//! Web request interception pipeline.
//!
//! Extensions holding the `webRequest` permission register rules; the host
//! calls [`WebRequestInterceptor::evaluate`] once per outbound request. The
//! request path is synchronous and lock-light: it reads a materialized
//! snapshot (`Arc`) that is rebuilt whenever rules or the registry change,
//! never a live view of mutable state and never a round-trip into a
//! background context.
//!
//! Evaluation policy: extensions in load order, rules within an extension by
//! descending priority. The first terminal action (block, redirect) wins and
//! short-circuits; header modifications from all matching extensions merge in
//! load order; a request matching nothing passes unmodified. A failure while
//! applying one extension's rule is logged and fails open for that rule only.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::manifest::PERMISSION_WEB_REQUEST;
use crate::registry::ExtensionRegistry;

/// Pattern matching every URL
pub const ALL_URLS: &str = "<all_urls>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemeMatcher {
    /// `*` — http or https
    WildcardWeb,
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatcher {
    Any,
    /// `*.example.com` — the domain itself or any subdomain
    Suffix(String),
    Exact(String),
}

/// Parsed URL match pattern (`<all_urls>` or `scheme://host/path`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    raw: String,
    all_urls: bool,
    scheme: SchemeMatcher,
    host: HostMatcher,
    path: String,
}

impl MatchPattern {
    /// Parse a match pattern, validating its shape
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == ALL_URLS {
            return Ok(Self {
                raw: raw.to_string(),
                all_urls: true,
                scheme: SchemeMatcher::WildcardWeb,
                host: HostMatcher::Any,
                path: "/*".to_string(),
            });
        }

        let invalid = |message: &str| Error::InvalidMatchPattern {
            pattern: raw.to_string(),
            message: message.to_string(),
        };

        let (scheme_part, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' separator"))?;

        let scheme = match scheme_part {
            "*" => SchemeMatcher::WildcardWeb,
            "" => return Err(invalid("empty scheme")),
            s if s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') => {
                SchemeMatcher::Exact(s.to_ascii_lowercase())
            }
            _ => return Err(invalid("invalid scheme")),
        };

        let (host_part, path_part) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/*"),
        };

        let host = if host_part == "*" {
            HostMatcher::Any
        } else if let Some(domain) = host_part.strip_prefix("*.") {
            if domain.is_empty() || domain.contains('*') {
                return Err(invalid("invalid host wildcard"));
            }
            HostMatcher::Suffix(domain.to_ascii_lowercase())
        } else if host_part.is_empty() {
            return Err(invalid("empty host"));
        } else if host_part.contains('*') {
            return Err(invalid("host wildcard only allowed as '*.' prefix"));
        } else {
            HostMatcher::Exact(host_part.to_ascii_lowercase())
        };

        Ok(Self {
            raw: raw.to_string(),
            all_urls: false,
            scheme,
            host,
            path: path_part.to_string(),
        })
    }

    /// The pattern as written
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern matches `url`
    #[must_use]
    pub fn matches(&self, url: &Url) -> bool {
        if self.all_urls {
            return true;
        }

        match &self.scheme {
            SchemeMatcher::WildcardWeb => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return false;
                }
            }
            SchemeMatcher::Exact(scheme) => {
                if url.scheme() != scheme {
                    return false;
                }
            }
        }

        let host = url.host_str().unwrap_or("").to_ascii_lowercase();
        match &self.host {
            HostMatcher::Any => {}
            HostMatcher::Suffix(domain) => {
                if host != *domain && !host.ends_with(&format!(".{domain}")) {
                    return false;
                }
            }
            HostMatcher::Exact(exact) => {
                if host != *exact {
                    return false;
                }
            }
        }

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        glob_match(&self.path, &target)
    }
}

/// `*`-wildcard glob match
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// A header to set on a matching request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderInstruction {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// What a matching rule does to the request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    /// Cancel the request (terminal)
    Block,
    /// Send the request elsewhere (terminal)
    Redirect {
        /// Absolute target URL
        target: String,
    },
    /// Rewrite request headers (accumulates across extensions)
    ModifyHeaders {
        /// Headers to set or overwrite
        #[serde(default)]
        set: Vec<HeaderInstruction>,
        /// Header names to strip
        #[serde(default)]
        remove: Vec<String>,
    },
}

/// One declared interception rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRule {
    /// URL match pattern
    pub pattern: String,
    /// Action when the pattern matches
    pub action: RuleAction,
    /// Higher priority evaluates first within the owning extension
    #[serde(default)]
    pub priority: i32,
}

/// An outbound request as seen by the interception hook
#[derive(Debug, Clone)]
pub struct RequestDetails {
    /// Request URL
    pub url: Url,
    /// HTTP method
    pub method: String,
    /// Request headers
    pub headers: HashMap<String, String>,
}

impl RequestDetails {
    /// Build request details for `url`; fails on unparsable URLs
    pub fn new(url: &str, method: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidRequestUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            url,
            method: method.to_string(),
            headers: HashMap::new(),
        })
    }

    /// Attach a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// Terminal verdict for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request proceeds (headers possibly modified)
    Allow,
    /// Request cancelled
    Block {
        /// Extension whose rule blocked it
        extension_id: String,
    },
    /// Request redirected
    Redirect {
        /// Extension whose rule redirected it
        extension_id: String,
        /// Redirect target
        target: Url,
    },
}

/// Result of evaluating one request against every enabled extension
#[derive(Debug, Clone)]
pub struct InterceptOutcome {
    /// Terminal verdict
    pub decision: Decision,
    /// Request headers after accumulated modifications
    pub headers: HashMap<String, String>,
    /// Extensions that contributed header modifications, in load order
    pub modified_by: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: MatchPattern,
    action: RuleAction,
    priority: i32,
}

#[derive(Default)]
struct Snapshot {
    /// `(extension id, compiled rules)` in extension-load order
    entries: Vec<(String, Vec<CompiledRule>)>,
}

/// The single hook point in the host's request pipeline
pub struct WebRequestInterceptor {
    registry: ExtensionRegistry,
    events: EventBus,
    /// Registered rules per extension (mutated on the control path)
    rules: RwLock<HashMap<String, Vec<CompiledRule>>>,
    /// Materialized view consumed by the synchronous request path
    snapshot: StdRwLock<Arc<Snapshot>>,
}

impl WebRequestInterceptor {
    /// Create the interceptor over the given registry and event bus
    pub fn new(registry: ExtensionRegistry, events: EventBus) -> Self {
        Self {
            registry,
            events,
            rules: RwLock::new(HashMap::new()),
            snapshot: StdRwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Register (replace) the rule set for one extension.
    ///
    /// Requires the extension to be registered and to declare the
    /// `webRequest` permission; patterns are validated here so the request
    /// path never sees a malformed one.
    pub async fn set_rules(&self, extension_id: &str, rules: Vec<RequestRule>) -> Result<()> {
        let extension = self
            .registry
            .get(extension_id)
            .await
            .ok_or_else(|| Error::ExtensionGone(extension_id.to_string()))?;
        if !extension.manifest.has_permission(PERMISSION_WEB_REQUEST) {
            return Err(Error::MissingPermission {
                extension_id: extension_id.to_string(),
                permission: PERMISSION_WEB_REQUEST.to_string(),
            });
        }

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(CompiledRule {
                pattern: MatchPattern::parse(&rule.pattern)?,
                action: rule.action,
                priority: rule.priority,
            });
        }
        // Higher priority first within this extension.
        compiled.sort_by(|a, b| b.priority.cmp(&a.priority));

        self.rules
            .write()
            .await
            .insert(extension_id.to_string(), compiled);
        self.rebuild().await;
        debug!("request rules updated for {}", extension_id);
        Ok(())
    }

    /// Drop every rule registered by one extension
    pub async fn clear_rules(&self, extension_id: &str) {
        let removed = self.rules.write().await.remove(extension_id).is_some();
        if removed {
            self.rebuild().await;
            debug!("request rules cleared for {}", extension_id);
        }
    }

    /// Rebuild the request-path snapshot from the registry's current
    /// enabled set. Called after any registry mutation.
    pub async fn rebuild(&self) {
        let enabled = self.registry.list_enabled().await;
        let rules = self.rules.read().await;

        let entries = enabled
            .iter()
            .filter_map(|ext| {
                rules
                    .get(&ext.id)
                    .filter(|r| !r.is_empty())
                    .map(|r| (ext.id.clone(), r.clone()))
            })
            .collect();

        let snapshot = Arc::new(Snapshot { entries });
        *self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = snapshot;
    }

    /// Evaluate one request. Synchronous: suspends the request only as long
    /// as the snapshot walk takes.
    pub fn evaluate(&self, request: &RequestDetails) -> InterceptOutcome {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let mut headers = request.headers.clone();
        let mut modified_by: Vec<String> = Vec::new();

        for (extension_id, rules) in &snapshot.entries {
            for rule in rules {
                if !rule.pattern.matches(&request.url) {
                    continue;
                }
                match &rule.action {
                    RuleAction::Block => {
                        self.events.publish(RuntimeEvent::RequestBlocked {
                            extension_id: extension_id.clone(),
                            url: request.url.to_string(),
                        });
                        return InterceptOutcome {
                            decision: Decision::Block {
                                extension_id: extension_id.clone(),
                            },
                            headers,
                            modified_by,
                        };
                    }
                    RuleAction::Redirect { target } => match Url::parse(target) {
                        Ok(target_url) => {
                            self.events.publish(RuntimeEvent::RequestRedirected {
                                extension_id: extension_id.clone(),
                                url: request.url.to_string(),
                                target: target_url.to_string(),
                            });
                            return InterceptOutcome {
                                decision: Decision::Redirect {
                                    extension_id: extension_id.clone(),
                                    target: target_url,
                                },
                                headers,
                                modified_by,
                            };
                        }
                        Err(e) => {
                            // Fail open for this rule only.
                            let err = Error::RuleEvaluation {
                                extension_id: extension_id.clone(),
                                message: format!("bad redirect target '{target}': {e}"),
                            };
                            warn!("{}", err);
                            continue;
                        }
                    },
                    RuleAction::ModifyHeaders { set, remove } => {
                        for header in set {
                            headers.insert(header.name.clone(), header.value.clone());
                        }
                        for name in remove {
                            headers.remove(name);
                        }
                        if !modified_by.contains(extension_id) {
                            modified_by.push(extension_id.clone());
                        }
                    }
                }
            }
        }

        if !modified_by.is_empty() {
            self.events.publish(RuntimeEvent::RequestModified {
                extension_ids: modified_by.clone(),
                url: request.url.to_string(),
            });
        }

        InterceptOutcome {
            decision: Decision::Allow,
            headers,
            modified_by,
        }
    }
}

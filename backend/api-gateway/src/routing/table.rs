use reqwest::Url;
use tracing::{info, warn};

use crate::config::BackendUrls;
use crate::handlers::LOCAL_ROUTES;

/// A reverse-proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: &'static str,
    pub base_url: Url,
}

impl Backend {
    /// Target URL for `path` and `query`, keeping any path prefix on the base URL.
    pub fn target_url(&self, path: &str, query: &str) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base_path, path));
        url.set_query(if query.is_empty() { None } else { Some(query) });
        url
    }
}

/// Where a request path is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Health, readiness, metrics and the rate-limit probe.
    Local,
    Proxy(Backend),
    /// Handled by the JSON translation handlers (or 404s there).
    Translate,
}

#[derive(Debug, Clone)]
struct ProxyRoute {
    /// Ending in `/` matches the prefix; otherwise exact.
    pattern: String,
    backend: Backend,
}

impl ProxyRoute {
    fn matches(&self, path: &str) -> bool {
        if self.pattern.ends_with('/') {
            path.starts_with(&self.pattern)
        } else {
            path == self.pattern
        }
    }
}

/// `{prefix}{segment}{suffix}` with a single non-empty segment in the middle.
#[derive(Debug, Clone)]
struct SuffixRoute {
    prefix: String,
    suffix: String,
    backend: Backend,
}

impl SuffixRoute {
    fn matches(&self, path: &str) -> bool {
        path.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_suffix(&self.suffix))
            .map(|segment| !segment.is_empty() && !segment.contains('/'))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    local: Vec<String>,
    proxies: Vec<ProxyRoute>,
    suffixes: Vec<SuffixRoute>,
}

impl RouteTable {
    /// Empty table with only the local routes registered.
    pub fn new() -> Self {
        Self {
            local: LOCAL_ROUTES.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn from_backends(backends: &BackendUrls) -> Self {
        let mut table = Self::new();

        if let Some(user) = parse_backend("user-service", backends.user_service.as_deref()) {
            for pattern in [
                "/api/v1/auth/",
                "/api/v1/users/",
                "/api/v1/sessions/",
                "/api/v1/operators/available",
                "/api/v1/operators/available/",
                "/api/v1/operators/stats",
                "/api/v1/operators/stats/",
                "/api/v1/operators/availability",
                "/api/v1/operators/availability/",
            ] {
                table.add_proxy(pattern, user.clone());
            }
            table.add_suffix_override("/api/v1/operators/", "/availability", user.clone());

            if backends.operator_directory.is_none() {
                table.add_proxy("/api/v1/operators", user.clone());
                table.add_proxy("/api/v1/operators/", user);
            }
        }

        if let Some(directory) =
            parse_backend("operator-directory", backends.operator_directory.as_deref())
        {
            table.add_proxy("/api/v1/operators", directory.clone());
            table.add_proxy("/api/v1/operators/", directory);
        }

        if let Some(sessions) = parse_backend("session-manager", backends.session_manager.as_deref()) {
            table.add_proxy("/session/", sessions);
        }

        if let Some(tickets) = parse_backend("ticket-service", backends.ticket_service.as_deref()) {
            table.add_proxy("/api/v1/tickets", tickets.clone());
            table.add_proxy("/api/v1/tickets/", tickets);
        }

        if let Some(search) = parse_backend("search-service", backends.search_service.as_deref()) {
            table.add_proxy("/search", search.clone());
            table.add_proxy("/search/", search);
        }

        if let Some(pool) = parse_backend("operator-pool", backends.operator_pool.as_deref()) {
            table.add_proxy("/operator/", pool);
        }

        if let Some(notify) =
            parse_backend("notification-service", backends.notification_service.as_deref())
        {
            table.add_proxy("/notify/", notify.clone());
            table.add_proxy("/ws/notify/", notify);
        }

        if let Some(data) = parse_backend("data-channel", backends.data_channel.as_deref()) {
            table.add_proxy("/data/", data.clone());
            table.add_proxy("/ws/data/", data);
        }

        info!(
            proxies = table.proxies.len(),
            overrides = table.suffixes.len(),
            "Route table built"
        );
        table
    }

    pub fn add_proxy(&mut self, pattern: impl Into<String>, backend: Backend) {
        self.proxies.push(ProxyRoute {
            pattern: pattern.into(),
            backend,
        });
    }

    pub fn add_suffix_override(
        &mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        backend: Backend,
    ) {
        self.suffixes.push(SuffixRoute {
            prefix: prefix.into(),
            suffix: suffix.into(),
            backend,
        });
    }

    /// Local exact match, then suffix overrides, then the longest proxy pattern.
    pub fn resolve(&self, path: &str) -> Dispatch {
        if self.local.iter().any(|p| p == path) {
            return Dispatch::Local;
        }

        if let Some(route) = self.suffixes.iter().find(|r| r.matches(path)) {
            return Dispatch::Proxy(route.backend.clone());
        }

        self.proxies
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| r.pattern.len())
            .map(|r| Dispatch::Proxy(r.backend.clone()))
            .unwrap_or(Dispatch::Translate)
    }
}

fn parse_backend(name: &'static str, raw: Option<&str>) -> Option<Backend> {
    let raw = raw?;
    match Url::parse(raw) {
        Ok(url) if url.host_str().is_some() => Some(Backend {
            name,
            base_url: url,
        }),
        Ok(_) => {
            warn!(backend = name, url = raw, "Backend URL has no host, not proxying");
            None
        }
        Err(e) => {
            warn!(backend = name, url = raw, error = %e, "Invalid backend URL, not proxying");
            None
        }
    }
}

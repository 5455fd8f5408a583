use crate::auth::ScopeSet;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

fn default_true() -> bool {
    true
}

/// One line of the route table, as it appears in the catalog
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    pub path_prefix: String,
    pub backend_target: String,
    #[serde(default = "default_true")]
    pub requires_auth: bool,
    /// the token has to carry every one of these
    #[serde(default)]
    pub required_scopes: ScopeSet,
    /// drop `path_prefix` before forwarding, so `/users/42` lands on `{backend}/42`
    #[serde(default)]
    pub strip_prefix: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route prefix '{0}' is configured more than once")]
    Duplicate(String),
    #[error("route '{0}': {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub entry: RouteEntry,
    /// prefix with any trailing slash removed ("/" stays "/")
    prefix: String,
    backend: Url,
}

impl Route {
    fn new(mut entry: RouteEntry) -> Result<Self, RouteError> {
        let invalid = |msg: String| RouteError::Invalid(entry.path_prefix.clone(), msg);

        if !entry.path_prefix.starts_with('/') {
            return Err(invalid("path_prefix must start with '/'".into()));
        }
        let backend = Url::parse(&entry.backend_target)
            .map_err(|e| invalid(format!("backend_target is not a URL: {}", e)))?;
        if !matches!(backend.scheme(), "http" | "https") || backend.cannot_be_a_base() {
            return Err(invalid(format!(
                "backend_target '{}' must be an http(s) base URL",
                entry.backend_target
            )));
        }
        if !entry.required_scopes.is_empty() && !entry.requires_auth {
            return Err(invalid("required_scopes needs requires_auth".into()));
        }

        let prefix = match entry.path_prefix.trim_end_matches('/') {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        entry.path_prefix = prefix.clone();
        Ok(Self {
            entry,
            prefix,
            backend,
        })
    }

    /// Segment-aware: `/api` matches `/api` and `/api/x` but not `/apix`
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Where a request for `path?query` goes on the backend
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let forwarded = if self.entry.strip_prefix && self.prefix != "/" {
            match path.strip_prefix(self.prefix.as_str()) {
                Some("") | None => "/",
                Some(rest) => rest,
            }
        } else {
            path
        };

        let mut url = self.backend.clone();
        let base = self.backend.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, forwarded));
        url.set_query(query);
        url
    }
}

/// Whether `path` has a `.` or `..` segment, literal or percent-encoded. The upstream URL
/// resolves those away, so such a request would land on a different backend path than
/// the route it was matched (and scope-checked) against.
pub fn has_dot_segment(path: &str) -> bool {
    // the URL parser treats `\` as `/` for http(s)
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.replace("%2e", ".").replace("%2E", ".");
        decoded == "." || decoded == ".."
    })
}

/// Static routing table. Built once at startup and shared read-only.
#[derive(Debug, Default)]
pub struct RouteTable {
    /// longest prefix first, so the first match wins
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Result<Self, RouteError> {
        let mut routes: Vec<Route> = Vec::with_capacity(entries.len());
        for entry in entries {
            let route = Route::new(entry)?;
            if routes.iter().any(|r| r.prefix == route.prefix) {
                return Err(RouteError::Duplicate(route.prefix));
            }
            routes.push(route);
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }
}

use http::{HeaderMap, HeaderName, Uri};
use regex::Regex;
use std::cmp::Ordering;

/// The conditions a request must satisfy to select a route. All conditions
/// are ANDed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteMatch {
    pub path: Option<PathMatch>,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
}

#[derive(Clone, Debug)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeaderMatch {
    pub name: HeaderName,
    pub value: HeaderValueMatch,
    pub ignore_case: bool,
    pub treat_missing_as_empty: bool,
}

#[derive(Clone, Debug)]
pub enum HeaderValueMatch {
    Present,
    NotPresent,
    Exact(String),
    NotExact(String),
    Contains(String),
    NotContains(String),
    Regex(Regex),
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryParamMatch {
    pub name: String,
    pub value: QueryValueMatch,
    pub ignore_case: bool,
}

#[derive(Clone, Debug)]
pub enum QueryValueMatch {
    Present,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Regex),
}

/// The parts of a request consulted by route matching.
#[derive(Copy, Clone, Debug)]
pub struct RequestRef<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

/// Compiles `pattern` so that it must match an entire value.
pub fn anchored_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

// === impl RequestRef ===

impl<'a> RequestRef<'a> {
    pub fn new(uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            path: uri.path(),
            query: uri.query(),
            headers,
        }
    }

    /// Returns the value of the first occurrence of the named query parameter.
    pub fn query_param(&self, name: &str) -> Option<&'a str> {
        self.query?
            .split('&')
            .filter(|kv| !kv.is_empty())
            .map(|kv| kv.split_once('=').unwrap_or((kv, "")))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Returns all values of the named header joined with `,`.
    pub fn header(&self, name: &HeaderName) -> Option<String> {
        let mut values = self
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .peekable();
        values.peek()?;
        Some(values.collect::<Vec<_>>().join(","))
    }
}

// === impl RouteMatch ===

impl RouteMatch {
    pub fn matches(&self, req: &RequestRef<'_>) -> bool {
        if let Some(path) = &self.path {
            if !path.matches(req.path) {
                return false;
            }
        }
        self.headers.iter().all(|h| h.matches(req))
            && self.query_params.iter().all(|q| q.matches(req))
    }

    /// Orders matches by specificity; `Greater` means `self` should be
    /// preferred over `other`.
    ///
    /// Exact paths beat prefixes, longer prefixes beat shorter ones, prefixes
    /// beat regular expressions (longer expressions first), and any path
    /// condition beats none. Ties go to the match with more header and query
    /// conditions.
    pub fn cmp_specificity(&self, other: &Self) -> Ordering {
        self.path_rank()
            .cmp(&other.path_rank())
            .then_with(|| self.condition_count().cmp(&other.condition_count()))
    }

    fn path_rank(&self) -> (u8, usize) {
        match &self.path {
            Some(PathMatch::Exact(p)) => (3, p.len()),
            Some(PathMatch::Prefix(p)) => (2, p.len()),
            Some(PathMatch::Regex(r)) => (1, r.as_str().len()),
            None => (0, 0),
        }
    }

    fn condition_count(&self) -> usize {
        self.headers.len() + self.query_params.len()
    }
}

// === impl PathMatch ===

impl PathMatch {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => path == p,
            Self::Prefix(p) => path.starts_with(p.as_str()),
            Self::Regex(re) => re.is_match(path),
        }
    }
}

impl PartialEq for PathMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(l), Self::Exact(r)) => l == r,
            (Self::Prefix(l), Self::Prefix(r)) => l == r,
            (Self::Regex(l), Self::Regex(r)) => l.as_str() == r.as_str(),
            _ => false,
        }
    }
}

// === impl HeaderMatch ===

impl HeaderMatch {
    pub fn matches(&self, req: &RequestRef<'_>) -> bool {
        let value = req.header(&self.name);
        match (&self.value, value) {
            (HeaderValueMatch::Present, v) => v.is_some(),
            (HeaderValueMatch::NotPresent, v) => v.is_none(),
            (_, None) if !self.treat_missing_as_empty => false,
            (m, v) => m.matches(v.as_deref().unwrap_or(""), self.ignore_case),
        }
    }
}

impl HeaderValueMatch {
    fn matches(&self, value: &str, ignore_case: bool) -> bool {
        match self {
            Self::Present => true,
            Self::NotPresent => false,
            Self::Exact(e) => eq(value, e, ignore_case),
            Self::NotExact(e) => !eq(value, e, ignore_case),
            Self::Contains(e) => contains(value, e, ignore_case),
            Self::NotContains(e) => !contains(value, e, ignore_case),
            Self::Regex(re) => re.is_match(value),
        }
    }
}

impl PartialEq for HeaderValueMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Present, Self::Present) | (Self::NotPresent, Self::NotPresent) => true,
            (Self::Exact(l), Self::Exact(r))
            | (Self::NotExact(l), Self::NotExact(r))
            | (Self::Contains(l), Self::Contains(r))
            | (Self::NotContains(l), Self::NotContains(r)) => l == r,
            (Self::Regex(l), Self::Regex(r)) => l.as_str() == r.as_str(),
            _ => false,
        }
    }
}

// === impl QueryParamMatch ===

impl QueryParamMatch {
    pub fn matches(&self, req: &RequestRef<'_>) -> bool {
        let Some(value) = req.query_param(&self.name) else {
            return false;
        };
        let ic = self.ignore_case;
        match &self.value {
            QueryValueMatch::Present => true,
            QueryValueMatch::Exact(e) => eq(value, e, ic),
            QueryValueMatch::Prefix(p) => {
                if ic {
                    value.to_lowercase().starts_with(&p.to_lowercase())
                } else {
                    value.starts_with(p.as_str())
                }
            }
            QueryValueMatch::Suffix(s) => {
                if ic {
                    value.to_lowercase().ends_with(&s.to_lowercase())
                } else {
                    value.ends_with(s.as_str())
                }
            }
            QueryValueMatch::Contains(c) => contains(value, c, ic),
            QueryValueMatch::Regex(re) => re.is_match(value),
        }
    }
}

impl PartialEq for QueryValueMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Present, Self::Present) => true,
            (Self::Exact(l), Self::Exact(r))
            | (Self::Prefix(l), Self::Prefix(r))
            | (Self::Suffix(l), Self::Suffix(r))
            | (Self::Contains(l), Self::Contains(r)) => l == r,
            (Self::Regex(l), Self::Regex(r)) => l.as_str() == r.as_str(),
            _ => false,
        }
    }
}

fn eq(value: &str, expected: &str, ignore_case: bool) -> bool {
    if ignore_case {
        value.eq_ignore_ascii_case(expected)
    } else {
        value == expected
    }
}

fn contains(value: &str, needle: &str, ignore_case: bool) -> bool {
    if ignore_case {
        value.to_lowercase().contains(&needle.to_lowercase())
    } else {
        value.contains(needle)
    }
}

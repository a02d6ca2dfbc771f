//! Composes the match conditions of an include chain into a single route
//! match.

use ingress_controller_core::{
    routes::{
        anchored_regex, HeaderMatch, HeaderValueMatch, PathMatch, QueryParamMatch, QueryValueMatch,
        RouteMatch,
    },
    HeaderName,
};
use ingress_controller_k8s_api::httpproxy::{
    HeaderMatchCondition, MatchCondition, QueryParameterMatchCondition,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum InvalidConditions {
    #[error("{0:?} cannot follow an exact or regex path condition")]
    PathAfterTerminal(String),

    #[error("invalid regex {0:?}")]
    Regex(String),

    #[error("invalid header name {0:?}")]
    HeaderName(String),

    #[error("header condition {0:?} sets no match operator")]
    NoOperator(String),
}

enum Path {
    Prefix(String),
    Exact(String),
    Regex(String),
}

/// Builds a route match from conditions ordered from the root of the include
/// chain down to the route itself.
///
/// Path conditions concatenate: a prefix followed by a prefix or an exact
/// path joins the two with a single `/`, and a prefix followed by a regex
/// prepends the escaped prefix to the pattern. Header and query conditions
/// accumulate.
pub(crate) fn route_match(conditions: &[MatchCondition]) -> Result<RouteMatch, InvalidConditions> {
    let mut path = None::<Path>;
    let mut matches = RouteMatch::default();

    for c in conditions {
        let next = if let Some(p) = &c.prefix {
            Some(Path::Prefix(p.clone()))
        } else if let Some(p) = &c.exact {
            Some(Path::Exact(p.clone()))
        } else {
            c.regex.clone().map(Path::Regex)
        };
        if let Some(next) = next {
            path = Some(match (path.take(), next) {
                (None, next) => next,
                (Some(Path::Prefix(a)), Path::Prefix(b)) => Path::Prefix(join(&a, &b)),
                (Some(Path::Prefix(a)), Path::Exact(b)) => Path::Exact(join(&a, &b)),
                (Some(Path::Prefix(a)), Path::Regex(r)) => {
                    let base = if r.starts_with('/') {
                        a.trim_end_matches('/')
                    } else {
                        a.as_str()
                    };
                    Path::Regex(format!("{}{r}", regex::escape(base)))
                }
                (Some(Path::Exact(_) | Path::Regex(_)), next) => {
                    let s = match next {
                        Path::Prefix(s) | Path::Exact(s) | Path::Regex(s) => s,
                    };
                    return Err(InvalidConditions::PathAfterTerminal(s));
                }
            });
        }

        if let Some(h) = &c.header {
            matches.headers.push(header_match(h)?);
        }
        if let Some(q) = &c.query_parameter {
            matches.query_params.push(query_match(q)?);
        }
    }

    matches.path = match path {
        None => None,
        Some(Path::Prefix(p)) => Some(PathMatch::Prefix(p)),
        Some(Path::Exact(p)) => Some(PathMatch::Exact(p)),
        Some(Path::Regex(r)) => Some(PathMatch::Regex(
            anchored_regex(&r).map_err(|_| InvalidConditions::Regex(r))?,
        )),
    };
    Ok(matches)
}

/// Joins two path prefixes with exactly one `/`. A trailing `/` prefix adds
/// nothing.
pub(crate) fn join(parent: &str, child: &str) -> String {
    if child.is_empty() || child == "/" {
        return parent.to_string();
    }
    if parent.is_empty() || parent == "/" {
        return child.to_string();
    }
    format!(
        "{}/{}",
        parent.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}

pub(crate) fn header_match(h: &HeaderMatchCondition) -> Result<HeaderMatch, InvalidConditions> {
    let name = HeaderName::from_bytes(h.name.to_ascii_lowercase().as_bytes())
        .map_err(|_| InvalidConditions::HeaderName(h.name.clone()))?;
    let regex = |r: &str| anchored_regex(r).map_err(|_| InvalidConditions::Regex(r.to_string()));
    let value = if h.present {
        HeaderValueMatch::Present
    } else if h.not_present {
        HeaderValueMatch::NotPresent
    } else if let Some(v) = &h.exact {
        HeaderValueMatch::Exact(v.clone())
    } else if let Some(v) = &h.not_exact {
        HeaderValueMatch::NotExact(v.clone())
    } else if let Some(v) = &h.contains {
        HeaderValueMatch::Contains(v.clone())
    } else if let Some(v) = &h.not_contains {
        HeaderValueMatch::NotContains(v.clone())
    } else if let Some(r) = &h.regex {
        HeaderValueMatch::Regex(regex(r)?)
    } else {
        return Err(InvalidConditions::NoOperator(h.name.clone()));
    };
    Ok(HeaderMatch {
        name,
        value,
        ignore_case: h.ignore_case,
        treat_missing_as_empty: h.treat_missing_as_empty,
    })
}

fn query_match(q: &QueryParameterMatchCondition) -> Result<QueryParamMatch, InvalidConditions> {
    let value = if q.present {
        QueryValueMatch::Present
    } else if let Some(v) = &q.exact {
        QueryValueMatch::Exact(v.clone())
    } else if let Some(v) = &q.prefix {
        QueryValueMatch::Prefix(v.clone())
    } else if let Some(v) = &q.suffix {
        QueryValueMatch::Suffix(v.clone())
    } else if let Some(v) = &q.contains {
        QueryValueMatch::Contains(v.clone())
    } else if let Some(r) = &q.regex {
        QueryValueMatch::Regex(anchored_regex(r).map_err(|_| InvalidConditions::Regex(r.clone()))?)
    } else {
        return Err(InvalidConditions::NoOperator(q.name.clone()));
    };
    Ok(QueryParamMatch {
        name: q.name.clone(),
        value,
        ignore_case: q.ignore_case,
    })
}

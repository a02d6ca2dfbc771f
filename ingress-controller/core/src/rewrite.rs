/// Replaces a matched path prefix before the request is forwarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixReplacement {
    /// The prefix to replace. When unset, the route's own prefix is used.
    pub prefix: Option<String>,
    pub replacement: String,
}

/// Rewrites `path` with the longest matching replacement.
///
/// Returns `None` when no replacement applies.
pub fn replace_prefix(
    path: &str,
    route_prefix: Option<&str>,
    replacements: &[PrefixReplacement],
) -> Option<String> {
    replacements
        .iter()
        .filter_map(|r| {
            let prefix = r.prefix.as_deref().or(route_prefix)?;
            let remainder = path.strip_prefix(prefix)?;
            Some((prefix.len(), remainder, r.replacement.as_str()))
        })
        .max_by_key(|(len, _, _)| *len)
        .map(|(_, remainder, replacement)| join(replacement, remainder))
}

/// Joins a replacement prefix with the remainder of a path so that exactly
/// one `/` separates them.
///
/// An empty remainder yields the replacement unchanged; a remainder that was
/// only `/` keeps its trailing slash.
pub fn join(replacement: &str, remainder: &str) -> String {
    if remainder.is_empty() {
        return if replacement.is_empty() {
            "/".to_string()
        } else {
            replacement.to_string()
        };
    }
    let base = replacement.trim_end_matches('/');
    let rest = remainder.trim_start_matches('/');
    format!("{base}/{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rp(prefix: Option<&str>, replacement: &str) -> PrefixReplacement {
        PrefixReplacement {
            prefix: prefix.map(ToString::to_string),
            replacement: replacement.to_string(),
        }
    }

    #[test]
    fn replace_with_root() {
        let rules = [rp(None, "/")];
        let prefix = Some("/someprefix2");
        assert_eq!(
            replace_prefix("/someprefix2/segment", prefix, &rules).as_deref(),
            Some("/segment")
        );
        assert_eq!(
            replace_prefix("/someprefix2", prefix, &rules).as_deref(),
            Some("/")
        );
        assert_eq!(
            replace_prefix("/someprefix2/", prefix, &rules).as_deref(),
            Some("/")
        );
    }

    #[test]
    fn trailing_slashes() {
        let rules = [rp(Some("/foo/"), "/bar")];
        assert_eq!(
            replace_prefix("/foo/baz", None, &rules).as_deref(),
            Some("/bar/baz")
        );
        assert_eq!(replace_prefix("/foo/", None, &rules).as_deref(), Some("/bar"));

        let rules = [rp(Some("/foo"), "/bar/")];
        assert_eq!(
            replace_prefix("/foo/baz", None, &rules).as_deref(),
            Some("/bar/baz")
        );
        assert_eq!(
            replace_prefix("/foo/", None, &rules).as_deref(),
            Some("/bar/")
        );
        assert_eq!(replace_prefix("/foo", None, &rules).as_deref(), Some("/bar/"));
    }

    #[test]
    fn longest_prefix_wins() {
        let rules = [rp(Some("/api"), "/v1"), rp(Some("/api/admin"), "/admin")];
        assert_eq!(
            replace_prefix("/api/admin/users", None, &rules).as_deref(),
            Some("/admin/users")
        );
        assert_eq!(
            replace_prefix("/api/users", None, &rules).as_deref(),
            Some("/v1/users")
        );
        assert_eq!(replace_prefix("/other", None, &rules), None);
    }

    #[test]
    fn no_route_prefix() {
        assert_eq!(replace_prefix("/a", None, &[rp(None, "/b")]), None);
    }
}

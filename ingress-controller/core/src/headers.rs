use http::{header, HeaderMap, HeaderName, HeaderValue};

/// Header mutations applied to a request or a response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeadersPolicy {
    pub set: Vec<(HeaderName, HeaderTemplate)>,
    pub remove: Vec<HeaderName>,
}

/// A header value that may reference request headers with `%REQ(Name)%`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderTemplate {
    parts: Vec<Part>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Part {
    Literal(String),
    Request(HeaderName),
}

// === impl HeadersPolicy ===

impl HeadersPolicy {
    /// The template that rewrites the `Host` header, if any.
    pub fn host_rewrite(&self) -> Option<&HeaderTemplate> {
        self.set
            .iter()
            .find(|(name, _)| name == header::HOST)
            .map(|(_, tpl)| tpl)
    }

    /// Removes, then sets, headers on `headers`. Templates are rendered
    /// against `request`.
    pub fn apply(&self, headers: &mut HeaderMap, request: &HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, tpl) in &self.set {
            // Rendered values that are not valid header values are dropped.
            if let Ok(value) = HeaderValue::from_str(&tpl.render(request)) {
                headers.insert(name.clone(), value);
            }
        }
    }
}

// === impl HeaderTemplate ===

impl HeaderTemplate {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Literal(value.into())],
        }
    }

    /// Parses `%REQ(Name)%` references. Anything that is not a well-formed
    /// reference is kept literally.
    pub fn parse(s: &str) -> Self {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("%REQ(") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + "%REQ(".len()..];
            let reference = after
                .find(")%")
                .and_then(|end| Some((HeaderName::try_from(&after[..end]).ok()?, end)));
            match reference {
                Some((name, end)) => {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Request(name));
                    rest = &after[end + 2..];
                }
                None => {
                    literal.push_str("%REQ(");
                    rest = after;
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Self { parts }
    }

    /// Renders the template; missing request headers render as empty.
    pub fn render(&self, request: &HeaderMap) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Request(name) => {
                    if let Some(v) = request.get(name).and_then(|v| v.to_str().ok()) {
                        out.push_str(v);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_request_references() {
        let mut req = HeaderMap::new();
        req.insert("x-host", "templated.example.com".parse().unwrap());
        req.insert("x-a", "a".parse().unwrap());

        let tpl = HeaderTemplate::parse("%REQ(X-Host)%");
        assert_eq!(tpl.render(&req), "templated.example.com");

        let tpl = HeaderTemplate::parse("pre-%REQ(x-a)%-%REQ(x-missing)%-post");
        assert_eq!(tpl.render(&req), "pre-a--post");
    }

    #[test]
    fn malformed_references_are_literal() {
        let req = HeaderMap::new();
        for s in ["%REQ(x-a", "%REQ(bad header)%", "100%", "%REQ()%"] {
            let tpl = HeaderTemplate::parse(s);
            assert_eq!(tpl.render(&req), s);
        }
    }

    #[test]
    fn applies_removes_then_sets() {
        let policy = HeadersPolicy {
            set: vec![
                (
                    HeaderName::from_static("x-set"),
                    HeaderTemplate::literal("set"),
                ),
                (
                    HeaderName::from_static("x-copy"),
                    HeaderTemplate::parse("%REQ(x-source)%"),
                ),
            ],
            remove: vec![HeaderName::from_static("x-remove")],
        };
        let mut req = HeaderMap::new();
        req.insert("x-source", "copied".parse().unwrap());
        req.insert("x-remove", "gone".parse().unwrap());
        req.insert("x-set", "old".parse().unwrap());

        let mut headers = req.clone();
        policy.apply(&mut headers, &req);
        assert_eq!(headers.get("x-set").unwrap(), "set");
        assert_eq!(headers.get("x-copy").unwrap(), "copied");
        assert!(headers.get("x-remove").is_none());
        assert!(policy.host_rewrite().is_none());
    }

    #[test]
    fn finds_host_rewrites() {
        let policy = HeadersPolicy {
            set: vec![(header::HOST, HeaderTemplate::parse("%REQ(x-host)%"))],
            remove: vec![],
        };
        let mut req = HeaderMap::new();
        req.insert("x-host", "internal.example.com".parse().unwrap());
        let rewrite = policy.host_rewrite().expect("host is rewritten");
        assert_eq!(rewrite.render(&req), "internal.example.com");
    }
}

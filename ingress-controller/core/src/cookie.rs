use std::{fmt, str::FromStr};

/// Overrides attributes of `Set-Cookie` headers for a named cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieRewrite {
    pub name: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub same_site: Option<SameSite>,
    pub secure: Option<bool>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported SameSite value: {0}")]
pub struct InvalidSameSite(String);

/// Applies the first rule matching the cookie's name to a `Set-Cookie`
/// value.
///
/// Returns `None` when no rule names this cookie. Attributes not managed by
/// the rule are preserved in order; empty attributes are dropped.
pub fn rewrite_set_cookie(value: &str, rules: &[CookieRewrite]) -> Option<String> {
    let mut segments = value.split(';');
    let pair = segments.next()?.trim();
    let name = pair.split_once('=').map_or(pair, |(n, _)| n).trim();
    let rule = rules.iter().find(|r| r.name == name)?;

    let mut out = vec![pair.to_string()];
    let mut seen_path = false;
    let mut seen_domain = false;
    let mut seen_same_site = false;
    let mut seen_secure = false;

    for attr in segments.map(str::trim).filter(|a| !a.is_empty()) {
        let key = attr.split_once('=').map_or(attr, |(k, _)| k).trim();
        if key.eq_ignore_ascii_case("path") {
            seen_path = true;
            match &rule.path {
                Some(path) => out.push(format!("Path={path}")),
                None => out.push(attr.to_string()),
            }
        } else if key.eq_ignore_ascii_case("domain") {
            seen_domain = true;
            match &rule.domain {
                Some(domain) => out.push(format!("Domain={domain}")),
                None => out.push(attr.to_string()),
            }
        } else if key.eq_ignore_ascii_case("samesite") {
            seen_same_site = true;
            match rule.same_site {
                Some(ss) => out.push(format!("SameSite={ss}")),
                None => out.push(attr.to_string()),
            }
        } else if key.eq_ignore_ascii_case("secure") {
            seen_secure = true;
            if rule.secure != Some(false) {
                out.push(attr.to_string());
            }
        } else {
            out.push(attr.to_string());
        }
    }

    if let (false, Some(path)) = (seen_path, &rule.path) {
        out.push(format!("Path={path}"));
    }
    if let (false, Some(domain)) = (seen_domain, &rule.domain) {
        out.push(format!("Domain={domain}"));
    }
    if let (false, Some(ss)) = (seen_same_site, rule.same_site) {
        out.push(format!("SameSite={ss}"));
    }
    if !seen_secure && rule.secure == Some(true) {
        out.push("Secure".to_string());
    }

    Some(out.join("; "))
}

// === impl SameSite ===

impl FromStr for SameSite {
    type Err = InvalidSameSite;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Strict" => Ok(Self::Strict),
            "Lax" => Ok(Self::Lax),
            "None" => Ok(Self::None),
            s => Err(InvalidSameSite(s.to_string())),
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        })
    }
}

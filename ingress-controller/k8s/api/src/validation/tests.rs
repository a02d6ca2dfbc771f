use super::*;

fn parse(yaml: &str) -> HttpProxySpec {
    serde_yaml::from_str(yaml).expect("spec must parse")
}

fn errors(yaml: &str) -> Vec<FieldError> {
    match validate(&parse(yaml)) {
        Ok(()) => vec![],
        Err(FieldErrors(errors)) => errors,
    }
}

fn single(yaml: &str) -> FieldError {
    let mut errors = errors(yaml);
    assert_eq!(errors.len(), 1, "{errors:?}");
    errors.remove(0)
}

#[test]
fn accepts_valid_proxy() {
    let errors = errors(
        r#"
virtualhost:
  fqdn: "*.example.com"
  tls:
    secretName: cert
    minimumProtocolVersion: "1.3"
  ipAllowPolicy:
    - source: Peer
      cidr: 10.0.0.0/8
    - source: Remote
      cidr: 192.168.1.1
routes:
  - conditions:
      - prefix: /
      - header:
          name: x-foo
          regex: "b.*"
    services:
      - name: echo
        port: 80
        validation:
          caSecret: ca
          subjectName: echo.example.com
          subjectNames: [echo.example.com, alt.example.com]
    retryPolicy:
      retryOn: [5xx, retriable-status-codes]
      retriableStatusCodes: [503]
    cookieRewritePolicies:
      - name: session
        sameSite: Lax
    rateLimitPolicy:
      vhostRateLimits: Ignore
      local:
        requests: 10
        unit: minute
"#,
    );
    assert_eq!(errors, vec![]);
}

#[test]
fn rejects_bare_wildcard_fqdn() {
    for fqdn in ["*", "*.", "Example.com", "foo..com"] {
        let err = single(&format!("virtualhost:\n  fqdn: \"{fqdn}\"\n"));
        assert_eq!(err.field, "spec.virtualhost.fqdn");
        assert_eq!(err.reason, Reason::Invalid);
    }
}

#[test]
fn rejects_unsupported_retry_on() {
    let err = single(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    retryPolicy:
      retryOn: [6xx]
"#,
    );
    assert_eq!(err.field, "spec.routes[0].retryPolicy.retryOn[0]");
    assert_eq!(err.reason, Reason::Unsupported);
    assert!(err.to_string().starts_with(
        "spec.routes[0].retryPolicy.retryOn[0]: Unsupported value: \"6xx\": supported values:"
    ));
}

#[test]
fn rejects_invalid_same_site() {
    let err = single(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    cookieRewritePolicies:
      - name: session
        sameSite: Sometimes
"#,
    );
    assert_eq!(err.field, "spec.routes[0].cookieRewritePolicies[0].sameSite");
    assert_eq!(err.reason, Reason::Unsupported);
}

#[test]
fn rejects_redirect_with_path_and_prefix() {
    let err = single(
        r#"
routes:
  - requestRedirectPolicy:
      path: /foo
      prefix: /bar
"#,
    );
    assert_eq!(err.field, "spec.routes[0].requestRedirectPolicy");
    assert_eq!(err.reason, Reason::Invalid);
}

#[test]
fn rejects_redirect_status_code() {
    let err = single(
        r#"
routes:
  - requestRedirectPolicy:
      statusCode: 304
"#,
    );
    assert_eq!(err.field, "spec.routes[0].requestRedirectPolicy.statusCode");
    assert_eq!(err.reason, Reason::Unsupported);
}

#[test]
fn rejects_service_port_out_of_range() {
    for port in [0, 65536] {
        let err = single(&format!(
            "routes:\n  - services: [{{name: echo, port: {port}}}]\n"
        ));
        assert_eq!(err.field, "spec.routes[0].services[0].port");
        assert_eq!(err.reason, Reason::Invalid);
    }
}

#[test]
fn rejects_direct_response_status() {
    let err = single(
        r#"
routes:
  - directResponsePolicy:
      statusCode: 100
"#,
    );
    assert_eq!(err.field, "spec.routes[0].directResponsePolicy.statusCode");
}

#[test]
fn rejects_ip_filter_source_and_cidr() {
    let errors = errors(
        r#"
virtualhost:
  fqdn: example.com
  ipDenyPolicy:
    - source: Client
      cidr: 10.0.0.0/33
"#,
    );
    let fields = errors.iter().map(|e| e.field.as_str()).collect::<Vec<_>>();
    assert_eq!(
        fields,
        vec![
            "spec.virtualhost.ipDenyPolicy[0].source",
            "spec.virtualhost.ipDenyPolicy[0].cidr",
        ]
    );
}

#[test]
fn subject_names_must_lead_with_subject_name() {
    let err = single(
        r#"
routes:
  - services:
      - name: echo
        port: 443
        protocol: tls
        validation:
          caSecret: ca
          subjectName: a.example.com
          subjectNames: [b.example.com, a.example.com]
"#,
    );
    assert_eq!(err.field, "spec.routes[0].services[0].validation.subjectNames");

    let err = single(
        r#"
routes:
  - services:
      - name: echo
        port: 443
        validation:
          caSecret: ca
          subjectNames: [b.example.com]
"#,
    );
    assert_eq!(err.field, "spec.routes[0].services[0].validation.subjectName");
    assert_eq!(err.reason, Reason::Required);
    assert_eq!(
        err.to_string(),
        "spec.routes[0].services[0].validation.subjectName: Required value"
    );
}

#[test]
fn rejects_local_rate_limit_values() {
    let errors = errors(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    rateLimitPolicy:
      vhostRateLimits: Sometimes
      local:
        requests: 0
        unit: day
"#,
    );
    let fields = errors.iter().map(|e| e.field.as_str()).collect::<Vec<_>>();
    assert_eq!(
        fields,
        vec![
            "spec.routes[0].rateLimitPolicy.local.requests",
            "spec.routes[0].rateLimitPolicy.local.unit",
            "spec.routes[0].rateLimitPolicy.vhostRateLimits",
        ]
    );
}

#[test]
fn conditions_set_exactly_one_field() {
    let err = single(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    conditions:
      - prefix: /foo
        exact: /foo
"#,
    );
    assert_eq!(err.field, "spec.routes[0].conditions[0]");

    let err = single(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    conditions:
      - header:
          name: x-foo
          present: true
          exact: bar
"#,
    );
    assert_eq!(err.field, "spec.routes[0].conditions[0].header");

    let err = single(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    conditions:
      - regex: "/(foo"
"#,
    );
    assert_eq!(err.field, "spec.routes[0].conditions[0].regex");
}

#[test]
fn rejects_multiple_actions() {
    let err = single(
        r#"
routes:
  - services: [{name: echo, port: 80}]
    directResponsePolicy:
      statusCode: 200
"#,
    );
    assert_eq!(err.field, "spec.routes[0]");
}

#[test]
fn requires_ca_unless_skipping_verification() {
    let err = single(
        r#"
virtualhost:
  fqdn: example.com
  tls:
    secretName: cert
    clientValidation:
      optionalClientCertificate: true
"#,
    );
    assert_eq!(err.field, "spec.virtualhost.tls.clientValidation.caSecret");

    assert_eq!(
        errors(
            r#"
virtualhost:
  fqdn: example.com
  tls:
    secretName: cert
    clientValidation:
      skipClientCertValidation: true
"#
        ),
        vec![]
    );
}

#[test]
fn parses_cidrs() {
    assert_eq!(
        parse_cidr("10.1.2.3"),
        Some("10.1.2.3/32".parse().unwrap())
    );
    assert_eq!(parse_cidr("::1"), Some("::1/128".parse().unwrap()));
    assert_eq!(parse_cidr("10.0.0.0/8"), Some("10.0.0.0/8".parse().unwrap()));
    assert_eq!(parse_cidr("nope"), None);
}

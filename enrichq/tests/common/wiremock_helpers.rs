use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const LOOKUP_PATH: &str = "/v1/lookup";
pub const PROBE_PATH: &str = "/v1/me";

/// Lookup URL template served by `server`
pub fn lookup_template(server: &MockServer) -> String {
    format!("{}{}?email={{identifier}}", server.uri(), LOOKUP_PATH)
}

pub fn probe_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), PROBE_PATH)
}

/// Answers the probe endpoint with 200 for `token` and 401 for everything else.
pub async fn mount_probe(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path(PROBE_PATH))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "me"})))
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(PROBE_PATH))
        .respond_with(ResponseTemplate::new(401))
        .with_priority(5)
        .mount(server)
        .await;
}

/// Serves `profile` as the lookup payload for one identifier
pub async fn mount_profile(server: &MockServer, identifier: &str, profile: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(LOOKUP_PATH))
        .and(query_param("email", identifier))
        .respond_with(ResponseTemplate::new(200).set_body_json(profile))
        .with_priority(1)
        .mount(server)
        .await;
}

/// Every other lookup succeeds without usable data
pub async fn mount_empty_lookups(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(LOOKUP_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .with_priority(5)
        .mount(server)
        .await;
}

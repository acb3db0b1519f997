//! Route resolution behavior against a live registry

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use madang::action::{Action, ActionContext, ActionError};
use madang::connection::Connection;
use madang::registry::{ApiRegistry, RegistryBuilder};
use madang::routes::table::{RawRoute, RawRoutes, RouteTable};

macro_rules! noop_action {
    ($ty:ident, $name:literal) => {
        struct $ty;

        #[async_trait]
        impl Action for $ty {
            fn name(&self) -> &str {
                $name
            }

            async fn run(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
                Ok(())
            }
        }
    };
}

noop_action!(UserAction, "user");
noop_action!(WildAction, "wild");
noop_action!(LookupAction, "lookup");

fn registry() -> ApiRegistry {
    RegistryBuilder::new()
        .register_action(Arc::new(UserAction))
        .register_action(Arc::new(WildAction))
        .register_action(Arc::new(LookupAction))
        .build()
        .unwrap()
}

fn route(path: &str, action: &str) -> RawRoute {
    RawRoute {
        path: path.to_string(),
        action: Some(action.to_string()),
        api_version: None,
        match_trailing_path_parts: false,
        dir: None,
    }
}

fn table(raw: RawRoutes) -> RouteTable {
    let mut table = RouteTable::new();
    table.load_routes(Some(raw)).unwrap();
    table
}

fn connection() -> Arc<Connection> {
    Arc::new(Connection::new("web", "10.0.0.1", "routing-tests"))
}

fn parts(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn variable_segment_binds_param() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();

    assert!(
        table
            .process_route(&conn, &registry, "GET", &parts("/user/42"))
            .await
    );
    assert_eq!(conn.param("action").await, Some(json!("user")));
    assert_eq!(conn.param("userID").await, Some(json!("42")));
}

#[tokio::test]
async fn explicit_action_param_wins_over_routes() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();
    conn.set_param("action", json!("lookup")).await;

    assert!(
        table
            .process_route(&conn, &registry, "get", &parts("/user/42"))
            .await
    );
    // Routing was skipped entirely: no variable was bound
    assert_eq!(conn.param("action").await, Some(json!("lookup")));
    assert_eq!(conn.param("userID").await, None);
}

#[tokio::test]
async fn unknown_explicit_action_falls_through_to_routes() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();
    conn.set_param("action", json!("not_loaded")).await;

    assert!(
        table
            .process_route(&conn, &registry, "get", &parts("/user/42"))
            .await
    );
    assert_eq!(conn.param("action").await, Some(json!("user")));
}

#[tokio::test]
async fn trailing_path_capture_joins_remainder() {
    let registry = registry();
    let mut raw_route = route("/a/wild/:key/and/:path", "wild");
    raw_route.match_trailing_path_parts = true;
    let table = table(RawRoutes::from([(String::from("get"), vec![raw_route])]));
    let conn = connection();

    assert!(
        table
            .process_route(
                &conn,
                &registry,
                "get",
                &parts("/a/wild/theKey/and/some/more/path")
            )
            .await
    );
    assert_eq!(conn.param("key").await, Some(json!("theKey")));
    assert_eq!(conn.param("path").await, Some(json!("some/more/path")));
}

#[tokio::test]
async fn regex_constrained_segment_rejects_nonmatching() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route(r"/user/:userID(^(\d{3}|admin)$)", "user")],
    )]));
    let conn = connection();

    assert!(
        !table
            .process_route(&conn, &registry, "get", &parts("/user/1234"))
            .await
    );

    for ok in ["123", "admin"] {
        let conn = connection();
        assert!(
            table
                .process_route(&conn, &registry, "get", &parts(&format!("/user/{ok}")))
                .await,
            "expected /user/{ok} to match"
        );
        assert_eq!(conn.param("userID").await, Some(json!(ok)));
    }
}

#[tokio::test]
async fn head_falls_back_to_get_routes() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();

    assert!(
        table
            .process_route(&conn, &registry, "HEAD", &parts("/user/9"))
            .await
    );
    assert_eq!(conn.param("action").await, Some(json!("user")));
}

#[tokio::test]
async fn head_routes_suppress_get_fallback() {
    let registry = registry();
    let table = table(RawRoutes::from([
        (String::from("get"), vec![route("/user/:userID", "user")]),
        (String::from("head"), vec![route("/ping", "lookup")]),
    ]));
    let conn = connection();

    // A HEAD table exists, so GET routes are no longer consulted
    assert!(
        !table
            .process_route(&conn, &registry, "head", &parts("/user/9"))
            .await
    );
}

#[tokio::test]
async fn route_api_version_backfills_but_never_overrides() {
    let registry = registry();
    let mut versioned = route("/user/:userID", "user");
    versioned.api_version = Some(madang::action::ApiVersion::Number(2));
    let table = table(RawRoutes::from([(String::from("get"), vec![versioned])]));

    let conn = connection();
    table
        .process_route(&conn, &registry, "get", &parts("/user/1"))
        .await;
    assert_eq!(conn.param("apiVersion").await, Some(json!("2")));

    let conn = connection();
    conn.set_param("apiVersion", json!("7")).await;
    table
        .process_route(&conn, &registry, "get", &parts("/user/1"))
        .await;
    assert_eq!(conn.param("apiVersion").await, Some(json!("7")));
}

#[tokio::test]
async fn captured_values_are_url_decoded() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();

    table
        .process_route(&conn, &registry, "get", &parts("/user/jin+ho%20kim"))
        .await;
    assert_eq!(conn.param("userID").await, Some(json!("jin ho kim")));
}

#[tokio::test]
async fn malformed_encoding_keeps_raw_capture() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();

    table
        .process_route(&conn, &registry, "get", &parts("/user/bad%zzvalue"))
        .await;
    assert_eq!(conn.param("userID").await, Some(json!("bad%zzvalue")));
}

#[tokio::test]
async fn dir_route_sets_residual_file_path() {
    let registry = registry();
    let dir_route = RawRoute {
        path: String::from("/assets/:path"),
        action: None,
        api_version: None,
        match_trailing_path_parts: true,
        dir: Some(String::from("public")),
    };
    let table = table(RawRoutes::from([(String::from("get"), vec![dir_route])]));
    let conn = connection();

    assert!(
        table
            .process_route(&conn, &registry, "get", &parts("/assets/css/site.css"))
            .await
    );
    assert_eq!(conn.param("file").await, Some(json!("css/site.css")));
    assert_eq!(conn.param("action").await, None);
}

#[tokio::test]
async fn literal_segments_match_case_insensitively() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/User/:userID", "user")],
    )]));
    let conn = connection();

    assert!(
        table
            .process_route(&conn, &registry, "get", &parts("/uSeR/5"))
            .await
    );
}

#[tokio::test]
async fn first_registered_route_wins() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user"), route("/user/:other", "lookup")],
    )]));
    let conn = connection();

    table
        .process_route(&conn, &registry, "get", &parts("/user/5"))
        .await;
    assert_eq!(conn.param("action").await, Some(json!("user")));
}

#[tokio::test]
async fn matched_route_is_recorded_on_connection() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();

    table
        .process_route(&conn, &registry, "get", &parts("/user/5"))
        .await;
    let matched = conn.matched_route().await.unwrap();
    assert_eq!(matched.path, "/user/:userID");
    assert_eq!(matched.verb, "get");
}

#[tokio::test]
async fn no_route_means_no_action() {
    let registry = registry();
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    let conn = connection();

    assert!(
        !table
            .process_route(&conn, &registry, "post", &parts("/user/5"))
            .await
    );
    assert_eq!(conn.param("action").await, None);
}

#[tokio::test]
async fn route_variables_survive_scrubbing() {
    let table = table(RawRoutes::from([(
        String::from("get"),
        vec![route("/user/:userID", "user")],
    )]));
    assert!(table.param_whitelist().contains("userID"));
}

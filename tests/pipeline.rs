use serde::Deserialize;
use serde_json::{json, Value};
use smelter::prelude::*;

fn init() {
    env_logger::builder().is_test(true).try_init().ok();
}

fn blog() -> Value {
    json!({
        "users": [
            {"id": "u1", "name": "Alice", "posts": [
                {"id": "p1", "title": "Hello", "tags": ["rust", "json"]},
                {"id": "p2", "title": "Again", "tags": ["rust"]}
            ]},
            {"id": "u2", "name": "Bob", "posts": []},
            {"id": null, "name": "Ghost", "posts": [{"id": "p9", "title": "Orphan", "tags": []}]}
        ]
    })
}

fn blog_spec() -> MappingSpec {
    MappingSpec::new()
        .traversal(
            Traversal::new(Program::new().descend("users").each())
                .emit(
                    TableEmit::new("users")
                        .field("id", get_or_null("id"))
                        .field("name", get("name"))
                        .merged("post_count", len_of(get("posts")), MergePolicy::Add)
                        .join_on(["id"]),
                )
                .nest(
                    Traversal::new(Program::new().descend("posts").each())
                        .emit(
                            TableEmit::new("posts")
                                .field("id", get("id"))
                                .field("title", get("title"))
                                .temp("author", get_from_parent("id", 1))
                                .join_on(["id"]),
                        )
                        .nest(
                            Traversal::new(Program::new().descend("tags").each()).emit(
                                TableEmit::new("tags")
                                    .field("name", node())
                                    .merged("posts", get_from_parent("id", 1), MergePolicy::Append)
                                    .join_on(["name"]),
                            ),
                        ),
                ),
        )
        .link(RelationshipBinding::new("posts", "users").on("author", "id"))
}

#[derive(Debug, Deserialize, PartialEq)]
struct Tag {
    name: String,
    posts: Vec<String>,
}

#[test]
fn test_blog_end_to_end() {
    init();
    let result = run_mapping(&blog(), blog_spec()).unwrap();

    // the null-keyed user is nowhere, its post is unbound
    let users = materialize(&result, "users", &MapBuilder).unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[&JoinKey::from(vec!["u1"])]["post_count"], json!(2));
    assert_eq!(users[&JoinKey::from(vec!["u2"])]["post_count"], json!(0));

    assert_eq!(result.table("posts").unwrap().len(), 3);
    assert_eq!(
        result.parent_of("posts", &JoinKey::from(vec!["p2"]), "users"),
        Some(&JoinKey::from(vec!["u1"]))
    );
    assert_eq!(result.parent_of("posts", &JoinKey::from(vec!["p9"]), "users"), None);
    assert_eq!(result.error_count(), 0);

    let tags = materialize(&result, "tags", &TypedBuilder::<Tag>::new()).unwrap();
    let tags: Vec<Tag> = tags.into_values().collect();
    assert_eq!(
        tags,
        vec![
            Tag { name: "rust".into(), posts: vec!["p1".into(), "p2".into()] },
            Tag { name: "json".into(), posts: vec!["p1".into()] },
        ]
    );
}

#[test]
fn test_unresolved_parent_is_reported_and_child_kept() {
    init();
    let data = json!({
        "users": [{"id": "u1"}],
        "posts": [{"id": "p1", "user": "u1"}, {"id": "p2", "user": "u7"}]
    });
    let spec = MappingSpec::new()
        .traversal(
            Traversal::new(Program::new().descend("posts").each()).emit(
                TableEmit::new("posts").field("id", get("id")).field("user_id", get("user")).join_on(["id"]),
            ),
        )
        .traversal(
            Traversal::new(Program::new().descend("users").each())
                .emit(TableEmit::new("users").field("id", get("id")).join_on(["id"])),
        )
        .link(RelationshipBinding::new("posts", "users").on("user_id", "id"));
    let result = run_mapping(&data, spec).unwrap();

    assert_eq!(result.order, vec!["users", "posts"]);
    assert_eq!(result.table("posts").unwrap().len(), 2);
    let messages = result.error_messages();
    let p2 = &messages["posts"][&JoinKey::from(vec!["p2"])];
    assert_eq!(p2.len(), 1);
    assert!(p2[0].contains("users"));
}

#[test]
fn test_bind_step_feeds_slots_to_descendants() {
    init();
    let data = json!({"batch": "b-7", "rows": [{"v": 1}, {"v": 2}]});
    let spec = MappingSpec::new().traversal(
        Traversal::new(Program::new().bind("batch", get("batch")).descend("rows").each()).emit(
            TableEmit::new("rows")
                .field("id", format_id(vec![slot("batch"), index()], "-"))
                .field("v", get("v"))
                .join_on(["id"]),
        ),
    );
    let result = run_mapping(&data, spec).unwrap();
    let ids: Vec<String> = result.table("rows").unwrap().keys().map(|k| k.to_string()).collect();
    assert_eq!(ids, vec!["(\"b-7-0\",)", "(\"b-7-1\",)"]);
}

#[test]
fn test_custom_transform_factory() {
    init();
    let upper = factory("upper", |ctx, field: &String| {
        let v = get(field.as_str()).evaluate(ctx)?;
        Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
    });
    let data = json!({"items": [{"code": "ab"}]});
    let spec = MappingSpec::new().traversal(
        Traversal::new(Program::new().descend("items").each()).emit(
            TableEmit::new("items")
                .field("code", get("code"))
                .field("shout", upper("code".to_string()))
                .join_on(["code"]),
        ),
    );
    let result = run_mapping(&data, spec).unwrap();
    let row = result.row("items", &JoinKey::from(vec!["ab"])).unwrap();
    assert_eq!(row.fields["shout"], json!("AB"));
}

#[test]
fn test_persist_to_stream_in_parent_order() {
    init();
    let result = run_mapping(&blog(), blog_spec()).unwrap();

    let mut buffer = Vec::new();
    let mut sink = StreamWriter::new(&mut buffer);
    let written = persist(&result, &mut sink, DEFAULT_BATCH_SIZE).unwrap();
    sink.flush().unwrap();

    let lines: Vec<Value> = String::from_utf8(buffer)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(written, lines.len());
    assert_eq!(written, 7);

    let tables: Vec<&str> = lines.iter().map(|l| l["_table"].as_str().unwrap()).collect();
    let first_post = tables.iter().position(|t| *t == "posts").unwrap();
    assert!(tables[..first_post].contains(&"users"));
    assert!(!tables[first_post..].contains(&"users"));

    let p1 = lines.iter().find(|l| l["_key"] == json!(["p1"])).unwrap();
    assert_eq!(p1["_parents"], json!([{"table": "users", "key": ["u1"]}]));
    assert!(p1.get("author").is_none());
}

use super::*;

fn yaml_target(id: &str, collections: &str) -> String {
    format!(
        "  - id: \"{id}\"\n    platform: tiktok\n    collections: {collections}\n"
    )
}

#[test]
fn parses_minimal_targets() {
    let yaml = format!("targets:\n{}", yaml_target("creator_1", "[posts, followers]"));
    let file = parse_targets(&yaml).unwrap();
    assert_eq!(file.targets.len(), 1);
    assert_eq!(
        file.targets[0].collections,
        vec![CollectionType::Posts, CollectionType::Followers]
    );
    assert!(file.targets[0].endpoint.is_none());
}

#[test]
fn parses_endpoint_with_defaults() {
    let yaml = r"
targets:
  - id: creator_1
    platform: tiktok
    collections: [posts]
    endpoint:
      url: https://api.example.com/{target}/{collection}
      items_pointer: /data/items
      cursor_pointer: /data/cursor
      has_more_pointer: /data/has_more
      fields:
        external_id: /id
        text: /desc
";
    let file = parse_targets(yaml).unwrap();
    let endpoint = file.targets[0].endpoint.as_ref().unwrap();
    assert_eq!(endpoint.cursor_param, "cursor");
    assert!(endpoint.query.is_empty());
    assert_eq!(endpoint.fields.external_id.as_deref(), Some("/id"));
    assert_eq!(endpoint.fields.views, None);
    assert_eq!(
        endpoint.url_for("creator_1", CollectionType::Posts),
        "https://api.example.com/creator_1/posts"
    );
}

const COMMENTS_WITH_REPLIES: &str = r"
targets:
  - id: '7300000000000000001'
    platform: tiktok
    collections: [comments]
    endpoint:
      url: https://api.example.com/comments
      items_pointer: /comments
      replies:
        url: https://api.example.com/comments/{parent}/replies
        query:
          comment_id: '{parent}'
          count: '50'
        items_pointer: /comments
        fields:
          external_id: /cid
";

#[test]
fn parses_reply_endpoint() {
    let file = parse_targets(COMMENTS_WITH_REPLIES).unwrap();
    let replies = file.targets[0]
        .endpoint
        .as_ref()
        .and_then(|e| e.replies.as_deref())
        .expect("replies endpoint");

    assert_eq!(replies.url, "https://api.example.com/comments/{parent}/replies");
    assert_eq!(
        replies.query.get("comment_id").map(String::as_str),
        Some("{parent}")
    );
    assert_eq!(replies.cursor_param, "cursor");
    assert_eq!(replies.fields.external_id.as_deref(), Some("/cid"));
    assert!(replies.replies.is_none());
}

#[test]
fn rejects_replies_on_a_profile_collection() {
    let yaml = COMMENTS_WITH_REPLIES.replace("[comments]", "[posts]");
    let err = parse_targets(&yaml).unwrap_err();
    assert!(err.to_string().contains("only a comments endpoint"), "got: {err}");
}

#[test]
fn rejects_reply_endpoint_with_bad_items_pointer() {
    let yaml = COMMENTS_WITH_REPLIES.replacen(
        "        items_pointer: /comments",
        "        items_pointer: comments",
        1,
    );
    let err = parse_targets(&yaml).unwrap_err();
    assert!(err.to_string().contains("items_pointer"), "got: {err}");
}

#[test]
fn rejects_empty_id() {
    let yaml = format!("targets:\n{}", yaml_target(" ", "[posts]"));
    assert!(matches!(
        parse_targets(&yaml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn rejects_empty_collections() {
    let yaml = format!("targets:\n{}", yaml_target("creator_1", "[]"));
    let err = parse_targets(&yaml).unwrap_err();
    assert!(err.to_string().contains("no collections"), "got: {err}");
}

#[test]
fn rejects_duplicate_targets() {
    let yaml = format!(
        "targets:\n{}{}",
        yaml_target("creator_1", "[posts]"),
        yaml_target("creator_1", "[followers]")
    );
    let err = parse_targets(&yaml).unwrap_err();
    assert!(err.to_string().contains("duplicate target"), "got: {err}");
}

#[test]
fn rejects_comments_mixed_with_profile_collections() {
    let yaml = format!("targets:\n{}", yaml_target("creator_1", "[posts, comments]"));
    assert!(parse_targets(&yaml).is_err());
}

#[test]
fn rejects_unknown_collection() {
    let yaml = format!("targets:\n{}", yaml_target("creator_1", "[stories]"));
    assert!(matches!(
        parse_targets(&yaml),
        Err(ConfigError::TargetsFileParse(_))
    ));
}

#[test]
fn load_targets_reports_missing_file() {
    let err = load_targets(Path::new("/nonexistent/targets.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::TargetsFileIo { .. }));
}

//! Integration tests for image validation against allow-lists loaded from settings

use anyhow::Result;
use rigger_core::events::EventLog;
use rigger_core::image::ImageValidator;
use rigger_core::settings::Settings;

fn validator_from(toml: &str) -> Result<(ImageValidator, rigger_core::events::MemoryEmitter)> {
    let settings = Settings::parse(toml)?;
    let (events, memory) = EventLog::memory();
    let validator = ImageValidator::new(settings.docker.registry_alias.clone(), events)
        .with_allow_list(settings.docker.allowed_images.iter());
    Ok((validator, memory))
}

#[test]
fn test_wildcard_allows_untagged_image() -> Result<()> {
    let (validator, _) = validator_from(
        r#"
[docker.allowed_images]
myapp = ["*"]
"#,
    )?;
    assert_eq!(validator.validate("myapp").as_deref(), Some("myapp:latest"));
    Ok(())
}

#[test]
fn test_unlisted_tag_rejected_with_allowed_set() -> Result<()> {
    let (validator, memory) = validator_from(
        r#"
[docker.allowed_images]
myapp = ["v1"]
"#,
    )?;
    assert_eq!(validator.validate("myapp:v2"), None);

    let event = memory
        .messages()
        .into_iter()
        .find(|e| e.message() == Some("Docker image myapp:v2 is not allowed"))
        .expect("rejection event");
    assert_eq!(
        event.context().expect("context")["allowed"],
        serde_json::json!(["myapp:v1"])
    );
    Ok(())
}

#[test]
fn test_empty_allow_list_returns_rewritten_input() -> Result<()> {
    let (validator, memory) = validator_from(
        r#"
[docker.registry_alias]
from = "easy"
to = "registry.internal:5000"
"#,
    )?;
    for (requested, expected) in [
        ("easy/shop:3", "registry.internal:5000/shop:3"),
        ("debian", "debian"),
        ("ghcr.io/acme/tool@sha256:abcd", "ghcr.io/acme/tool@sha256:abcd"),
    ] {
        assert_eq!(validator.validate(requested).as_deref(), Some(expected));
    }
    assert!(memory.messages().is_empty());
    Ok(())
}

#[test]
fn test_alias_applies_to_allow_list_keys() -> Result<()> {
    let (validator, _) = validator_from(
        r#"
[docker.registry_alias]
from = "easy"
to = "registry.internal:5000"

[docker.allowed_images]
"easy/shop" = ["3", "4"]
"#,
    )?;
    assert_eq!(
        validator.validate("easy/shop:4").as_deref(),
        Some("registry.internal:5000/shop:4")
    );
    assert_eq!(
        validator.validate("registry.internal:5000/shop:3").as_deref(),
        Some("registry.internal:5000/shop:3")
    );
    assert_eq!(validator.validate("easy/shop:5"), None);
    Ok(())
}

#[test]
fn test_membership_over_repos_and_tags() -> Result<()> {
    let (validator, _) = validator_from(
        r#"
[docker.allowed_images]
node = ["18", "20"]
gcc = ["*"]
"#,
    )?;
    let cases = [
        ("node:18", true),
        ("node:20", true),
        ("node:21", false),
        ("node", false),
        ("gcc:13", true),
        ("gcc", true),
        ("python:3.12", false),
    ];
    for (image, allowed) in cases {
        assert_eq!(
            validator.validate(image).is_some(),
            allowed,
            "unexpected result for {}",
            image
        );
    }
    Ok(())
}

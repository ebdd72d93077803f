// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{commit_messages, MachineFixture, UpstreamFixture};

use anyhow::Result;
use genstore::{
    generation::{ENV_DIR, MANIFEST_JSON, MANIFEST_TOML},
    registry::parse_path,
    repository::METADATA_FILE,
    store::Error,
    vcs::{PushMode, VersionControl},
    ChangeKind, GenerationId, Outcome,
};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{
    fs::{create_dir_all, read_link, write},
    path::PathBuf,
};

#[test]
fn generation_lifecycle_on_git() -> Result<()> {
    let machine = MachineFixture::new(None)?;
    let store = machine.store();
    let context = machine.context();
    store.init(&context)?;

    let hello = machine.source("hello")?;
    let cowsay = machine.source("hello cowsay")?;
    assert_eq!(
        store.commit_dir(&context, hello.path(), "install hello", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(1))
    );
    assert_eq!(
        store.commit_dir(&context, hello.path(), "install hello", ChangeKind::Packages)?,
        Outcome::NoOp
    );
    assert_eq!(
        store.commit_dir(&context, cowsay.path(), "install cowsay", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(2))
    );
    assert_eq!(
        store.rollback(&context)?,
        Outcome::SwitchedTo(GenerationId::new(1))
    );

    let link = machine.link_dir().join("alice").join(context.link_name());
    assert_eq!(
        read_link(&link)?,
        PathBuf::from(context.generation_link_name(1))
    );

    assert_eq!(
        commit_messages(machine.repo_path(), &context.branch())?,
        vec![
            "switch to generation 1".to_string(),
            "install cowsay".to_string(),
            "install hello".to_string(),
            "Initialize environment x86_64-linux.default".to_string(),
        ]
    );

    assert_eq!(
        store.commit_dir(&context, cowsay.path(), "install cowsay again", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(3))
    );
    let generations = store.generations(&context)?;
    assert_eq!(generations.current(), Some(GenerationId::new(3)));
    assert_eq!(generations.len(), 3);

    Ok(())
}

#[test]
fn machines_share_history_through_upstream() -> Result<()> {
    let upstream = UpstreamFixture::new()?;
    let laptop = MachineFixture::new(Some(&upstream))?;
    let desktop = MachineFixture::new(Some(&upstream))?;
    let context = laptop.context();

    let hello = laptop.source("hello")?;
    assert_eq!(
        laptop
            .store()
            .commit_dir(&context, hello.path(), "install hello", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(1))
    );

    let cowsay = desktop.source("hello cowsay")?;
    assert_eq!(
        desktop
            .store()
            .commit_dir(&context, cowsay.path(), "install cowsay", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(2))
    );

    assert_eq!(
        commit_messages(upstream.path(), &context.branch())?.first(),
        Some(&"install cowsay".to_string())
    );

    Ok(())
}

#[test]
fn racing_machines_diverge_and_retry() -> Result<()> {
    let upstream = UpstreamFixture::new()?;
    let laptop = MachineFixture::new(Some(&upstream))?;
    let desktop = MachineFixture::new(Some(&upstream))?;
    let context = laptop.context();

    let hello = laptop.source("hello")?;
    laptop
        .store()
        .commit_dir(&context, hello.path(), "install hello", ChangeKind::Packages)?;

    let first = laptop.store().manager().begin(&context)?;
    let second = desktop.store().manager().begin(&context)?;
    assert_eq!(first.next_gen(), second.next_gen());
    for (transaction, manifest) in [(&first, "hello jq"), (&second, "hello git")] {
        let env = transaction.staging_dir().join(ENV_DIR);
        create_dir_all(&env)?;
        write(env.join(MANIFEST_TOML), manifest)?;
    }

    assert_eq!(
        first.build_and_commit("install jq", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(2))
    );
    assert_eq!(
        second.build_and_commit("install git", ChangeKind::Packages)?,
        Outcome::Diverged
    );
    assert!(!desktop
        .link_dir()
        .join("alice")
        .join(context.generation_link_name(2))
        .exists());

    let git = desktop.source("hello git")?;
    assert_eq!(
        desktop
            .store()
            .commit_dir(&context, git.path(), "install git", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(3))
    );

    Ok(())
}

#[test]
fn legacy_layout_is_migrated_before_commit() -> Result<()> {
    let machine = MachineFixture::new(None)?;
    let store = machine.store();
    let context = machine.context();
    let repository = store.manager().repository();
    repository.checkout(&context)?;

    let clone = tempfile::tempdir()?;
    let vcs = repository.vcs();
    vcs.clone_branch(repository.path(), &context.branch(), clone.path())?;
    create_dir_all(clone.path().join("1"))?;
    write(clone.path().join("1").join(MANIFEST_JSON), r#"{"elements":[]}"#)?;
    write(
        clone.path().join(METADATA_FILE),
        indoc! {r#"
            {
              "version": 1,
              "currentGen": 1,
              "generations": {
                "1": {
                  "path": "/nix/store/hello-env",
                  "description": "install hello",
                  "created": 0,
                  "lastActive": 0
                }
              }
            }
        "#},
    )?;
    vcs.commit_all(clone.path(), "legacy layout")?;
    vcs.push(clone.path(), &context.branch(), PushMode::FastForward)?;

    let cowsay = machine.source("hello cowsay")?;
    let result = store.commit_dir(&context, cowsay.path(), "install cowsay", ChangeKind::Packages);
    assert!(matches!(result, Err(Error::Migrated(_))));
    assert_eq!(
        commit_messages(machine.repo_path(), &context.branch())?.first(),
        Some(&"Migrate generation store 1→3 (001-nest-env-dir, 002-log-message-list)".to_string())
    );

    assert_eq!(
        store.commit_dir(&context, cowsay.path(), "install cowsay", ChangeKind::Packages)?,
        Outcome::Created(GenerationId::new(2))
    );
    assert_eq!(
        store
            .generations(&context)?
            .get(GenerationId::new(1))
            .map(|gen| gen.log_message.clone()),
        Some(vec!["install hello".to_string()])
    );

    Ok(())
}

#[test]
fn registry_edits_are_committed() -> Result<()> {
    let machine = MachineFixture::new(None)?;
    let store = machine.store();
    let context = machine.context();
    store.init(&context)?;

    let path = parse_path("settings.theme")?;
    assert_eq!(
        store.edit_registry(&context, "set theme", |registry| {
            registry.set_string(&path, "dark".into())
        })?,
        Outcome::Updated
    );
    assert_eq!(store.registry_get(&context, &path)?, serde_json::json!("dark"));
    assert_eq!(
        store.edit_registry(&context, "set theme", |registry| {
            registry.set_string(&path, "dark".into())
        })?,
        Outcome::NoOp
    );
    assert_eq!(
        commit_messages(machine.repo_path(), &context.branch())?.first(),
        Some(&"set theme".to_string())
    );

    Ok(())
}

//! End-to-end coverage of the stage executor against a fake agent
//! binary: render -> invoke -> validate -> retry-store bookkeeping,
//! without shelling out to any real coding-agent CLI.

use std::path::Path;

use autospec::agent::AgentPreset;
use autospec::stage;
use autospec_core::config::Configuration;
use autospec_core::context::Context;
use autospec_core::events::EventBus;
use autospec_core::retry::RetryStore;
use autospec_core::types::Stage;

fn write_fake_agent(dir: &Path, script: &str) -> AgentPreset {
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    AgentPreset::custom("fake", path.display().to_string(), None)
}

fn ctx_for(repo_root: &Path) -> Context {
    std::fs::create_dir_all(repo_root.join(".autospec")).unwrap();
    std::fs::write(
        repo_root.join(".autospec/constitution.yaml"),
        "_meta:\n  version: 1\n  created: 2026-08-01T00:00:00Z\n  artifact_type: constitution\nprinciples: []\n",
    )
    .unwrap();
    Context::compute(
        &repo_root.join("specs"),
        repo_root,
        false,
        Some("007-checkout-flow"),
        None,
        "0.2.0",
    )
    .unwrap()
}

#[tokio::test]
async fn run_stage_succeeds_when_agent_writes_valid_artifact() {
    let repo = tempfile::tempdir().unwrap();
    let ctx = ctx_for(repo.path());
    let preset = write_fake_agent(
        repo.path(),
        &format!(
            "mkdir -p {dir}\ncat > {dir}/spec.yaml <<'EOF'\n_meta:\n  version: 1\n  created: 2026-08-01T00:00:00Z\n  artifact_type: spec\ndescription: checkout flow\nEOF\n",
            dir = "specs/007-checkout-flow"
        ),
    );
    let config = Configuration::default();
    let retry_store = RetryStore::new(repo.path().join("retry.json"));
    let events = EventBus::new();
    let run_dir = repo.path().join("runs/007-checkout-flow");
    std::fs::create_dir_all(&run_dir).unwrap();

    let outcome = stage::run_stage(
        Stage::Specify,
        &ctx,
        &config,
        &preset,
        &retry_store,
        &events,
        &run_dir,
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.stage, Stage::Specify);
    assert_eq!(outcome.attempts, 1);
    assert!(ctx.feature_spec.exists());
    assert_eq!(retry_store.load(&ctx.feature_id, "specify").unwrap().attempt_count, 0);
}

#[tokio::test]
async fn run_stage_retries_then_exhausts_on_persistent_invalid_artifact() {
    let repo = tempfile::tempdir().unwrap();
    let ctx = ctx_for(repo.path());
    // Never writes plan.yaml, so validation always sees it missing.
    let preset = write_fake_agent(repo.path(), "true");
    let mut config = Configuration::default();
    config.max_retries = 2;
    let retry_store = RetryStore::new(repo.path().join("retry.json"));
    let events = EventBus::new();
    let run_dir = repo.path().join("runs/007-checkout-flow");
    std::fs::create_dir_all(&run_dir).unwrap();

    // Plan's prerequisites (constitution + spec) must exist first.
    std::fs::create_dir_all(&ctx.feature_dir).unwrap();
    std::fs::write(
        &ctx.feature_spec,
        "_meta:\n  version: 1\n  created: 2026-08-01T00:00:00Z\n  artifact_type: spec\ndescription: x\n",
    )
    .unwrap();

    let err = stage::run_stage(
        Stage::Plan,
        &ctx,
        &config,
        &preset,
        &retry_store,
        &events,
        &run_dir,
        None,
    )
    .await
    .unwrap_err();

    match err {
        autospec_core::error::AutospecError::RetryExhausted { attempts, .. } => {
            assert_eq!(attempts, 2);
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

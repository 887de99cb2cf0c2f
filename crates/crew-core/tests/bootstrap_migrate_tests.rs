//! Bootstrap idempotence, slug validation and filesystem migrations.

use std::sync::Arc;

use crew_core::bootstrap::{bootstrap, validate_team_name};
use crew_core::db::Db;
use crew_core::migrate::migrate_teams_to_projects;
use crew_core::paths;
use crew_core::types::AgentProfile;

fn open_db() -> Arc<Db> {
    let db = Db::open_in_memory().expect("open db");
    db.migrate().expect("migrate");
    Arc::new(db)
}

fn agents() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            name: "boss-bot".into(),
            role: "manager".into(),
            model: String::new(),
        },
        AgentProfile {
            name: "tyson".into(),
            role: "engineer".into(),
            model: "sonnet".into(),
        },
    ]
}

// ── Slug validation ───────────────────────────────────────────────────────

#[test]
fn valid_slugs_pass() {
    for name in ["myteam", "my-team", "my_team", "team2026", "0day"] {
        assert!(validate_team_name(name).is_ok(), "'{name}' should pass");
    }
}

#[test]
fn uppercase_and_punctuation_are_rejected_with_a_lowercase_hint() {
    for name in ["My Project", "TEAM", "a/b", "a.b", " lead", "-lead", ""] {
        let err = validate_team_name(name).unwrap_err();
        assert!(
            err.to_string().contains("lowercase"),
            "error for '{name}' should mention lowercase: {err}"
        );
    }
}

// ── Bootstrap ─────────────────────────────────────────────────────────────

#[test]
fn bootstrap_creates_team_layout_and_agent_files() {
    let home = tempfile::tempdir().unwrap();
    let db = open_db();
    bootstrap(home.path(), &db, "myteam", &agents()).unwrap();

    assert!(db.team_exists("myteam").unwrap());
    assert!(paths::workspaces_dir(home.path(), "myteam").is_dir());
    for agent in ["boss-bot", "tyson"] {
        assert!(paths::agent_bio_path(home.path(), "myteam", agent).is_file());
        assert!(paths::agent_context_path(home.path(), "myteam", agent).is_file());
        assert!(paths::agent_state_path(home.path(), "myteam", agent).is_file());
    }

    let roster = crew_core::config::read_roster(home.path(), "myteam").unwrap();
    assert_eq!(roster.len(), 2);
    assert_eq!(
        crew_core::config::team_manager(home.path(), "myteam").as_deref(),
        Some("boss-bot")
    );
}

#[test]
fn bootstrap_is_idempotent_and_preserves_existing_files() {
    let home = tempfile::tempdir().unwrap();
    let db = open_db();
    bootstrap(home.path(), &db, "myteam", &agents()).unwrap();

    // Simulate accumulated agent state between runs.
    let bio = paths::agent_bio_path(home.path(), "myteam", "tyson");
    std::fs::write(&bio, "CUSTOM BIO").unwrap();
    let context = paths::agent_context_path(home.path(), "myteam", "tyson");
    std::fs::write(&context, "remembered things").unwrap();

    bootstrap(home.path(), &db, "myteam", &agents()).unwrap();

    assert_eq!(std::fs::read_to_string(&bio).unwrap(), "CUSTOM BIO");
    assert_eq!(
        std::fs::read_to_string(&context).unwrap(),
        "remembered things"
    );
    assert_eq!(db.list_teams().unwrap(), ["myteam"]);
}

#[test]
fn bootstrap_rejects_invalid_slugs() {
    let home = tempfile::tempdir().unwrap();
    let db = open_db();
    assert!(bootstrap(home.path(), &db, "My Project", &agents()).is_err());
    assert!(db.list_teams().unwrap().is_empty());
}

// ── Repo registration ─────────────────────────────────────────────────────

#[test]
fn registering_the_same_path_twice_is_idempotent() {
    let home = tempfile::tempdir().unwrap();
    let db = open_db();
    bootstrap(home.path(), &db, "myteam", &agents()).unwrap();

    let checkout = home.path().join("checkout");
    std::fs::create_dir_all(&checkout).unwrap();

    let first = crew_core::bootstrap::register_repo(
        home.path(),
        &db,
        "myteam",
        &checkout,
        None,
        crew_core::types::Approval::Auto,
        Some("make test"),
    )
    .unwrap();
    let second = crew_core::bootstrap::register_repo(
        home.path(),
        &db,
        "myteam",
        &checkout,
        Some("other-name"),
        crew_core::types::Approval::Manual,
        None,
    )
    .unwrap();

    assert_eq!(first, second);
    assert_eq!(db.list_repos("myteam").unwrap().len(), 1);

    // Exactly one symlink, pointing at the checkout.
    let workspace = paths::workspaces_dir(home.path(), "myteam").join(&first);
    let entries: Vec<_> = std::fs::read_dir(&workspace)
        .unwrap()
        .flatten()
        .filter(|e| e.path().symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false))
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        std::fs::read_link(workspace.join("source")).unwrap(),
        std::fs::canonicalize(&checkout).unwrap()
    );
}

// ── migrate_teams_to_projects ─────────────────────────────────────────────

fn seed_legacy_layout(home: &std::path::Path) {
    let team = paths::legacy_teams_dir(home).join("myteam");
    std::fs::create_dir_all(team.join("agents").join("tyson")).unwrap();
    std::fs::create_dir_all(team.join("repos").join("myrepo")).unwrap();
    std::fs::write(team.join("agents").join("tyson").join("bio.md"), "bio").unwrap();
}

#[test]
fn legacy_layout_is_renamed() {
    let home = tempfile::tempdir().unwrap();
    seed_legacy_layout(home.path());

    let changed = migrate_teams_to_projects(home.path()).unwrap();
    assert!(changed);

    assert!(!paths::legacy_teams_dir(home.path()).exists());
    let team = paths::team_dir(home.path(), "myteam");
    assert!(team.join("agents").join("tyson").join("bio.md").is_file());
    assert!(team.join("workspaces").join("myrepo").is_dir());
    assert!(!team.join("repos").exists());
}

#[test]
fn migration_is_idempotent() {
    let home = tempfile::tempdir().unwrap();
    seed_legacy_layout(home.path());

    assert!(migrate_teams_to_projects(home.path()).unwrap());
    assert!(!migrate_teams_to_projects(home.path()).unwrap());
    assert!(!migrate_teams_to_projects(home.path()).unwrap());
    assert!(paths::team_dir(home.path(), "myteam").is_dir());
}

#[test]
fn migration_completes_a_partial_previous_run() {
    let home = tempfile::tempdir().unwrap();
    // The top-level rename succeeded previously, the per-team rename and
    // the sentinel did not.
    let team = paths::projects_dir(home.path()).join("myteam");
    std::fs::create_dir_all(team.join("repos").join("myrepo")).unwrap();

    assert!(migrate_teams_to_projects(home.path()).unwrap());
    assert!(team.join("workspaces").join("myrepo").is_dir());
    assert!(!team.join("repos").exists());
}

#[test]
fn migration_on_a_fresh_home_is_a_no_op() {
    let home = tempfile::tempdir().unwrap();
    assert!(!migrate_teams_to_projects(home.path()).unwrap());
}

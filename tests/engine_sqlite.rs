//! End-to-end engine runs against an on-disk rule database, a snapshot file
//! and the activity journal, all configured through a TOML file.

#![cfg(feature = "sqlite")]

mod common;

use std::path::{Path, PathBuf};

use backup_ruletree::prelude::*;
use common::file;

struct Setup {
    _dir: tempfile::TempDir,
    config: PathBuf,
    journal: PathBuf,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = common::write_snapshot(
        dir.path(),
        "s.tree",
        "/s/",
        &[
            file("/s/a/x.txt", 1, 10, 5),
            file("/s/a/y.csv", 1, 10, 7),
            file("/s/b/z.txt", 2, 10, 11),
        ],
    );

    let mut config = Config::default();
    config.rules.database = dir.path().join("rules.sqlite3");
    config.snapshots.files = vec![snapshot];
    config.journal.path = dir.path().join("activity.jsonl");
    config.paths.data_dir = dir.path().to_path_buf();

    let path = dir.path().join("config.toml");
    std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
    Setup {
        journal: config.journal.path.clone(),
        config: path,
        _dir: dir,
    }
}

fn open(config: &Path) -> Engine {
    Engine::open(Config::load(Some(config)).unwrap()).unwrap()
}

fn events(journal: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(journal)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn rules_survive_a_restart() {
    let setup = setup();

    let rule_id = {
        let engine = open(&setup.config);
        assert_eq!(engine.mounts(), vec!["/s/"]);
        engine.claim("/s/a/", "alice").unwrap();
        let change = engine
            .create_rule("/s/a/", Rule::new(0, "*.txt", BackupType::IBackup))
            .unwrap();
        assert_eq!(change.builds.len(), 1);
        change.rule.id
    };

    let engine = open(&setup.config);
    let claimed = engine.directory("/s/a/").unwrap();
    assert_eq!(claimed.directory.claimed_by, "alice");
    assert_eq!(claimed.rules["*.txt"].id, rule_id);
    assert_eq!(engine.rule_for("/s/a/x.txt"), rule_id);
    assert_eq!(engine.rule_for("/s/b/z.txt"), 0);

    let summary = engine.summary("/s/").unwrap();
    assert_eq!(summary.rule(rule_id).unwrap().totals(), (1, 5));
    assert_eq!(summary.rule(0).unwrap().totals(), (2, 18));
    assert_eq!(summary.children["a/"].claimed_by, "alice");

    engine.remove_rule("/s/a/", "*.txt").unwrap();
    engine.revoke("/s/a/").unwrap();
    drop(engine);

    let engine = open(&setup.config);
    assert!(engine.directory("/s/a/").is_none());
    assert_eq!(engine.summary("/s/").unwrap().totals(), (3, 23));
}

#[test]
fn journal_records_engine_activity() {
    let setup = setup();
    {
        let engine = open(&setup.config);
        engine.claim("/s/b/", "bob").unwrap();
        engine
            .create_rule("/s/b/", Rule::new(0, "*", BackupType::Manual))
            .unwrap();
        let rejected = engine.create_rule("/s/b/", Rule::new(0, "*", BackupType::None));
        assert!(matches!(rejected, Err(BrtError::RuleExists { .. })));
        engine.journal().flush();
    }
    drop(open(&setup.config));

    let events = events(&setup.journal);
    let kinds: Vec<&str> = events
        .iter()
        .map(|event| event["event"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "engine_start",
            "tree_loaded",
            "directory_claimed",
            "rule_added",
            "engine_start",
            "tree_loaded",
        ]
    );

    let added = &events[3];
    assert_eq!(added["path"], "/s/b/");
    assert_eq!(added["pattern"], "*");
    assert_eq!(added["backup_type"], "manual");
    assert_eq!(added["rebuilt"][0], "/s/");
    assert_eq!(events[4]["directories"], 1);
    assert_eq!(events[4]["rules"], 1);
    assert_eq!(events[0]["config_hash"], events[4]["config_hash"]);
}

#[test]
fn explicit_config_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, BrtError::MissingConfig { .. }));
    assert_eq!(err.kind(), ErrorKind::Config);
}

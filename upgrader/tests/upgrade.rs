use std::path::Path;

use upgrader::versions::v2_1;
use upgrader::{
    Controller, DatabaseApi, InsertMode, MigrationStep, Namespace, Operator, Outcome, Registry,
    SchemaRegistry, SchemaVersion, SettingKey, Settings, SqliteDatabase, UpgradeConfig, Value,
};

fn open(path: &Path) -> SqliteDatabase {
    SqliteDatabase::open(path, std::time::Duration::from_secs(5)).unwrap()
}

/// A 2.0 forum with a little of everything the upgrade converts.
fn seed_legacy_forum(path: &Path) {
    let mut db = open(path);
    for table in SchemaRegistry::builtin().tables(SchemaVersion::V2_0) {
        db.create_table(table).unwrap();
    }
    let mut settings = Settings::new(&mut db);
    settings.set(SettingKey::SmfVersion, "2.0.19").unwrap();
    settings.set(SettingKey::Language, "english").unwrap();
    settings.set(SettingKey::EnableOpenId, "1").unwrap();

    let members: Vec<Vec<Value>> = (1..=9i64)
        .map(|id| {
            vec![
                id.into(),
                format!("member{}", id).into(),
                "Friends,Work".into(),
                "english".into(),
            ]
        })
        .collect();
    db.insert(
        InsertMode::Insert,
        "members",
        &["id_member", "member_name", "message_labels", "lngfile"],
        &members,
        &["id_member"],
    )
    .unwrap();

    let recipients: Vec<Vec<Value>> = (1..=9i64)
        .map(|id| vec![(100 + id).into(), id.into(), "-1,1".into()])
        .collect();
    db.insert(
        InsertMode::Insert,
        "pm_recipients",
        &["id_pm", "id_member", "labels"],
        &recipients,
        &["id_pm", "id_member"],
    )
    .unwrap();

    for id in 1..=5i64 {
        db.execute(
            "INSERT INTO attachments (id_attach, filename) VALUES (?1, ?2)",
            &[id.into(), format!("photo{}.jpg", id).into()],
        )
        .unwrap();
    }
}

fn config(dir: &Path) -> UpgradeConfig {
    UpgradeConfig {
        database: dir.join("forum.db"),
        state_file: dir.join("state.json"),
        time_budget_secs: 0,
        batch_size: 2,
        ..UpgradeConfig::default()
    }
}

#[test]
fn upgrade_survives_a_fresh_process_per_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    seed_legacy_forum(&config.database);

    let alice = Operator::new(1, "alice");
    let mut invocations = 0;
    let outcome = loop {
        invocations += 1;
        assert!(invocations < 500, "upgrade did not finish");
        // nothing survives between invocations except the database and the state file
        let controller = Controller::upgrade(config.clone());
        let mut db = open(&config.database);
        let report = controller.invoke(&mut db, &alice);
        if report.outcome != Outcome::Continue {
            break report.outcome;
        }
    };
    assert_eq!(outcome, Outcome::Finished);
    assert!(!config.state_file.exists());

    let mut db = open(&config.database);
    let labels = db
        .query("SELECT COUNT(*) AS n FROM pm_labels", &[])
        .unwrap();
    assert_eq!(labels[0].int("n").unwrap(), 18);
    let labeled = db
        .query("SELECT COUNT(*) AS n FROM pm_labeled_messages", &[])
        .unwrap();
    assert_eq!(labeled[0].int("n").unwrap(), 9);
    let locales = db
        .query("SELECT DISTINCT lngfile FROM members", &[])
        .unwrap();
    assert_eq!(locales.len(), 1);
    assert_eq!(locales[0].text("lngfile").unwrap(), "en_US");
    let unhashed = db
        .query("SELECT COUNT(*) AS n FROM attachments WHERE file_hash = ''", &[])
        .unwrap();
    assert_eq!(unhashed[0].int("n").unwrap(), 0);

    let mut settings = Settings::new(&mut db);
    assert_eq!(settings.get(SettingKey::SmfVersion).unwrap().as_deref(), Some("3.0.0"));
    assert_eq!(settings.get(SettingKey::Language).unwrap().as_deref(), Some("en_US"));
    assert_eq!(settings.get(SettingKey::EnableOpenId).unwrap(), None);
}

#[test]
fn report_serializes_for_polling() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    seed_legacy_forum(&config.database);

    let controller = Controller::upgrade(config.clone());
    let report = controller.invoke(&mut open(&config.database), &Operator::new(1, "alice"));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["tool"], "upgrade");
    assert_eq!(json["outcome"]["status"], "continue");
    assert_eq!(json["phase"], "options");
}

#[test]
fn preview_lists_pending_steps() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    seed_legacy_forum(&config.database);

    let controller = Controller::upgrade(config.clone());
    let previews = controller.preview(&mut open(&config.database)).unwrap();
    assert_eq!(previews[0].id, "v2_1/Adding new tables");
    assert!(previews[0].candidate);
    assert!(previews.iter().any(|p| p.id.starts_with("v3_0/")));
    assert!(previews.iter().all(|p| !p.resuming));
}

fn without_last_step() -> Vec<Box<dyn MigrationStep>> {
    let mut steps = v2_1::steps();
    steps.pop();
    steps
}

#[test]
fn changed_plan_stops_the_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let config = UpgradeConfig {
        target: SchemaVersion::V2_1,
        ..config(dir.path())
    };
    seed_legacy_forum(&config.database);
    let alice = Operator::new(1, "alice");
    let mut db = open(&config.database);

    let shortened = Registry::try_new(vec![Namespace {
        version: SchemaVersion::V2_1,
        steps: without_last_step,
    }])
    .unwrap();
    let controller = Controller::upgrade(config.clone()).with_registry(shortened);
    // welcome, options, backup, then the first migration step
    for _ in 0..4 {
        assert_eq!(controller.invoke(&mut db, &alice).outcome, Outcome::Continue);
    }
    assert!(controller.status().unwrap().unwrap().plan.is_some());

    let report = Controller::upgrade(config).invoke(&mut db, &alice);
    assert_eq!(report.phase, "migrate");
    match report.outcome {
        Outcome::Failed { fatal, message } => {
            assert!(fatal);
            assert!(message.contains("plan changed"), "{}", message);
        }
        other => panic!("expected a failure, got {:?}", other),
    }
}

//! Steps taking a 2.1 forum to 3.0.

use super::{CreateNewTables, SyncSchema};
use crate::db::{transactional, Value};
use crate::error::Error;
use crate::schema::SchemaVersion;
use crate::settings::SettingKey;
use crate::step::{BatchProgress, MigrationStep, StepContext};

const VERSION: SchemaVersion = SchemaVersion::V3_0;

pub fn steps() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(CreateNewTables(VERSION)),
        Box::new(LanguageCodes),
        Box::new(DropSecretQuestion),
        Box::new(SyncSchema(VERSION)),
    ]
}

/// Legacy language pack names and the locale that replaces each.
const LANGUAGE_CODES: [(&str, &str); 6] = [
    ("english", "en_US"),
    ("english_british", "en_GB"),
    ("german", "de_DE"),
    ("french", "fr_FR"),
    ("spanish_es", "es_ES"),
    ("dutch", "nl_NL"),
];

fn locale_for(language: &str) -> Option<&'static str> {
    LANGUAGE_CODES
        .iter()
        .find(|(legacy, _)| *legacy == language)
        .map(|(_, locale)| *locale)
}

fn legacy_placeholders() -> String {
    vec!["?"; LANGUAGE_CODES.len()].join(", ")
}

/// Replaces legacy language names in `members.lngfile` and the forum default with locales.
/// The offset is the last processed `id_member`.
pub struct LanguageCodes;

impl MigrationStep for LanguageCodes {
    fn name(&self) -> String {
        "Converting language names to locales".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        if let Some(language) = ctx.settings().get(SettingKey::Language)? {
            if locale_for(&language).is_some() {
                return Ok(true);
            }
        }
        let legacy = LANGUAGE_CODES
            .iter()
            .map(|(legacy, _)| Value::from(*legacy))
            .collect::<Vec<_>>();
        let rows = ctx.db.query(
            &format!(
                "SELECT 1 FROM members WHERE lngfile IN ({}) LIMIT 1",
                legacy_placeholders()
            ),
            &legacy,
        )?;
        Ok(!rows.is_empty())
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let finished = ctx.batched(|ctx, batch| {
            let members = ctx.db.query(
                "SELECT id_member, lngfile FROM members WHERE id_member > ?1 ORDER BY id_member LIMIT ?2",
                &[batch.start.into(), batch.size.into()],
            )?;
            let mut last = batch.start;
            transactional(ctx.db, |db| {
                for member in &members {
                    let id_member = member.int("id_member")?;
                    if let Some(locale) = locale_for(&member.text("lngfile")?) {
                        db.execute(
                            "UPDATE members SET lngfile = ?1 WHERE id_member = ?2",
                            &[locale.into(), id_member.into()],
                        )?;
                    }
                    last = id_member as u64;
                }
                Ok(())
            })?;
            Ok(if (members.len() as u64) < batch.size {
                BatchProgress::Done
            } else {
                BatchProgress::Next(last)
            })
        })?;
        if !finished {
            return Ok(false);
        }

        let mut settings = ctx.settings();
        if let Some(language) = settings.get(SettingKey::Language)? {
            if let Some(locale) = locale_for(&language) {
                settings.set(SettingKey::Language, locale)?;
            }
        }
        Ok(true)
    }
}

pub struct DropSecretQuestion;

impl MigrationStep for DropSecretQuestion {
    fn name(&self) -> String {
        "Removing secret questions".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        ctx.db.column_exists("members", "secret_question")
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        ctx.db.drop_column("members", "secret_question")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseApi, InsertMode};
    use crate::settings::Settings;
    use crate::testing::StepHarness;

    #[test]
    fn languages_become_locales() {
        let mut harness = StepHarness::at(SchemaVersion::V2_1)
            .with_batch_size(2)
            .with_exhausted_budget();
        let languages = ["english", "german", "klingon", "english_british", ""];
        let rows: Vec<Vec<Value>> = languages
            .iter()
            .enumerate()
            .map(|(i, language)| vec![Value::from(i + 1), Value::from(*language)])
            .collect();
        harness
            .db()
            .insert(InsertMode::Insert, "members", &["id_member", "lngfile"], &rows, &["id_member"])
            .unwrap();
        Settings::new(harness.db())
            .set(SettingKey::Language, "french")
            .unwrap();

        assert!(harness.is_candidate(&LanguageCodes).unwrap());
        assert!(!harness.execute_once(&LanguageCodes).unwrap());
        assert_eq!(harness.state().start, 2);
        // the forum default is converted only once every member is
        assert_eq!(
            Settings::new(harness.db()).get(SettingKey::Language).unwrap().as_deref(),
            Some("french")
        );
        assert_eq!(harness.run_to_completion(&LanguageCodes).unwrap(), 2);

        let converted = harness
            .db()
            .query("SELECT lngfile FROM members ORDER BY id_member", &[])
            .unwrap();
        let converted: Vec<String> = converted.iter().map(|r| r.text("lngfile").unwrap()).collect();
        assert_eq!(converted, vec!["en_US", "de_DE", "klingon", "en_GB", ""]);
        assert_eq!(
            Settings::new(harness.db()).get(SettingKey::Language).unwrap().as_deref(),
            Some("fr_FR")
        );
        assert!(!harness.is_candidate(&LanguageCodes).unwrap());
        harness.assert_idempotent(&LanguageCodes);
    }

    #[test]
    fn language_conversion_survives_interruption() {
        let invocations = StepHarness::assert_resumable(SchemaVersion::V2_1, &LanguageCodes, 2, |harness| {
            for (id, language) in [(1i64, "english"), (2, "german"), (3, "dutch"), (4, "english")] {
                harness
                    .db()
                    .execute(
                        "INSERT INTO members (id_member, lngfile) VALUES (?1, ?2)",
                        &[id.into(), language.into()],
                    )
                    .unwrap();
            }
            Settings::new(harness.db())
                .set(SettingKey::Language, "german")
                .unwrap();
        });
        assert!(invocations >= 2, "{} invocations", invocations);
    }

    #[test]
    fn converted_forum_is_not_a_candidate() {
        let mut harness = StepHarness::at(SchemaVersion::V2_1);
        harness
            .db()
            .execute("INSERT INTO members (lngfile) VALUES ('en_US')", &[])
            .unwrap();
        assert!(!harness.is_candidate(&LanguageCodes).unwrap());
    }

    #[test]
    fn secret_question_is_dropped() {
        let mut harness = StepHarness::at(SchemaVersion::V2_1);
        assert!(harness.is_candidate(&DropSecretQuestion).unwrap());
        harness.assert_idempotent(&DropSecretQuestion);
        harness.assert_column_not_exists("members", "secret_question").unwrap();
    }
}

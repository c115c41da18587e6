//! Integration tests from a caller's perspective.
//!
//! These tests drive the public API the way an HTTP handler or agent tool
//! would right before a database call: load configuration, rewrite a
//! statement for a principal, assess its risk, filter the answer, and reload
//! rules while requests are in flight.
//!
//! Run: `cargo test --test governance_integration`

use std::path::Path;

const RULES_V1: &str = r#"
permissions:
  - table: students
    roles:
      - role_pattern: "stu"
        allowed_operations: [SELECT]
        row_filter: "legacy_owner = '{username}'"
      - user_type: student
        allowed_operations: [SELECT, UPDATE]
        forbidden_columns: [password]
        row_filter: "sid = '{username}'"
  - table: choices
    roles:
      - user_type: student
        allowed_operations: [SELECT, INSERT]
        row_filter: "sid = '{username}'"
  - table: teacher
    roles:
      - user_type: student
        allowed_operations: [SELECT]
        allowed_columns: []
"#;

const RULES_V2: &str = r#"
permissions:
  - table: students
    roles:
      - user_type: student
        allowed_operations: [SELECT]
        row_filter: "owner_v2 = '{username}'"
  - table: choices
    roles:
      - user_type: student
        allowed_operations: [SELECT]
        row_filter: "owner_v2 = '{username}'"
"#;

/// Replace `path` in one rename so a concurrent reader never sees a
/// half-written file.
fn write_atomically(path: &Path, contents: &str) {
    let dir = path.parent().unwrap();
    let mut tmp = tempfile::NamedTempFile::new_in(dir).unwrap();
    std::io::Write::write_all(&mut tmp, contents.as_bytes()).unwrap();
    tmp.persist(path).unwrap();
}

// ============================================================================
// 1. Configuration Journey
// ============================================================================
mod configuration {
    use std::collections::HashMap;

    use sql_governance::logging::LogFormat;
    use sql_governance::{GovernanceConfig, RiskLevel, SqlGovernance};

    #[test]
    fn test_environment_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SQLGOV_PERMISSIONS_PATH", "/etc/sqlgov/rules.yaml"),
            ("SQLGOV_MAX_ALLOWED_RISK", "high"),
            ("SQLGOV_SENSITIVE_TABLES", "salaries, grades"),
            ("SQLGOV_LOG_FORMAT", "json"),
        ]);
        let config =
            GovernanceConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.permissions_path.to_str(), Some("/etc/sqlgov/rules.yaml"));
        assert!(config.safety.risk_thresholds.allows(RiskLevel::High));
        assert!(!config.safety.risk_thresholds.allows(RiskLevel::Critical));
        assert_eq!(config.safety.sensitive_tables, vec!["salaries", "grades"]);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_environment_value_is_rejected() {
        let result = GovernanceConfig::from_lookup(|key| {
            (key == "SQLGOV_MAX_QUERY_COMPLEXITY").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_permission_file_never_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = GovernanceConfig {
            permissions_path: dir.path().join("absent.yaml"),
            ..GovernanceConfig::default()
        };
        let governance = SqlGovernance::new(&config);

        let err = governance
            .check_and_transform_query("SELECT * FROM students", "stu001", Some("student"))
            .unwrap_err();
        assert!(err.reason().contains("not allowed to SELECT"));
        assert!(governance.reload_permissions().is_err());
    }

    #[test]
    fn test_sample_permission_file_loads() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/permissions.yaml");
        let store = sql_governance::PermissionStore::try_load(path).unwrap();
        assert!(store.snapshot().table_count() >= 4);
    }
}

// ============================================================================
// 2. Risk Assessment Journey
// ============================================================================
mod risk_assessment {
    use sql_governance::safety::InjectionDetector;
    use sql_governance::{
        AssessmentContext, RiskLevel, SafetyCheckType, SafetyManager, SchemaInfo,
    };

    const QUERIES: &[&str] = &[
        "SELECT name FROM courses",
        "SELECT * FROM t WHERE 1=1 UNION SELECT pw FROM admin",
        "SELECT email FROM students WHERE email = 'jane@example.com'",
        "DELETE FROM choices",
        "SELECT COUNT(*) FROM choices GROUP BY cid",
        "SELECT 1; DROP TABLE students",
        "SELECT * FROM users WHERE name = '' OR 'a'='a'",
    ];

    #[test]
    fn test_overall_risk_dominates_every_failed_check() {
        let manager = SafetyManager::default();
        for query in QUERIES {
            let assessment = manager.assess_query(query, None);
            assert_eq!(assessment.results.len(), 4, "{query}");
            for failed in assessment.failed_checks() {
                assert!(
                    assessment.overall_risk >= failed.risk_level,
                    "{query}: {:?} above overall {:?}",
                    failed.check_type,
                    assessment.overall_risk
                );
            }
            assert_eq!(assessment.block_reason.is_some(), assessment.blocked);
        }
    }

    #[test]
    fn test_union_injection_is_blocked() {
        let query = "SELECT * FROM t WHERE 1=1 UNION SELECT pw FROM admin";
        let detections = InjectionDetector::default().detect(query);
        assert!(detections.iter().any(|d| d.confidence >= 0.9));

        let assessment = SafetyManager::default().assess_query(query, None);
        assert!(matches!(
            assessment.overall_risk,
            RiskLevel::High | RiskLevel::Critical
        ));
        assert!(assessment.blocked);
        assert!(!SafetyManager::default().is_safe_to_execute(&assessment));
        assert!(
            assessment
                .recommendations
                .iter()
                .any(|r| r.contains("injection"))
        );
    }

    #[test]
    fn test_plain_select_is_allowed() {
        let manager = SafetyManager::default();
        let assessment = manager.assess_query("SELECT name FROM courses", None);
        assert!(!assessment.blocked);
        assert_eq!(assessment.overall_risk, RiskLevel::Medium);
        let injection = assessment.result(SafetyCheckType::SqlInjection).unwrap();
        assert!(!injection.passed);
    }

    #[test]
    fn test_schema_context_flags_sensitive_tables() {
        let context = AssessmentContext::with_schema(SchemaInfo::with_tables(["users", "courses"]));
        let assessment =
            SafetyManager::default().assess_query("SELECT id FROM users", Some(&context));
        let validation = assessment.result(SafetyCheckType::QueryComplexity).unwrap();
        assert!(!validation.passed);
        assert!(validation.message.contains("sensitive table: users"));
    }

    #[test]
    fn test_assessment_serializes_to_json() {
        let assessment = SafetyManager::default().assess_query("DELETE FROM choices", None);
        let json = assessment.to_json();
        assert_eq!(json["overall_risk"], "high");
        assert_eq!(json["blocked"], true);
        assert_eq!(json["results"].as_array().unwrap().len(), 4);
        assert!(json["timestamp"].is_string());
    }
}

// ============================================================================
// 3. Output Filtering Journey
// ============================================================================
mod output_filtering {
    use sql_governance::{RiskLevel, SafetyManager};

    #[test]
    fn test_redaction_round_trip() {
        let manager = SafetyManager::default();
        let result = manager.assess_output("contact a@b.com", "SELECT email FROM students");

        assert!(!result.passed);
        assert_eq!(result.risk_level, RiskLevel::High);
        let filtered = result.filtered_output().unwrap();
        assert!(!filtered.contains("a@b.com"));
        assert_eq!(filtered.matches("[REDACTED]").count(), 1);
        assert_eq!(manager.safe_output("contact a@b.com", &result), filtered);
    }

    #[test]
    fn test_one_marker_per_span() {
        let manager = SafetyManager::default();
        let output = "Jane: jane@example.com, 555-123-4567, from 10.0.0.7";
        let result = manager.assess_output(output, "");
        let filtered = result.filtered_output().unwrap();
        assert_eq!(filtered.matches("[REDACTED]").count(), 3);
        assert!(filtered.starts_with("Jane: [REDACTED]"));
    }

    #[test]
    fn test_clean_output_passes_through() {
        let manager = SafetyManager::default();
        let result = manager.assess_output("12 students enrolled", "");
        assert!(result.passed);
        assert_eq!(result.filtered_output(), None);
        assert_eq!(manager.safe_output("12 students enrolled", &result), "12 students enrolled");
    }
}

// ============================================================================
// 4. Permission Resolution Journey
// ============================================================================
mod permission_resolution {
    use sql_governance::permissions::PermissionSource;
    use sql_governance::{PermissionStore, Principal};

    use super::RULES_V1;

    #[test]
    fn test_unconfigured_table_is_default_deny() {
        let store = PermissionStore::from_yaml_str(RULES_V1).unwrap();
        let perm = store.resolve("grades", &Principal::new("stu001").with_user_type("student"));
        assert!(perm.allowed_operations.is_empty());
        assert_eq!(perm.row_filter.as_deref(), Some("1=0"));
    }

    #[test]
    fn test_user_type_rule_beats_role_pattern() {
        let store = PermissionStore::from_yaml_str(RULES_V1).unwrap();
        let perm = store.resolve("students", &Principal::new("stu001").with_user_type("student"));
        assert_eq!(perm.source, PermissionSource::UserType("student".to_string()));
        assert_eq!(perm.row_filter.as_deref(), Some("sid = 'stu001'"));

        let legacy = store.resolve("students", &Principal::new("stu001"));
        assert_eq!(legacy.row_filter.as_deref(), Some("legacy_owner = 'stu001'"));
    }
}

// ============================================================================
// 5. Query Rewriting Journey
// ============================================================================
mod query_rewriting {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use sql_governance::{
        PermissionChecker, PermissionStore, Principal, SafetyManager, SqlGovernance, Verdict,
    };

    use super::RULES_V1;

    fn governance() -> SqlGovernance {
        let store = PermissionStore::from_yaml_str(RULES_V1).unwrap();
        SqlGovernance::from_parts(
            SafetyManager::default(),
            PermissionChecker::new(Arc::new(store)),
        )
    }

    #[test]
    fn test_filter_added_without_where() {
        let (sql, warnings) = governance()
            .check_and_transform_query("SELECT * FROM students", "stu001", Some("student"))
            .unwrap();
        assert_eq!(sql.trim(), "SELECT * FROM students WHERE (sid = 'stu001')");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn test_filter_conjoined_before_order_by() {
        let (sql, warnings) = governance()
            .check_and_transform_query(
                "SELECT * FROM students WHERE age > 18 ORDER BY sid",
                "stu001",
                Some("student"),
            )
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM students WHERE (age > 18) AND (sid = 'stu001') ORDER BY sid"
        );
        assert!(sql.ends_with("ORDER BY sid"));
        assert!(!warnings.is_empty());
    }

    #[test]
    fn test_delete_without_permission_is_refused() {
        let result = governance().check_and_transform_query(
            "DELETE FROM students WHERE sid='stu001'",
            "stu001",
            Some("student"),
        );
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Permission denied: User stu001 is not allowed to DELETE on table students"
        );
    }

    #[test]
    fn test_insert_keeps_original_text() {
        let sql = "INSERT INTO choices (sid, cid) VALUES ('stu001', 7)";
        let (out, warnings) = governance()
            .check_and_transform_query(sql, "stu001", Some("student"))
            .unwrap();
        assert_eq!(out, sql);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_update_gets_row_filter() {
        let (sql, _) = governance()
            .check_and_transform_query(
                "UPDATE students SET phone = '1' WHERE sid = 'stu002'",
                "stu001",
                Some("student"),
            )
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE students SET phone = '1' WHERE (sid = 'stu002') AND (sid = 'stu001')"
        );
    }

    #[test]
    fn test_wholly_inaccessible_table() {
        let err = governance()
            .check_and_transform_query("SELECT name FROM teacher", "stu001", Some("student"))
            .unwrap_err();
        assert!(err.reason().contains("teacher"));
    }

    #[test]
    fn test_unlisted_tables_are_never_read_unchecked() {
        let governance = governance();
        for sql in [
            "SELECT * FROM students UNION TABLE grades",
            "SELECT * FROM students WHERE sid IN (SELECT sid FROM grades)",
            "SELECT * FROM students WHERE sid IN (TABLE grades)",
            "SELECT * FROM students #",
        ] {
            let result = governance.check_and_transform_query(sql, "stu001", Some("student"));
            assert!(result.is_err(), "{sql} was let through: {result:?}");
        }
    }

    #[test]
    fn test_column_access() {
        let governance = governance();
        assert!(governance.check_column_access("students", "name", "stu001", Some("student")));
        assert!(!governance.check_column_access("students", "password", "stu001", Some("student")));
    }

    #[test]
    fn test_authorize_end_to_end() {
        let principal = Principal::new("stu001").with_user_type("student");
        let verdict = governance()
            .authorize_query("SELECT cid FROM choices", &principal, None)
            .unwrap();
        let Verdict::Approved { sql, .. } = verdict else {
            panic!("expected approval");
        };
        assert_eq!(sql, "SELECT cid FROM choices WHERE (sid = 'stu001')");
    }
}

// ============================================================================
// 6. Hot Reload Journey
// ============================================================================
mod hot_reload {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use sql_governance::{Operation, PermissionChecker, PermissionStore, Principal};

    use super::{RULES_V1, RULES_V2, write_atomically};

    const JOINED: &str = "SELECT * FROM students s JOIN choices c ON c.sid = s.sid";
    const OLD: &str = "SELECT * FROM students s JOIN choices c ON c.sid = s.sid \
                       WHERE (sid = 'stu001') AND (sid = 'stu001')";
    const NEW: &str = "SELECT * FROM students s JOIN choices c ON c.sid = s.sid \
                       WHERE (owner_v2 = 'stu001') AND (owner_v2 = 'stu001')";

    #[test]
    fn test_explicit_reload_replaces_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.yaml");
        write_atomically(&path, RULES_V1);
        let store = PermissionStore::load(&path);
        let student = Principal::new("stu001").with_user_type("student");
        assert!(store.resolve("students", &student).allows(Operation::Update));

        write_atomically(&path, RULES_V2);
        store.reload().unwrap();
        assert!(!store.resolve("students", &student).allows(Operation::Update));
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn test_concurrent_checks_see_whole_rule_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.yaml");
        write_atomically(&path, RULES_V1);

        let checker = PermissionChecker::new(Arc::new(PermissionStore::load(&path)));
        let student = Principal::new("stu001").with_user_type("student");
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let checker = checker.clone();
                let student = student.clone();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut checks = 0u32;
                    while !done.load(Ordering::SeqCst) || checks == 0 {
                        let (sql, _) = checker.check_and_transform_query(JOINED, &student).unwrap();
                        assert!(sql == OLD || sql == NEW, "mixed rule sets: {sql}");
                        checks += 1;
                    }
                    checks
                })
            })
            .collect();

        for round in 0..50 {
            let rules = if round % 2 == 0 { RULES_V2 } else { RULES_V1 };
            write_atomically(&path, rules);
            checker.reload_permissions().unwrap();
        }
        done.store(true, Ordering::SeqCst);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(checker.store().generation(), 50);
    }

    #[tokio::test]
    async fn test_file_watcher_reloads_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.yaml");
        write_atomically(&path, RULES_V1);
        let store = Arc::new(PermissionStore::load(&path));
        let student = Principal::new("stu001").with_user_type("student");

        let (watcher, handle) = sql_governance::hot_reload::watch_store(Arc::clone(&store)).unwrap();
        assert_eq!(watcher.watched_paths().len(), 1);

        write_atomically(&path, RULES_V2);
        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            if store.generation() > 0 {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "watcher did not trigger a reload");
        assert!(!store.resolve("students", &student).allows(Operation::Update));

        drop(watcher);
        handle.abort();
    }
}

//! End-to-end submission tests over memory destinations.

mod test_harness;

use std::time::Duration;

use jobrelay::error::{RelayError, ValidationError};
use jobrelay::job::JobState;
use jobrelay::orchestrator::SubmitRequest;
use jobrelay::store::JobStore;

use test_harness::{alice, make_archive, TestService};

const WC_CONFIG: &str = r#"
job_root_dir: "{job_root}"
applications:
  wc:
    command_template: "wc README.md"
    upload_needs: [README.md]
destinations:
  local:
    scheduler: {type: memory, slots: 1}
    filesystem: {type: local}
"#;

const ECHO_CONFIG: &str = r#"
job_root_dir: "{job_root}"
applications:
  echo:
    command_template: "echo {{ msg|q }}"
    input_schema:
      type: object
      properties:
        msg: {type: string}
      required: [msg]
destinations:
  local:
    scheduler: {type: memory, slots: 2}
    filesystem: {type: local}
"#;

fn wc_submit(service: &TestService, archive_name: &str, files: &[(&str, &str)]) -> SubmitRequest {
    let archive = service.job_root.join(archive_name);
    make_archive(&archive, files);
    SubmitRequest {
        application: "wc".to_string(),
        name: "count".to_string(),
        principal: alice(),
        payload: serde_json::json!({}),
        archive,
        token: "token-abc".to_string(),
    }
}

#[tokio::test]
async fn happy_path_on_memory_destination() {
    let service = TestService::from_yaml(WC_CONFIG);
    service.start_reconcile();

    let request = wc_submit(&service, "upload.zip", &[("README.md", "hello\n")]);
    let job_id = service.orchestrator.submit(request).await.unwrap();

    let job = service
        .wait_for_state(job_id, JobState::Ok, Duration::from_secs(10))
        .await;
    assert_eq!(job.destination, "local");
    assert_eq!(job.exit_code, Some(0));
    assert!(job.internal_id.is_some());

    let stdout = service.read_job_file(job_id, "stdout.txt").await;
    let fields: Vec<&str> = stdout.split_whitespace().collect();
    assert_eq!(fields, vec!["1", "1", "6", "README.md"]);
    let returncode = service.read_job_file(job_id, "returncode").await;
    assert_eq!(returncode.trim(), "0");
}

#[tokio::test]
async fn missing_required_upload_creates_no_job() {
    let service = TestService::from_yaml(WC_CONFIG);
    let request = wc_submit(&service, "upload.zip", &[("other.txt", "nope\n")]);

    let err = service.orchestrator.submit(request).await.unwrap_err();
    match err {
        RelayError::Validation(ValidationError::MissingUpload(files)) => {
            assert_eq!(files, vec!["README.md".to_string()]);
        }
        other => panic!("expected MissingUpload, got {other}"),
    }
    // no job row was created
    assert!(service.store.get_job(1).await.is_err());
    assert!(service.store.list_non_terminal().await.unwrap().is_empty());
}

#[tokio::test]
async fn templated_injection_stays_an_argument() {
    let service = TestService::from_yaml(ECHO_CONFIG);
    service.start_reconcile();

    let archive = service.job_root.join("upload.zip");
    make_archive(&archive, &[("placeholder.txt", "")]);
    let job_id = service
        .orchestrator
        .submit(SubmitRequest {
            application: "echo".to_string(),
            name: String::new(),
            principal: alice(),
            payload: serde_json::json!({"msg": "; rm -rf /"}),
            archive,
            token: "token-abc".to_string(),
        })
        .await
        .unwrap();

    let job = service
        .wait_for_state(job_id, JobState::Ok, Duration::from_secs(10))
        .await;
    assert_eq!(job.exit_code, Some(0));
    let stdout = service.read_job_file(job_id, "stdout.txt").await;
    assert_eq!(stdout, "; rm -rf /\n");
    // nothing outside the job directory was touched
    assert!(service.job_dir(job_id).join("input").is_dir());
}

const ROTATION_CONFIG: &str = r#"
job_root_dir: "{job_root}"
destination_picker: round
applications:
  echo:
    command_template: "echo done"
destinations:
  d1:
    scheduler: {type: memory, slots: 1}
  d2:
    scheduler: {type: memory, slots: 1}
  d3:
    scheduler: {type: memory, slots: 1}
"#;

#[tokio::test]
async fn rotating_picker_round_robins_destinations() {
    let service = TestService::from_yaml(ROTATION_CONFIG);
    service.start_reconcile();

    let mut assigned = Vec::new();
    for n in 0..7 {
        let archive = service.job_root.join(format!("upload-{n}.zip"));
        make_archive(&archive, &[("anything.txt", "x")]);
        let job_id = service
            .orchestrator
            .submit(SubmitRequest {
                application: "echo".to_string(),
                name: format!("job-{n}"),
                principal: alice(),
                payload: serde_json::json!({}),
                archive,
                token: String::new(),
            })
            .await
            .unwrap();
        let job = service.store.get_job(job_id).await.unwrap();
        assigned.push(job.destination);
    }
    assert_eq!(assigned, vec!["d1", "d2", "d3", "d1", "d2", "d3", "d1"]);
}

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_jobs() {
    let service = TestService::from_yaml(WC_CONFIG);
    service.start_reconcile();

    let request = wc_submit(&service, "upload.zip", &[("README.md", "hello\n")]);
    let job_id = service.orchestrator.submit(request).await.unwrap();
    service
        .wait_for_state(job_id, JobState::Ok, Duration::from_secs(10))
        .await;

    service.orchestrator.cancel(job_id).await.unwrap();
    service.orchestrator.cancel(job_id).await.unwrap();
    let job = service.store.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Ok);
}

#[tokio::test]
async fn failing_command_finishes_in_error_with_exit_code() {
    const FAIL_CONFIG: &str = r#"
job_root_dir: "{job_root}"
applications:
  fail:
    command_template: "exit 3"
destinations:
  local:
    scheduler: {type: memory, slots: 1}
"#;
    let service = TestService::from_yaml(FAIL_CONFIG);
    service.start_reconcile();

    let archive = service.job_root.join("upload.zip");
    make_archive(&archive, &[("anything.txt", "x")]);
    let job_id = service
        .orchestrator
        .submit(SubmitRequest {
            application: "fail".to_string(),
            name: String::new(),
            principal: alice(),
            payload: serde_json::json!({}),
            archive,
            token: String::new(),
        })
        .await
        .unwrap();

    let job = service
        .wait_for_state(job_id, JobState::Error, Duration::from_secs(10))
        .await;
    assert_eq!(job.exit_code, Some(3));
    assert_eq!(job.reason.as_deref(), Some("command exited with 3"));
}

#[tokio::test]
async fn role_restricted_application_rejects_outsiders() {
    const ROLE_CONFIG: &str = r#"
job_root_dir: "{job_root}"
applications:
  secret:
    command_template: "echo done"
    allowed_roles: [admin]
destinations:
  local:
    scheduler: {type: memory, slots: 1}
"#;
    let service = TestService::from_yaml(ROLE_CONFIG);
    let archive = service.job_root.join("upload.zip");
    make_archive(&archive, &[("anything.txt", "x")]);

    let err = service
        .orchestrator
        .submit(SubmitRequest {
            application: "secret".to_string(),
            name: String::new(),
            principal: alice(),
            payload: serde_json::json!({}),
            archive,
            token: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::Validation(ValidationError::RoleDenied(_))
    ));
    assert!(service.store.list_non_terminal().await.unwrap().is_empty());
}

#[tokio::test]
async fn job_directory_layout_matches_contract() {
    let service = TestService::from_yaml(WC_CONFIG);
    service.start_reconcile();

    let request = wc_submit(&service, "upload.zip", &[("README.md", "hello\n")]);
    let job_id = service.orchestrator.submit(request).await.unwrap();
    service
        .wait_for_state(job_id, JobState::Ok, Duration::from_secs(10))
        .await;

    let dir = service.job_dir(job_id);
    assert!(dir.join("input/README.md").is_file());
    assert!(dir.join("output").is_dir());
    assert!(dir.join("stdout.txt").is_file());
    assert!(dir.join("stderr.txt").is_file());
    assert!(dir.join("returncode").is_file());
    assert!(dir.join(".scheduler_handle").is_file());
    let meta = service.read_job_file(job_id, "meta").await;
    assert_eq!(meta.lines().last(), Some("token-abc"));
}

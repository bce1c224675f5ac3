//! Configuration parsing: tagged scheduler/filesystem unions, defaults,
//! validation, environment override.

use std::path::PathBuf;

use jobrelay::config::{
    Config, FilesystemConfig, SchedulerConfig, JOB_ROOT_DIR_ENV,
};
use jobrelay::error::ConfigError;

const FULL_CONFIG: &str = r#"
job_root_dir: /var/lib/jobrelay/jobs
destination_picker: round
applications:
  haddock:
    command_template: "haddock3 {{ workflow|q }}"
    upload_needs: [workflow.cfg]
    input_schema:
      type: object
      properties:
        workflow: {type: string}
      required: [workflow]
    allowed_roles: [expert]
    summary: Run a docking workflow
interactive_applications:
  rescore:
    command_template: "rescore {{ module|q }}"
    job_application: haddock
    timeout: 10
    input_schema:
      type: object
      properties:
        module: {type: string}
destinations:
  local:
    scheduler:
      type: memory
      slots: 4
  cluster:
    scheduler:
      type: slurm
      partition: short
      time: "60"
      extra_options: ["--nodes 1"]
      ssh_config:
        hostname: headnode
        port: 10022
        username: xenon
    filesystem:
      type: sftp
      entry: /scratch/jobs
      ssh_config:
        hostname: headnode
        port: 10022
        username: xenon
  redis:
    scheduler:
      type: arq
      redis_dsn: redis://broker:6379
      queue: "work:queue"
      max_jobs: 5
      job_timeout: 120
  grid:
    scheduler:
      type: dirac
      storage_element: SE-DISK
      proxy: /tmp/x509up_u1000
    filesystem:
      type: dirac
      lfn_root: /vo/jobs
      storage_element: SE-DISK
"#;

#[test]
fn parses_every_scheduler_and_filesystem_variant() {
    let mut config: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
    config.validate().unwrap();

    assert_eq!(config.job_root_dir, PathBuf::from("/var/lib/jobrelay/jobs"));
    assert_eq!(config.destination_picker, "round");

    let local = &config.destinations["local"];
    assert_eq!(local.scheduler, SchedulerConfig::Memory { slots: 4 });
    assert_eq!(local.filesystem, FilesystemConfig::Local);

    match &config.destinations["cluster"].scheduler {
        SchedulerConfig::Slurm {
            ssh_config,
            partition,
            time,
            extra_options,
        } => {
            assert_eq!(partition.as_deref(), Some("short"));
            assert_eq!(time.as_deref(), Some("60"));
            assert_eq!(extra_options, &vec!["--nodes 1".to_string()]);
            let ssh = ssh_config.as_ref().unwrap();
            assert_eq!(ssh.hostname, "headnode");
            assert_eq!(ssh.port, 10022);
            assert_eq!(ssh.username.as_deref(), Some("xenon"));
        }
        other => panic!("expected slurm scheduler, got {other:?}"),
    }
    match &config.destinations["cluster"].filesystem {
        FilesystemConfig::Sftp { entry, .. } => {
            assert_eq!(entry, &PathBuf::from("/scratch/jobs"));
        }
        other => panic!("expected sftp filesystem, got {other:?}"),
    }

    match &config.destinations["redis"].scheduler {
        SchedulerConfig::Arq {
            redis_dsn,
            queue,
            max_jobs,
            job_timeout,
        } => {
            assert_eq!(redis_dsn, "redis://broker:6379");
            assert_eq!(queue, "work:queue");
            assert_eq!(*max_jobs, 5);
            assert_eq!(*job_timeout, 120);
        }
        other => panic!("expected arq scheduler, got {other:?}"),
    }

    match &config.destinations["grid"].scheduler {
        SchedulerConfig::Dirac {
            storage_element,
            proxy,
            apptainer_image,
        } => {
            assert_eq!(storage_element, "SE-DISK");
            assert_eq!(proxy, &Some(PathBuf::from("/tmp/x509up_u1000")));
            assert!(apptainer_image.is_none());
        }
        other => panic!("expected dirac scheduler, got {other:?}"),
    }

    let interactive = &config.interactive_applications["rescore"];
    assert_eq!(interactive.job_application.as_deref(), Some("haddock"));
    assert!((interactive.timeout - 10.0).abs() < f64::EPSILON);
}

#[test]
fn interactive_timeout_defaults_to_thirty_seconds() {
    let yaml = r#"
job_root_dir: /tmp/jobs
applications:
  app: {command_template: "true"}
interactive_applications:
  peek: {command_template: "ls output"}
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    assert!((config.interactive_applications["peek"].timeout - 30.0).abs() < f64::EPSILON);
}

#[test]
fn empty_destinations_fall_back_to_local_memory() {
    let yaml = r#"
job_root_dir: /tmp/jobs
applications:
  app: {command_template: "true"}
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    assert_eq!(config.destinations.len(), 1);
    let fallback = &config.destinations["local"];
    assert_eq!(fallback.scheduler, SchedulerConfig::Memory { slots: 1 });
    assert_eq!(fallback.filesystem, FilesystemConfig::Local);
}

#[test]
fn rejects_configs_without_applications() {
    let yaml = r#"
job_root_dir: /tmp/jobs
applications: {}
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn rejects_relative_job_root() {
    let yaml = r#"
job_root_dir: relative/jobs
applications:
  app: {command_template: "true"}
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn rejects_interactive_referencing_unknown_application() {
    let yaml = r#"
job_root_dir: /tmp/jobs
applications:
  app: {command_template: "true"}
interactive_applications:
  peek:
    command_template: "ls"
    job_application: missing
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn environment_variable_overrides_job_root() {
    let yaml = r#"
job_root_dir: /var/lib/jobrelay/jobs
applications:
  app: {command_template: "true"}
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    std::env::set_var(JOB_ROOT_DIR_ENV, "/srv/override");
    config.apply_env_overrides();
    std::env::remove_var(JOB_ROOT_DIR_ENV);
    assert_eq!(config.job_root_dir, PathBuf::from("/srv/override"));
}

//! Running commands through an OCI runtime. These need root, `runc` on
//! PATH and registry access, so they are ignored by default.

#![cfg(target_os = "linux")]

use std::fs;

use stevedore::{ChildStatus, Isolation, RunOptions, StevedoreError};
use stevedore_test_utils::{TEST_IMAGE, TestEnv};

fn command(script: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
}

fn oci_options() -> RunOptions {
    RunOptions {
        isolation: Some(Isolation::Oci),
        ..RunOptions::default()
    }
}

#[tokio::test]
#[ignore = "requires root, runc and network access"]
async fn exit_status_is_reported() {
    let env = TestEnv::new();
    let mut builder = env.builder(TEST_IMAGE).await;

    builder.run(&command("true"), oci_options()).unwrap();

    let err = builder.run(&command("exit 3"), oci_options()).unwrap_err();
    match err {
        StevedoreError::RunFailed { status, .. } => assert_eq!(status, ChildStatus::Exited(3)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        builder.run(&command("exit 7"), oci_options()).unwrap_err().exit_code(),
        7
    );
}

#[tokio::test]
#[ignore = "requires root, runc and network access"]
async fn writes_land_in_the_container_layer() {
    let env = TestEnv::new();
    let mut builder = env.builder(TEST_IMAGE).await;
    let options = RunOptions {
        hostname: Some("myhost".into()),
        ..oci_options()
    };
    builder
        .run(&command("hostname > /hostname.out && ulimit -n > /nofile.out"), options)
        .unwrap();

    let root = builder.mount().unwrap();
    assert_eq!(fs::read_to_string(root.join("hostname.out")).unwrap().trim(), "myhost");
    assert!(!fs::read_to_string(root.join("nofile.out")).unwrap().trim().is_empty());
}

#[tokio::test]
#[ignore = "requires root, runc and network access"]
async fn generated_files_do_not_persist() {
    let env = TestEnv::new();
    let mut builder = env.builder(TEST_IMAGE).await;
    builder.run(&command("test -s /etc/resolv.conf"), oci_options()).unwrap();

    let root = builder.mount().unwrap();
    let leftovers: Vec<_> = fs::read_dir(root.join("run"))
        .map(|dir| dir.flatten().map(|e| e.file_name()).collect())
        .unwrap_or_default();
    assert!(!leftovers.iter().any(|name| name == "secrets"), "{leftovers:?}");
}

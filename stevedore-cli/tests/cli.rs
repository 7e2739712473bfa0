use predicates::prelude::*;
use rstest::rstest;

mod common;

#[test]
fn test_help_lists_commands() {
    let mut ctx = common::stevedore();
    ctx.cmd
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("commit"))
        .stdout(predicate::str::contains("run"));
}

#[rstest]
#[case(&["--isolation", "vm", "containers"])]
#[case(&["run", "work"])]
#[case(&["commit"])]
#[case(&["rm"])]
fn test_bad_arguments_rejected(#[case] args: &[&str]) {
    let mut ctx = common::stevedore();
    ctx.cmd.args(args).assert().failure();
}

#[test]
fn test_containers_empty() {
    let ctx = common::stevedore();
    assert_eq!(ctx.output(&["containers", "-q"]), "");
}

#[test]
fn test_from_scratch_then_rm() {
    let ctx = common::stevedore();
    let name = ctx.output(&["from", "scratch"]);
    assert_eq!(name, "working-container");

    let second = ctx.output(&["from", "--name", "second", "scratch"]);
    assert_eq!(second, "second");
    assert_eq!(ctx.output(&["containers", "-q"]).lines().count(), 2);

    ctx.new_cmd()
        .args(["rm", "second"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^[0-9a-f]{64}\n$").unwrap());
    ctx.output(&["rm", "--all"]);
    assert_eq!(ctx.output(&["containers", "-q"]), "");
}

#[test]
fn test_rm_unknown_container_fails() {
    let mut ctx = common::stevedore();
    ctx.cmd
        .args(["rm", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_config_then_commit_to_archive() {
    let ctx = common::stevedore();
    let name = ctx.output(&["from", "scratch"]);
    let file = ctx.root.join("a");
    std::fs::write(&file, vec![0u8; 1234]).unwrap();

    ctx.output(&["copy", &name, file.to_str().unwrap(), "/a"]);
    ctx.output(&["config", "--env", "A=1", "--label", "stage=test", &name]);

    let archive = ctx.root.join("out.tar");
    let target = format!("oci-archive:{}", archive.display());
    let id = ctx.output(&["commit", &name, &target]);
    assert_eq!(id.len(), 64);

    let image = stevedore_test_utils::read_oci_archive(&archive);
    assert_eq!(image.layers, vec![vec![("a".to_string(), 1234)]]);
    assert_eq!(image.config["config"]["Env"][0], "A=1");
    assert_eq!(image.config["config"]["Labels"]["stage"], "test");
}

#[test]
fn test_commit_to_storage_lists_image() {
    let ctx = common::stevedore();
    let name = ctx.output(&["from", "scratch"]);
    let id = ctx.output(&["commit", "--rm", &name, "built"]);
    assert!(ctx.output(&["images", "-q"]).contains(&id[..12]));
    assert_eq!(ctx.output(&["containers", "-q"]), "");
}

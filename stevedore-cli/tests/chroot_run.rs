//! Commands run under chroot isolation. They need root and registry
//! access, so they are ignored by default.

mod common;

fn from_image(ctx: &common::TestContext, name: &str) -> String {
    let _ = ctx.new_cmd().args(["rm", name]).ok();
    ctx.output(&["from", "--name", name, "--isolation", "chroot", common::TEST_IMAGE])
}

#[test]
#[ignore = "requires root and network access"]
fn test_hostname_is_applied() {
    let ctx = common::with_image();
    let name = from_image(&ctx, "chroot-hostname");
    ctx.new_cmd()
        .args(["run", "--hostname", "myhost", &name, "hostname"])
        .assert()
        .success()
        .stdout("myhost\n");
    ctx.output(&["rm", &name]);
}

#[test]
#[ignore = "requires root and network access"]
fn test_ulimit_is_applied() {
    let ctx = common::with_image();
    let name = from_image(&ctx, "chroot-ulimit");
    ctx.new_cmd()
        .args(["run", "--ulimit", "nofile=128:256", &name, "sh", "-c", "ulimit -n"])
        .assert()
        .success()
        .stdout("128\n");
    ctx.output(&["rm", &name]);
}

#[test]
#[ignore = "requires root and network access"]
fn test_secret_is_mounted_then_removed() {
    let ctx = common::with_image();
    let name = from_image(&ctx, "chroot-secret");
    ctx.new_cmd()
        .env("X_VAL", "hello")
        .args([
            "run",
            "--secret",
            "x=env:X_VAL",
            "--mount",
            "type=secret,id=x",
            &name,
            "cat",
            "/run/secrets/x",
        ])
        .assert()
        .success()
        .stdout("hello");

    ctx.new_cmd()
        .args(["run", &name, "test", "-e", "/run/secrets/x"])
        .assert()
        .failure()
        .code(1);
    ctx.output(&["rm", &name]);
}

#[test]
#[ignore = "requires root and network access"]
fn test_exit_code_is_propagated() {
    let ctx = common::with_image();
    let name = from_image(&ctx, "chroot-exit");
    ctx.new_cmd()
        .args(["run", &name, "sh", "-c", "exit 3"])
        .assert()
        .code(3);
    ctx.output(&["rm", &name]);
}

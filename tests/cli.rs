use std::process::Command;

#[test]
fn help_lists_both_workflows() {
    let exe = env!("CARGO_BIN_EXE_rotate-iam");
    let output = Command::new(exe)
        .arg("--help")
        .output()
        .expect("failed to run rotate-iam binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("rotate"));
    assert!(stdout.contains("update-ecr"));
}

#[test]
fn missing_cluster_access_is_a_setup_failure() {
    let exe = env!("CARGO_BIN_EXE_rotate-iam");
    let output = Command::new(exe)
        .arg("rotate")
        .env("KUBECONFIG", "/nonexistent/kubeconfig")
        .env_remove("KUBERNETES_SERVICE_HOST")
        .env_remove("KUBERNETES_SERVICE_PORT")
        .output()
        .expect("failed to run rotate-iam binary");
    assert_eq!(output.status.code(), Some(3));
}

use std::env;
use std::process::Command;

fn main() {
    let now = chrono::Utc::now().to_rfc3339();
    println!("cargo:rustc-env=BUILD_TIME={}", now);

    // Short git sha, "unknown" outside a checkout
    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                Some(String::from_utf8_lossy(&o.stdout).trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_SHA={}", git_sha);

    let service = env::var("APP_SERVICE").unwrap_or_else(|_| "sprintcore".to_string());
    let env_name = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    println!("cargo:rustc-env=APP_SERVICE_DEFAULT={}", service);
    println!("cargo:rustc-env=APP_ENV_DEFAULT={}", env_name);
    println!("cargo:rerun-if-env-changed=APP_SERVICE");
    println!("cargo:rerun-if-env-changed=APP_ENV");
}

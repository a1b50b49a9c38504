use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest_dir.to_path_buf())
}

fn apply_coverage_env(cmd: &mut Command) {
    let Some(profile) = std::env::var_os("LLVM_PROFILE_FILE") else {
        return;
    };
    let profile = PathBuf::from(profile);
    if profile.is_absolute() {
        return;
    }
    let absolute = workspace_root().join(profile);
    if let Some(parent) = absolute.parent() {
        let _ = fs::create_dir_all(parent);
    }
    cmd.env("LLVM_PROFILE_FILE", absolute);
}

pub fn can_bind_local_ports() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn wait_for<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[allow(dead_code)]
pub struct TestServer {
    child: Option<Child>,
    pub port: u16,
    pub config_dir: TempDir,
    client: reqwest::Client,
}

#[allow(dead_code)]
impl TestServer {
    /// Start the daemon against a fresh config dir seeded with `files`.
    pub fn start(files: &[(&str, &str)]) -> Self {
        let config_dir = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(config_dir.path().join(name), content).unwrap();
        }
        let port = pick_port();

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_perch-server"));
        cmd.args([
            "--config-dir",
            config_dir.path().to_string_lossy().as_ref(),
            "--listen",
            &format!("127.0.0.1:{port}"),
            "--readiness-timeout-secs",
            "10",
        ])
        .env("RUST_LOG", "warn")
        .env("SHELL", "/bin/sh")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
        apply_coverage_env(&mut cmd);
        let mut child = cmd.spawn().expect("failed to start perch-server");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut startup_error: Option<String> = None;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                startup_error = Some(format!("perch-server exited early: {status}"));
                break;
            }
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return Self {
                    child: Some(child),
                    port,
                    config_dir,
                    client: reqwest::Client::builder()
                        .timeout(Duration::from_secs(10))
                        .build()
                        .unwrap(),
                };
            }
            thread::sleep(Duration::from_millis(50));
        }

        let _ = child.kill();
        let _ = child.wait();
        panic!(
            "{}",
            startup_error.unwrap_or_else(|| "perch-server never started listening".to_string())
        );
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn get_json(&self, path: &str) -> serde_json::Value {
        let response = self.get(path).await;
        assert!(response.status().is_success(), "{path}: {}", response.status());
        response.json().await.unwrap()
    }

    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub fn write_config(&self, name: &str, content: &str) {
        fs::write(self.config_dir.path().join(name), content).unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        // SIGTERM lets the daemon stop its apps before exiting.
        unsafe {
            libc::kill(child.id() as i32, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

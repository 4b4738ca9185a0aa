use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;

pub const MASTER_KEY: &str = "integration-master-key";
pub const ACCESS_KEY: &str = "join-key";
pub const USER_PASSWORD: &str = "alice-password";
pub const NODE_PASSWORD: &str = "node-password";

/// Find a free TCP port by binding to port 0
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for port {} to be ready", port);
        }
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Get the path to a compiled binary in the target directory
fn cargo_bin(name: &str) -> PathBuf {
    let mut path = std::env::current_exe()
        .expect("Failed to get current exe")
        .parent()
        .expect("No parent")
        .parent()
        .expect("No grandparent")
        .to_path_buf();
    path.push(name);
    if path.exists() {
        return path;
    }

    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // integration-tests -> workspace root
    path.push("target");
    path.push("debug");
    path.push(name);
    if path.exists() {
        return path;
    }

    panic!(
        "Binary '{}' not found. Run `cargo build --workspace` first.",
        name
    );
}

fn config_toml(alice_hash: &str) -> String {
    format!(
        r#"
[server]
name = "srv"
master_key = "{master}"
token_secret = "integration-signing-secret"
traffic_public_key = "server-traffic-key"
propagation_timeout_secs = 1

[[networks]]
name = "n1"
address_range = "10.20.0.0/24"
default_listen_port = 51820

[[networks.access_keys]]
name = "bootstrap"
value = "{key}"
uses = 50

[[networks]]
name = "n2"
address_range = "10.30.0.0/24"
allow_manual_signup = true

[[networks]]
name = "scarce"
address_range = "10.40.0.0/24"

[[networks.access_keys]]
name = "single"
value = "{key}"
uses = 1

[[users]]
username = "alice"
password_hash = "{hash}"
networks = ["n1"]
"#,
        master = MASTER_KEY,
        key = ACCESS_KEY,
        hash = alice_hash,
    )
}

/// A control plane process with its own config and database
pub struct TestControl {
    pub port: u16,
    process: Child,
    _temp_dir: TempDir,
    db_path: PathBuf,
    config_path: PathBuf,
    pub http: reqwest::Client,
}

impl TestControl {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("control.db");
        let config_path = temp_dir.path().join("control.toml");

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(USER_PASSWORD.as_bytes(), &salt)
            .expect("Failed to hash password")
            .to_string();
        std::fs::write(&config_path, config_toml(&hash)).expect("Failed to write config");

        let port = find_free_port();
        let process = spawn_control(port, &db_path, &config_path);
        wait_for_port(port, Duration::from_secs(10)).await;

        Self {
            port,
            process,
            _temp_dir: temp_dir,
            db_path,
            config_path,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn process_mut(&mut self) -> &mut Child {
        &mut self.process
    }

    /// Restart on a new port with the same database and config
    pub async fn restart(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();

        let port = find_free_port();
        self.process = spawn_control(port, &self.db_path, &self.config_path);
        wait_for_port(port, Duration::from_secs(10)).await;
        self.port = port;
    }

    /// Send a request and return the status with the decoded JSON body
    pub async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (reqwest::StatusCode, Value) {
        let mut req = self.http.request(method, self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.expect("Request failed");
        let status = resp.status();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Register a node with the shared access key, returning the `response` payload
    pub async fn register(&self, network: &str, name: &str) -> Value {
        let (status, body) = self
            .call(
                reqwest::Method::POST,
                &format!("/api/nodes/{}", network),
                None,
                Some(node_draft(name)),
            )
            .await;
        assert_eq!(status, 200, "registration of {} failed: {}", name, body);
        body["response"].clone()
    }

    /// Log a node in and return its token
    pub async fn node_token(&self, network: &str, node_id: &str) -> String {
        let (status, body) = self
            .call(
                reqwest::Method::POST,
                &format!("/api/nodes/adm/{}/authenticate", network),
                None,
                Some(json!({ "id": node_id, "password": NODE_PASSWORD })),
            )
            .await;
        assert_eq!(status, 200, "node login failed: {}", body);
        body["response"]["auth_token"].as_str().unwrap().to_string()
    }
}

impl Drop for TestControl {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn spawn_control(port: u16, db_path: &std::path::Path, config_path: &std::path::Path) -> Child {
    Command::new(cargo_bin("netmesh-control"))
        .args(["--bind", &format!("127.0.0.1:{}", port)])
        .args(["--db-path", db_path.to_str().unwrap()])
        .args(["--config", config_path.to_str().unwrap()])
        .args(["--log-level", "debug"])
        .env_remove("NETMESH_MASTER_KEY")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("Failed to start control plane")
}

pub fn node_draft(name: &str) -> Value {
    json!({
        "name": name,
        "public_key": format!("pk-{}", name),
        "password": NODE_PASSWORD,
        "traffic_keys": { "mine": format!("traffic-{}", name) },
        "access_key": ACCESS_KEY,
    })
}

pub fn node_id(registered: &Value) -> String {
    registered["node"]["id"].as_str().unwrap().to_string()
}

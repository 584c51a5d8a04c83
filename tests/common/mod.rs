//! Common test utilities for integration tests.

use dfs::client::{Client, ControllerClient};
use dfs::config::DfsConfig;
use dfs::shutdown::ShutdownCoordinator;
use dfs::types::{ComponentAddress, FileLocations};
use std::future::Future;
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Find an available port for testing.
pub fn find_available_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// Test environment that manages temporary directories and cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub client_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let client_dir = temp_dir.path().join("client");
        let output_dir = temp_dir.path().join("output");

        std::fs::create_dir_all(&client_dir).expect("Failed to create client dir");
        std::fs::create_dir_all(&output_dir).expect("Failed to create output dir");

        Self {
            temp_dir,
            client_dir,
            output_dir,
        }
    }

    /// Creates a sub-directory in the temp dir
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create subdir");
        path
    }

    /// Creates a test file with random content
    pub fn create_test_file(&self, name: &str, size: usize) -> (PathBuf, Vec<u8>) {
        use rand::Rng;
        let path = self.temp_dir.path().join(name);
        let mut content = vec![0u8; size];
        rand::thread_rng().fill(&mut content[..]);
        std::fs::write(&path, &content).expect("Failed to write test file");
        (path, content)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a TCP port to accept connections.
pub async fn wait_for_port(port: u16, timeout_secs: u64) -> bool {
    let start = Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Configuration with short timings for tests.
pub fn fast_config(replication_factor: usize) -> DfsConfig {
    let mut config = DfsConfig::development();
    config.controller.heartbeat_check_interval = Duration::from_millis(100);
    config.controller.max_heartbeat_age = Duration::from_millis(800);
    config.controller.replication_factor = replication_factor;
    config.controller.replication_interval = Duration::from_millis(200);
    config.storage.heartbeat_interval = Duration::from_millis(100);
    config.client.chunk_size = 64 * 1024;
    config
}

/// One storage node running in-process.
pub struct TestNode {
    pub addr: ComponentAddress,
    pub chunks_dir: PathBuf,
    shutdown: ShutdownCoordinator,
    handle: Option<JoinHandle<dfs::Result<()>>>,
}

impl TestNode {
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

/// A controller plus storage nodes on localhost.
pub struct TestCluster {
    pub env: TestEnv,
    pub config: DfsConfig,
    pub controller: ComponentAddress,
    pub nodes: Vec<TestNode>,
    controller_shutdown: ShutdownCoordinator,
    controller_handle: Option<JoinHandle<dfs::Result<()>>>,
}

impl TestCluster {
    /// Start a controller and `num_nodes` storage nodes, and wait until the
    /// controller sees all of them.
    pub async fn start(num_nodes: usize, replication_factor: usize) -> Self {
        let env = TestEnv::new();
        let mut config = fast_config(replication_factor);
        config.client.chunks_dir = env.client_dir.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let controller_addr = listener.local_addr().unwrap();
        config.controller.bind_addr = controller_addr;
        config.storage.controller_addr = controller_addr.to_string();

        let controller_shutdown = ShutdownCoordinator::new();
        let controller_handle = {
            let config = config.clone();
            let shutdown = controller_shutdown.clone();
            tokio::spawn(async move { dfs::run_controller(&config, listener, shutdown).await })
        };

        let mut cluster = Self {
            env,
            config,
            controller: ComponentAddress::new("127.0.0.1", controller_addr.port()),
            nodes: Vec::new(),
            controller_shutdown,
            controller_handle: Some(controller_handle),
        };

        for _ in 0..num_nodes {
            cluster.add_node().await;
        }
        assert!(
            cluster.wait_for_online(num_nodes, Duration::from_secs(5)).await,
            "storage nodes did not come online"
        );
        cluster
    }

    /// Start one more storage node, returning its index.
    pub async fn add_node(&mut self) -> usize {
        let chunks_dir = self.env.subdir(&format!("node{}", self.nodes.len()));
        self.start_node_in(chunks_dir).await
    }

    /// Start a storage node on an existing chunk directory.
    pub async fn start_node_in(&mut self, chunks_dir: PathBuf) -> usize {
        let index = self.nodes.len();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = self.config.clone();
        config.storage.bind_addr = listener.local_addr().unwrap();
        config.storage.advertise_host = "127.0.0.1".to_string();
        config.storage.chunks_dir = chunks_dir.clone();
        let addr = config.storage.advertise_address();

        let shutdown = ShutdownCoordinator::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dfs::run_storage_node(&config, listener, shutdown).await })
        };

        self.nodes.push(TestNode {
            addr,
            chunks_dir,
            shutdown,
            handle: Some(handle),
        });
        index
    }

    /// Stop one storage node and wait for it to exit.
    pub async fn stop_node(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.shutdown.shutdown();
        if let Some(handle) = node.handle.take() {
            let result = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("storage node did not stop")
                .unwrap();
            assert!(result.is_ok(), "storage node failed: {:?}", result);
        }
    }

    pub fn controller_client(&self) -> ControllerClient {
        ControllerClient::new(self.controller.clone())
    }

    pub fn client(&self) -> Client {
        Client::new(self.controller_client(), self.config.client.clone())
            .with_max_frame_size(self.config.connection.max_frame_size)
    }

    pub async fn online_nodes(&self) -> Vec<ComponentAddress> {
        self.controller_client()
            .storage_nodes()
            .await
            .unwrap_or_default()
    }

    pub async fn wait_for_online(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || async move { self.online_nodes().await.len() == count }).await
    }

    pub async fn placement(&self, filename: &str) -> FileLocations {
        self.controller_client().locate(filename).await.unwrap()
    }

    /// Wait until every chunk of `filename` is listed on `replicas` nodes.
    pub async fn wait_for_replicas(&self, filename: &str, chunks: usize, replicas: usize) -> bool {
        wait_until(Duration::from_secs(10), || async move {
            let placement = self.placement(filename).await;
            placement.chunks.len() == chunks
                && placement.chunks.iter().all(|c| c.nodes.len() == replicas)
        })
        .await
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.env.output_dir.join(name)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown.shutdown();
            if let Some(handle) = &node.handle {
                handle.abort();
            }
        }
        self.controller_shutdown.shutdown();
        if let Some(handle) = &self.controller_handle {
            handle.abort();
        }
    }
}

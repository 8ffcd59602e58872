//! Common test utilities and helpers.

#![allow(dead_code)]

use matrix_media_store::{
    config::{
        AuthConfig, Config, LoggingConfig, MediaConfig, QueueConfig, ServerConfig,
        StorageConfig, StorageProvider, ThumbnailFallback,
    },
    create_router, AppState,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::TcpListener;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener as TokioTcpListener;
use tokio_util::sync::CancellationToken;

pub const SERVER_NAME: &str = "localhost";
pub const ALICE_TOKEN: &str = "alice_token";
pub const BOB_TOKEN: &str = "bob_token";

/// Test server instance
pub struct TestServer {
    pub public_url: String,
    pub data_dir: TempDir,
    pub state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl TestServer {
    /// Start a test server with default settings
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a test server after adjusting its configuration
    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let port = get_available_port();
        let data_dir = TempDir::new().expect("Failed to create temp dir");

        let public_url = format!("http://127.0.0.1:{}", port);

        let mut config = create_test_config(&data_dir, port);
        configure(&mut config);

        let state = AppState::new(config)
            .await
            .expect("Failed to create app state");

        let cancel = CancellationToken::new();
        state
            .spawn_thumbnail_workers(cancel.clone())
            .await
            .expect("Failed to start workers");

        let app = create_router(state.clone());

        let addr: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let listener = TokioTcpListener::bind(addr)
            .await
            .expect("Failed to bind listener");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        // Start server in background
        tokio::spawn(async move {
            tokio::select! {
                _ = axum::serve(listener, app) => {}
                _ = shutdown_rx => {}
            }
        });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            public_url,
            data_dir,
            state,
            shutdown_tx: Some(shutdown_tx),
            cancel,
        }
    }

    /// Get HTTP client
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    /// Get URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.public_url, path)
    }

    /// Get URL for a path under `/_matrix/media/v3`
    pub fn media(&self, path: &str) -> String {
        format!("{}/_matrix/media/v3{}", self.public_url, path)
    }

    /// Upload bytes as alice, returning the response
    pub async fn upload(&self, filename: &str, content_type: &str, data: Vec<u8>) -> reqwest::Response {
        self.upload_as(ALICE_TOKEN, filename, content_type, data).await
    }

    /// Upload bytes with the given token
    pub async fn upload_as(
        &self,
        token: &str,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> reqwest::Response {
        self.client()
            .post(self.media("/upload"))
            .query(&[("filename", filename)])
            .bearer_auth(token)
            .header("content-type", content_type)
            .body(data)
            .send()
            .await
            .expect("Failed to send upload")
    }

    /// Upload and return the new media ID
    pub async fn upload_ok(&self, filename: &str, content_type: &str, data: Vec<u8>) -> String {
        let response = self.upload(filename, content_type, data).await;
        assert_eq!(response.status(), 200, "upload failed");
        let json: Value = response.json().await.unwrap();
        json["media_id"].as_str().unwrap().to_string()
    }

    /// Number of directories left in the temp upload area
    pub fn temp_entries(&self) -> usize {
        std::fs::read_dir(self.state.config.storage.temp_path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Create test configuration
fn create_test_config(data_dir: &TempDir, port: u16) -> Config {
    let mut access_tokens = HashMap::new();
    access_tokens.insert(ALICE_TOKEN.to_string(), "@alice:localhost".to_string());
    access_tokens.insert(BOB_TOKEN.to_string(), "@bob:localhost".to_string());

    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            server_name: SERVER_NAME.to_string(),
            cache_max_age: 3600,
        },
        storage: StorageConfig {
            provider: StorageProvider::Local,
            base_path: data_dir.path().to_path_buf(),
            temp_dir: "tmp".to_string(),
            database_dir: "rocksdb".to_string(),
            key_prefix: String::new(),
            public_bucket: "public".to_string(),
            private_bucket: "private".to_string(),
            s3: None,
            gcs: None,
        },
        media: MediaConfig {
            max_file_size_bytes: 10 * 1024 * 1024,
            dynamic_thumbnails: false,
            thumbnail_fallback: ThumbnailFallback::Nearest,
            max_thumbnail_dimension: 2048,
            max_thumbnail_generators: 2,
            thumbnail_sizes: vec![],
        },
        queue: QueueConfig::default(),
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        },
        auth: AuthConfig { access_tokens },
    }
}

/// Find an available TCP port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Create a test PNG image
pub fn create_test_png(width: u32, height: u32) -> Vec<u8> {
    use image::codecs::png::PngEncoder;
    use image::{ImageBuffer, ImageEncoder, Rgb};

    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            ((x * 255) / width) as u8,
            ((y * 255) / height) as u8,
            128,
        ])
    });

    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(&mut buffer);
    encoder
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .expect("Failed to encode PNG");

    buffer
}

/// Create a test JPEG image
pub fn create_test_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageBuffer, ImageEncoder, Rgb};

    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            ((x * 255) / width) as u8,
            ((y * 255) / height) as u8,
            200,
        ])
    });

    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .expect("Failed to encode JPEG");

    buffer
}
